//! In-process pub/sub and per-subscriber lazy sequences.
//!
//! Strictly process-local: nothing here is durable. Clients recover missed
//! state by re-reading the message store on (re)connect, not by replaying bus
//! history.

pub mod bus;
pub mod subscription;

pub use bus::{Event, EventBus};
pub use subscription::Subscription;
