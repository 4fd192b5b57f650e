//! Agent runner and its supporting pieces.
//!
//! Split across files by concern, all operating on the one [`runner::AgentRunner`]:
//! the launch-and-consume loop (`runner`), the stream-event reassembly
//! (`accumulator`), interrupt handling (`interrupt`), and reconnection to an
//! execution orphaned by a service restart (`reconnect`).

pub mod accumulator;
pub mod interrupt;
pub mod reconnect;
pub mod runner;
pub mod types;

pub use accumulator::{AccumulatorRegistry, PartialContentBlock, PartialSnapshot};
pub use runner::{AgentRunner, SYSTEM_PROMPT};
