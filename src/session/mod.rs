//! Sessions: the entity, its state machine, and the lifecycle manager that
//! coordinates the workspace provisioner and the container engine around it.

pub mod manager;
pub mod model;

pub use manager::{CreateSessionRequest, SessionManager};
pub use model::{Session, SessionStatus};
