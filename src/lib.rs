//! Agent session runtime.
//!
//! Orchestrates long-running coding-agent sessions, each pinned to its own
//! container: clone a repository, launch a `claude`-style CLI inside the
//! container per user turn, stream its output back over an in-process event
//! bus, and keep the on-disk session/message/execution tables in sync with
//! whatever the container engine actually reports, even across a crash.
//!
//! ## Components
//!
//! - [`container`]: adapter over the container engine (create/start/stop/exec).
//! - [`workspace`]: clones and shared git-cache volume provisioning.
//! - [`session`]: the session entity, its state machine, and the lifecycle
//!   manager that drives create/start/stop/delete.
//! - [`agent`]: one CLI invocation per user turn, its streamed output, and
//!   reconnection to an invocation orphaned by a crash.
//! - [`events`]: the in-process event bus and its subscription transport.
//! - [`reconcile`]: the startup-and-periodic pass that reconciles stored
//!   session state against what the container engine actually reports.
//! - [`credentials`]: the host-credential-directory watcher that pushes
//!   updated credentials into every running session container.
//! - [`auth`]: bearer-token sessions with idle expiry and rotation.
//! - [`store`]: append-only, crash-safe persistence for sessions, messages,
//!   and agent executions.
//! - [`cli`]: the operator-facing command-line front end.

pub mod errors;
pub mod config;
pub mod env;

#[cfg(feature = "containers")]
pub mod container;

pub mod workspace;
pub mod session;
pub mod store;
pub mod agent;
pub mod events;
pub mod reconcile;
pub mod credentials;
pub mod auth;
pub mod cli;

pub use config::RuntimeConfig;
pub use errors::{Result, RuntimeError};
pub use session::{Session, SessionManager, SessionStatus};
pub use store::Store;
