//! Container orchestration layer.
//!
//! Talks to a rootless Docker/Podman engine via `bollard`, never by shelling
//! out to a CLI binary. [`engine`] is the uniform operation contract the rest
//! of the runtime calls for create/start/stop/exec/logs; [`exec_tracker`] is a
//! small in-process map the agent runner uses to remember which session
//! launched which exec id, separate from the engine's own view of exec state.

mod client;
mod engine;
mod exec_tracker;

pub use client::{ContainerClient, ContainerClientConfig, RuntimeType};
pub use engine::{
    ContainerEngine, ContainerStateInfo, EngineExecStatus, ExecByteStream, ExecOutcome,
    ExecToFileHandle, ObservedStatus, SessionContainerEntry, Signal,
};
pub use exec_tracker::ExecTracker;

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Docker/Podman API error
    #[error("Container API error: {0}")]
    ApiError(#[from] bollard::errors::Error),

    /// Container not found
    #[error("Container not found: {0}")]
    NotFound(String),

    /// Container execution error
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// General error
    #[error("Container error: {0}")]
    Other(String),
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;
