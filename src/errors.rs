//! Crate-wide error taxonomy.
//!
//! One variant per error class named in the runtime's error-handling design:
//! precondition, not-found, conflict, engine-failure, agent-failure,
//! container-failure, transient. Each carries enough context to render the
//! user-visible strings verbatim.

use uuid::Uuid;

/// Result type used throughout the runtime outside of container-adapter internals.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A required precondition was not met (container not running, token missing, ...).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with state already in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The container engine reported a failure on a required operation.
    #[error("container engine failure: {0}")]
    EngineFailure(String),

    /// The agent CLI exited non-zero for a reason other than interrupt.
    #[error("Claude process exited unexpectedly: {exit_description}")]
    AgentFailure { exit_description: String },

    /// The container died while the agent was running inside it.
    #[error("container stopped unexpectedly: {0}")]
    ContainerFailure(String),

    /// Best-effort operation that failed but should be swallowed by the caller.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Container(#[from] crate::container::ContainerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RuntimeError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{kind} {id}"))
    }

    pub fn session_not_found(id: Uuid) -> Self {
        Self::not_found("session", id)
    }

    pub fn already_running(session_id: Uuid) -> Self {
        Self::Conflict(format!("agent already running for session {session_id}"))
    }

    /// Decode a container exit code into the verbatim exit-code taxonomy text.
    pub fn describe_exit_code(code: i64) -> String {
        match code {
            0 => "success".to_string(),
            130 => "interrupted".to_string(),
            137 => "killed, likely OOM".to_string(),
            139 => "segmentation fault".to_string(),
            143 => "terminated".to_string(),
            n if n >= 128 => format!("killed by signal {}", n - 128),
            n => format!("error code {n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_taxonomy() {
        assert_eq!(RuntimeError::describe_exit_code(0), "success");
        assert_eq!(RuntimeError::describe_exit_code(130), "interrupted");
        assert_eq!(RuntimeError::describe_exit_code(137), "killed, likely OOM");
        assert_eq!(RuntimeError::describe_exit_code(139), "segmentation fault");
        assert_eq!(RuntimeError::describe_exit_code(143), "terminated");
        assert_eq!(RuntimeError::describe_exit_code(134), "killed by signal 6");
        assert_eq!(RuntimeError::describe_exit_code(7), "error code 7");
    }
}
