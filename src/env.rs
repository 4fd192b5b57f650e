//! Path constants and helpers for on-disk runtime state.
//!
//! Centralizes the layout of the `.agentrt` directory under a workspace root:
//! the session/message/execution store, the credential staging area, and the
//! config discovery locations (mirrored in [`crate::config`]).

use std::path::{Path, PathBuf};

/// Root directory name for all runtime state.
pub const RUNTIME_DIR_NAME: &str = ".agentrt";

/// Store subdirectory and file names.
pub mod store {
    pub const STORE_DIR_NAME: &str = "store";
    pub const SESSIONS_FILE_NAME: &str = "sessions.json";
    pub const EXECUTIONS_FILE_NAME: &str = "executions.json";
    pub const MESSAGES_DIR_NAME: &str = "messages";
    pub const AUTH_SESSIONS_FILE_NAME: &str = "auth_sessions.json";
}

/// Build the `.agentrt` directory path from a workspace root.
pub fn runtime_dir_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(RUNTIME_DIR_NAME)
}

/// Build the store directory path.
pub fn store_dir_path(workspace_root: &Path) -> PathBuf {
    runtime_dir_path(workspace_root).join(store::STORE_DIR_NAME)
}

/// Build the sessions table file path.
pub fn sessions_file_path(workspace_root: &Path) -> PathBuf {
    store_dir_path(workspace_root).join(store::SESSIONS_FILE_NAME)
}

/// Build the agent-executions table file path.
pub fn executions_file_path(workspace_root: &Path) -> PathBuf {
    store_dir_path(workspace_root).join(store::EXECUTIONS_FILE_NAME)
}

/// Build the auth-sessions table file path.
pub fn auth_sessions_file_path(workspace_root: &Path) -> PathBuf {
    store_dir_path(workspace_root).join(store::AUTH_SESSIONS_FILE_NAME)
}

/// Build the messages directory path (one append-only file per session).
pub fn messages_dir_path(workspace_root: &Path) -> PathBuf {
    store_dir_path(workspace_root).join(store::MESSAGES_DIR_NAME)
}

/// Build a specific session's message log file path.
pub fn session_messages_file_path(workspace_root: &Path, session_id: uuid::Uuid) -> PathBuf {
    messages_dir_path(workspace_root).join(format!("{session_id}.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_under_runtime_dir() {
        let root = Path::new("/workspace");
        assert_eq!(runtime_dir_path(root), Path::new("/workspace/.agentrt"));
        assert_eq!(sessions_file_path(root), Path::new("/workspace/.agentrt/store/sessions.json"));
        assert_eq!(
            executions_file_path(root),
            Path::new("/workspace/.agentrt/store/executions.json")
        );
        let id = uuid::Uuid::nil();
        assert_eq!(
            session_messages_file_path(root, id),
            Path::new(format!("/workspace/.agentrt/store/messages/{id}.jsonl").as_str())
        );
    }
}
