//! Process-wide persistent store.
//!
//! Owns the Session, Message and AgentExecution tables. Grounded on
//! `session::persistence::PersistenceManager`'s atomic temp-then-rename writes,
//! generalized from one whole-session-tree-per-file to three independent tables
//! with the consistency guarantees each table actually needs: dense per-session
//! sequence numbers, global message-id uniqueness, and a single execution row
//! per session.

mod executions;
mod messages;
mod sessions;

pub use executions::AgentExecution;
pub use messages::{Message, MessageType};

use tracing::warn;
use uuid::Uuid;

use crate::errors::Result;
use crate::session::model::Session;
use executions::ExecutionStore;
use messages::{InsertOutcome, MessageStore};
use sessions::SessionStore;

pub struct Store {
    sessions: SessionStore,
    messages: MessageStore,
    executions: ExecutionStore,
}

impl Store {
    pub async fn open(workspace_root: &std::path::Path) -> Result<Self> {
        let sessions = SessionStore::load(crate::env::sessions_file_path(workspace_root)).await?;
        let messages = MessageStore::load(crate::env::messages_dir_path(workspace_root)).await?;
        let executions = ExecutionStore::load(crate::env::executions_file_path(workspace_root)).await?;
        Ok(Self { sessions, messages, executions })
    }

    #[cfg(test)]
    pub async fn open_temp() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Self::open(dir.path()).await.unwrap();
        (store, dir)
    }

    // --- Sessions -------------------------------------------------------

    pub async fn insert_session(&self, session: Session) -> Result<()> {
        self.sessions.insert(session).await
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Session> {
        self.sessions.get(id).await
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.sessions.list().await
    }

    pub async fn update_session(&self, id: Uuid, f: impl FnOnce(&mut Session)) -> Result<Session> {
        self.sessions.update(id, f).await
    }

    /// Cascades to Message rows and the AgentExecution row.
    pub async fn delete_session(&self, id: Uuid) -> Result<Session> {
        let session = self.sessions.delete(id).await?;
        self.messages.delete_session(id).await?;
        let _ = self.executions.delete(id).await;
        Ok(session)
    }

    // --- Messages ---------------------------------------------------------

    pub async fn next_sequence(&self, session_id: Uuid) -> i64 {
        self.messages.next_sequence(session_id).await
    }

    pub async fn list_messages(&self, session_id: Uuid) -> Vec<Message> {
        self.messages.list(session_id).await
    }

    pub async fn last_non_user_message(&self, session_id: Uuid) -> Option<Message> {
        self.messages.last_non_user(session_id).await
    }

    pub async fn update_message_content(&self, session_id: Uuid, message_id: &str, content: String) -> Result<()> {
        self.messages.update_content(session_id, message_id, content).await
    }

    /// Insert one persisted message for `session_id`: read-max-plus-one for the
    /// next sequence number, retry once on a sequence collision, and skip (with
    /// a warning) on a duplicate message-id or a second collision.
    ///
    /// Returns `Ok(None)` when the line was a no-op (duplicate or unresolved
    /// collision); `Ok(Some(message))` when a row was persisted.
    pub async fn append_message(
        &self,
        session_id: Uuid,
        message_id: String,
        message_type: MessageType,
        content: String,
    ) -> Result<Option<Message>> {
        let first_seq = self.messages.next_sequence(session_id).await;
        let (outcome, message) = self
            .messages
            .insert_at(session_id, first_seq, message_id.clone(), message_type, content.clone())
            .await?;

        match outcome {
            InsertOutcome::Inserted => return Ok(message),
            InsertOutcome::DuplicateMessageId => return Ok(None),
            InsertOutcome::SequenceTaken => {}
        }

        let retry_seq = first_seq + 1;
        let (outcome, message) =
            self.messages.insert_at(session_id, retry_seq, message_id, message_type, content).await?;
        match outcome {
            InsertOutcome::Inserted => Ok(message),
            InsertOutcome::DuplicateMessageId => Ok(None),
            InsertOutcome::SequenceTaken => {
                warn!(
                    "sequence collision for session {session_id} at {first_seq} and {retry_seq}; \
                     skipping line, transcript will have a gap"
                );
                Ok(None)
            }
        }
    }

    // --- AgentExecution -----------------------------------------------------

    pub async fn get_execution(&self, session_id: Uuid) -> Option<AgentExecution> {
        self.executions.get(session_id).await
    }

    pub async fn list_executions(&self) -> Vec<AgentExecution> {
        self.executions.list().await
    }

    pub async fn upsert_execution(&self, execution: AgentExecution) -> Result<()> {
        self.executions.upsert(execution).await
    }

    pub async fn update_execution_sequence(&self, session_id: Uuid, last_sequence: i64) -> Result<()> {
        self.executions.update_last_sequence(session_id, last_sequence).await
    }

    pub async fn update_execution_pid(&self, session_id: Uuid, pid: u32) -> Result<()> {
        self.executions.update_pid(session_id, pid).await
    }

    pub async fn delete_execution(&self, session_id: Uuid) -> Result<()> {
        self.executions.delete(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::Session;

    #[tokio::test]
    async fn append_message_allocates_dense_sequences() {
        let (store, _dir) = Store::open_temp().await;
        let session = Session::new("demo", "acme", "widgets", "main", None, "vol-1");
        let session_id = session.id;
        store.insert_session(session).await.unwrap();

        for i in 0..3 {
            let m = store
                .append_message(session_id, format!("m{i}"), MessageType::System, "{}".into())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(m.sequence, i);
        }
    }

    #[tokio::test]
    async fn duplicate_line_is_idempotent() {
        let (store, _dir) = Store::open_temp().await;
        let session_id = Uuid::new_v4();
        let first = store
            .append_message(session_id, "m0".into(), MessageType::Assistant, "a".into())
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .append_message(session_id, "m0".into(), MessageType::Assistant, "a".into())
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.list_messages(session_id).await.len(), 1);
    }

    #[tokio::test]
    async fn delete_session_cascades_messages_and_execution() {
        let (store, _dir) = Store::open_temp().await;
        let session = Session::new("demo", "acme", "widgets", "main", None, "vol-1");
        let session_id = session.id;
        store.insert_session(session).await.unwrap();
        store.append_message(session_id, "m0".into(), MessageType::User, "hi".into()).await.unwrap();
        store
            .upsert_execution(AgentExecution {
                session_id,
                container_id: "c".into(),
                exec_id: "e".into(),
                output_file: "/tmp/o".into(),
                last_sequence: 0,
                pid: None,
                started_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        store.delete_session(session_id).await.unwrap();
        assert!(store.list_messages(session_id).await.is_empty());
        assert!(store.get_execution(session_id).await.is_none());
    }
}
