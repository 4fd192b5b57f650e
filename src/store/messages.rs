//! Message table.
//!
//! Ordered, append-only per session. Sequence numbers are allocated by
//! reading the current max and adding one; uniqueness is enforced on both
//! `(session-id, sequence)` and `message-id` globally, the latter so a replayed
//! output line never produces a second transcript entry.

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::errors::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    System,
    Result,
}

impl MessageType {
    /// Unknown `type` fields on the wire default to `system`.
    pub fn from_wire_type(wire_type: &str) -> Self {
        match wire_type {
            "user" => MessageType::User,
            "assistant" => MessageType::Assistant,
            "result" => MessageType::Result,
            _ => MessageType::System,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub session_id: Uuid,
    pub sequence: i64,
    pub message_type: MessageType,
    /// Raw event payload, opaque JSON string.
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of attempting to insert one line's worth of output.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateMessageId,
    SequenceTaken,
}

pub(crate) struct MessageStore {
    root: PathBuf,
    by_session: RwLock<HashMap<Uuid, Vec<Message>>>,
    known_ids: DashSet<String>,
}

impl MessageStore {
    pub(crate) async fn load(root: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        let mut by_session = HashMap::new();
        let known_ids = DashSet::new();

        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let Ok(session_id) = Uuid::parse_str(stem) else { continue };
            let text = tokio::fs::read_to_string(&path).await?;
            let mut messages = Vec::new();
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<Message>(line) {
                    Ok(msg) => {
                        known_ids.insert(msg.message_id.clone());
                        messages.push(msg);
                    }
                    Err(e) => warn!("skipping corrupt message row in {:?}: {e}", path),
                }
            }
            messages.sort_by_key(|m| m.sequence);
            by_session.insert(session_id, messages);
        }

        Ok(Self { root, by_session: RwLock::new(by_session), known_ids })
    }

    fn file_path(&self, session_id: Uuid) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl"))
    }

    pub(crate) async fn next_sequence(&self, session_id: Uuid) -> i64 {
        let guard = self.by_session.read().await;
        guard.get(&session_id).and_then(|v| v.last()).map(|m| m.sequence + 1).unwrap_or(0)
    }

    /// Attempt to insert at an explicit sequence; the caller owns retry-on-collision.
    pub(crate) async fn insert_at(
        &self,
        session_id: Uuid,
        sequence: i64,
        message_id: String,
        message_type: MessageType,
        content: String,
    ) -> Result<(InsertOutcome, Option<Message>)> {
        if self.known_ids.contains(&message_id) {
            return Ok((InsertOutcome::DuplicateMessageId, None));
        }

        let mut guard = self.by_session.write().await;
        let vec = guard.entry(session_id).or_default();
        if vec.iter().any(|m| m.sequence == sequence) {
            return Ok((InsertOutcome::SequenceTaken, None));
        }

        let message = Message {
            message_id: message_id.clone(),
            session_id,
            sequence,
            message_type,
            content,
            created_at: Utc::now(),
        };
        self.append_line(session_id, &message).await?;
        vec.push(message.clone());
        vec.sort_by_key(|m| m.sequence);
        self.known_ids.insert(message_id);
        Ok((InsertOutcome::Inserted, Some(message)))
    }

    async fn append_line(&self, session_id: Uuid, message: &Message) -> Result<()> {
        let path = self.file_path(session_id);
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    pub(crate) async fn list(&self, session_id: Uuid) -> Vec<Message> {
        self.by_session.read().await.get(&session_id).cloned().unwrap_or_default()
    }

    /// Most recent message with `message_type != User`.
    pub(crate) async fn last_non_user(&self, session_id: Uuid) -> Option<Message> {
        self.by_session
            .read()
            .await
            .get(&session_id)?
            .iter()
            .rev()
            .find(|m| m.message_type != MessageType::User)
            .cloned()
    }

    /// Overwrite the content of an existing message in place (used to flip
    /// `interrupted: true` on the last assistant message). Sequence, id and type
    /// are unchanged.
    pub(crate) async fn update_content(&self, session_id: Uuid, message_id: &str, content: String) -> Result<()> {
        let mut guard = self.by_session.write().await;
        let vec = guard
            .get_mut(&session_id)
            .ok_or_else(|| RuntimeError::not_found("session messages", session_id))?;
        let message = vec
            .iter_mut()
            .find(|m| m.message_id == message_id)
            .ok_or_else(|| RuntimeError::not_found("message", message_id))?;
        message.content = content;
        let snapshot = message.clone();
        drop(guard);
        self.rewrite_file(session_id).await?;
        let _ = snapshot;
        Ok(())
    }

    /// Full rewrite of a session's jsonl file, used only after an in-place update
    /// (append-only growth would otherwise duplicate the edited row).
    async fn rewrite_file(&self, session_id: Uuid) -> Result<()> {
        let guard = self.by_session.read().await;
        let Some(vec) = guard.get(&session_id) else { return Ok(()) };
        let mut text = String::new();
        for message in vec {
            text.push_str(&serde_json::to_string(message)?);
            text.push('\n');
        }
        let path = self.file_path(session_id);
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub(crate) async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        let mut guard = self.by_session.write().await;
        if let Some(vec) = guard.remove(&session_id) {
            for m in vec {
                self.known_ids.remove(&m.message_id);
            }
        }
        drop(guard);
        let path = self.file_path(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> MessageStore {
        let dir = tempfile::tempdir().unwrap();
        MessageStore::load(dir.keep()).await.unwrap()
    }

    #[tokio::test]
    async fn sequences_are_dense_and_unique() {
        let store = store().await;
        let session = Uuid::new_v4();
        for i in 0..5 {
            let seq = store.next_sequence(session).await;
            assert_eq!(seq, i);
            let (outcome, _) = store
                .insert_at(session, seq, format!("m{i}"), MessageType::System, "{}".into())
                .await
                .unwrap();
            assert_eq!(outcome, InsertOutcome::Inserted);
        }
        let seqs: Vec<i64> = store.list(session).await.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_idempotent() {
        let store = store().await;
        let session = Uuid::new_v4();
        let (first, _) = store
            .insert_at(session, 0, "dup".into(), MessageType::Assistant, "a".into())
            .await
            .unwrap();
        assert_eq!(first, InsertOutcome::Inserted);
        let (second, _) = store
            .insert_at(session, 1, "dup".into(), MessageType::Assistant, "a".into())
            .await
            .unwrap();
        assert_eq!(second, InsertOutcome::DuplicateMessageId);
        assert_eq!(store.list(session).await.len(), 1);
    }

    #[tokio::test]
    async fn sequence_collision_is_reported_for_retry() {
        let store = store().await;
        let session = Uuid::new_v4();
        store.insert_at(session, 0, "a".into(), MessageType::System, "{}".into()).await.unwrap();
        let (outcome, _) =
            store.insert_at(session, 0, "b".into(), MessageType::System, "{}".into()).await.unwrap();
        assert_eq!(outcome, InsertOutcome::SequenceTaken);
    }

    #[tokio::test]
    async fn update_content_persists_across_reload() {
        let store = store().await;
        let session = Uuid::new_v4();
        store.insert_at(session, 0, "a".into(), MessageType::Assistant, "{\"x\":1}".into()).await.unwrap();
        store.update_content(session, "a", "{\"x\":1,\"interrupted\":true}".into()).await.unwrap();

        let reloaded = MessageStore::load(store.root().to_path_buf()).await.unwrap();
        let messages = reloaded.list(session).await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("interrupted"));
    }
}
