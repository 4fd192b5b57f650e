//! AgentExecution table.
//!
//! One row per currently-or-recently-tracked agent invocation, unique per
//! session. Upserted as a whole file on every mutation; the table is
//! small (at most one row per live session) so this is simpler than the
//! append-only message log without costing anything in practice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub session_id: Uuid,
    pub container_id: String,
    pub exec_id: String,
    pub output_file: String,
    pub last_sequence: i64,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

pub(crate) struct ExecutionStore {
    path: PathBuf,
    rows: RwLock<HashMap<Uuid, AgentExecution>>,
}

impl ExecutionStore {
    pub(crate) async fn load(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let rows = if path.is_file() {
            let text = tokio::fs::read_to_string(&path).await?;
            if text.trim().is_empty() { HashMap::new() } else { serde_json::from_str(&text)? }
        } else {
            HashMap::new()
        };
        Ok(Self { path, rows: RwLock::new(rows) })
    }

    async fn flush(&self, rows: &HashMap<Uuid, AgentExecution>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(rows)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub(crate) async fn get(&self, session_id: Uuid) -> Option<AgentExecution> {
        self.rows.read().await.get(&session_id).cloned()
    }

    pub(crate) async fn list(&self) -> Vec<AgentExecution> {
        self.rows.read().await.values().cloned().collect()
    }

    pub(crate) async fn upsert(&self, execution: AgentExecution) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert(execution.session_id, execution);
        self.flush(&rows).await
    }

    pub(crate) async fn update_last_sequence(&self, session_id: Uuid, last_sequence: i64) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.get_mut(&session_id) {
            row.last_sequence = last_sequence;
        }
        self.flush(&rows).await
    }

    pub(crate) async fn update_pid(&self, session_id: Uuid, pid: u32) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.get_mut(&session_id) {
            row.pid = Some(pid);
        }
        self.flush(&rows).await
    }

    pub(crate) async fn delete(&self, session_id: Uuid) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.remove(&session_id);
        self.flush(&rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn at_most_one_row_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutionStore::load(dir.path().join("executions.json")).await.unwrap();
        let session = Uuid::new_v4();
        let row = AgentExecution {
            session_id: session,
            container_id: "c1".into(),
            exec_id: "e1".into(),
            output_file: "/tmp/out.jsonl".into(),
            last_sequence: 0,
            pid: None,
            started_at: Utc::now(),
        };
        store.upsert(row.clone()).await.unwrap();
        let mut row2 = row;
        row2.exec_id = "e2".into();
        store.upsert(row2).await.unwrap();
        assert_eq!(store.list().await.len(), 1);
        assert_eq!(store.get(session).await.unwrap().exec_id, "e2");
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executions.json");
        let store = ExecutionStore::load(path.clone()).await.unwrap();
        let session = Uuid::new_v4();
        store
            .upsert(AgentExecution {
                session_id: session,
                container_id: "c1".into(),
                exec_id: "e1".into(),
                output_file: "/tmp/out.jsonl".into(),
                last_sequence: 3,
                pid: Some(42),
                started_at: Utc::now(),
            })
            .await
            .unwrap();

        let reloaded = ExecutionStore::load(path).await.unwrap();
        let row = reloaded.get(session).await.unwrap();
        assert_eq!(row.last_sequence, 3);
        assert_eq!(row.pid, Some(42));
    }
}
