//! Session table.

use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{Result, RuntimeError};
use crate::session::model::Session;

pub(crate) struct SessionStore {
    path: PathBuf,
    rows: RwLock<HashMap<Uuid, Session>>,
}

impl SessionStore {
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

    async fn flush(&self, rows: &HashMap<Uuid, Session>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(rows)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub(crate) async fn insert(&self, session: Session) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert(session.id, session);
        self.flush(&rows).await
    }

    pub(crate) async fn get(&self, id: Uuid) -> Result<Session> {
        self.rows.read().await.get(&id).cloned().ok_or_else(|| RuntimeError::session_not_found(id))
    }

    pub(crate) async fn list(&self) -> Vec<Session> {
        self.rows.read().await.values().cloned().collect()
    }

    pub(crate) async fn update(&self, id: Uuid, f: impl FnOnce(&mut Session)) -> Result<Session> {
        let mut rows = self.rows.write().await;
        let session = rows.get_mut(&id).ok_or_else(|| RuntimeError::session_not_found(id))?;
        f(session);
        let updated = session.clone();
        self.flush(&rows).await?;
        Ok(updated)
    }

    pub(crate) async fn delete(&self, id: Uuid) -> Result<Session> {
        let mut rows = self.rows.write().await;
        let session = rows.remove(&id).ok_or_else(|| RuntimeError::session_not_found(id))?;
        self.flush(&rows).await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path().join("sessions.json")).await.unwrap();
        let session = Session::new("demo", "acme", "widgets", "main", None, "vol-1");
        let id = session.id;
        store.insert(session).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().display_name, "demo");
        store.delete(id).await.unwrap();
        assert!(store.get(id).await.is_err());
    }
}
