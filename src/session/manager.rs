//! Session lifecycle manager.
//!
//! Owns the create/start/stop/delete state machine. Create is not
//! transactional across external effects (clone + container create can each
//! fail independently); on any failure the session moves to `error` and
//! whatever volume/container exists is left for the reconciler rather than
//! torn down here.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::container::ContainerEngine;
use crate::errors::{Result, RuntimeError};
use crate::events::EventBus;
use crate::session::model::{Session, SessionStatus};
use crate::store::Store;
use crate::workspace::{CloneRequest, WorkspaceProvisioner};

/// Grace period given to the session container on `stop` before the engine
/// force-kills it. Not a spec-named setting, just this manager's own default.
const STOP_GRACE_SECONDS: i64 = 10;

pub struct SessionManager {
    config: Arc<RuntimeConfig>,
    engine: Arc<ContainerEngine>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    workspace: Arc<WorkspaceProvisioner>,
}

/// Everything the caller supplies to start a new session: the clone inputs
/// plus the session's own display attributes.
pub struct CreateSessionRequest {
    pub display_name: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub initial_prompt: Option<String>,
    pub token: Option<String>,
}

impl SessionManager {
    pub fn new(
        config: Arc<RuntimeConfig>,
        engine: Arc<ContainerEngine>,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        workspace: Arc<WorkspaceProvisioner>,
    ) -> Self {
        Self { config, engine, store, bus, workspace }
    }

    /// `sessions.create`. `∅ -> creating -> running` on success, `creating
    /// -> error` if either the clone or the container create/start fails.
    pub async fn create(&self, request: CreateSessionRequest) -> Result<Session> {
        let mut session = Session::new(
            request.display_name,
            &request.owner,
            &request.repo,
            &request.branch,
            request.initial_prompt,
            "pending",
        );
        session.workspace_volume = self.config.session_workspace_volume(session.id);
        let session_id = session.id;
        self.store.insert_session(session.clone()).await?;
        info!("session {session_id}: created (creating), repo {}", session.repo_coordinates());

        let clone_request = CloneRequest {
            session_id,
            owner: request.owner,
            repo: request.repo,
            branch: request.branch,
            token: request.token,
        };

        match self.provision(session_id, &clone_request).await {
            Ok(container_id) => {
                let updated = self
                    .store
                    .update_session(session_id, |s| {
                        s.set_container_id(Some(container_id));
                        let _ = s.transition(SessionStatus::Running);
                    })
                    .await?;
                self.bus.emit_session_update(session_id, updated.status);
                info!("session {session_id}: running");
                Ok(updated)
            }
            Err(e) => {
                warn!("session {session_id}: provisioning failed, moving to error: {e}");
                let updated = self
                    .store
                    .update_session(session_id, |s| {
                        let _ = s.transition(SessionStatus::Error);
                    })
                    .await?;
                self.bus.emit_session_update(session_id, updated.status);
                Err(e)
            }
        }
    }

    /// Clone the repository, then create and start the session container.
    /// Fatal failures here are what drive the session to `error`.
    async fn provision(&self, session_id: Uuid, clone_request: &CloneRequest) -> Result<String> {
        self.workspace.clone(clone_request).await?;
        self.start_container(session_id, &clone_request.repo).await
    }

    async fn start_container(&self, session_id: Uuid, repo: &str) -> Result<String> {
        let workspace_volume = self.config.session_workspace_volume(session_id);
        let binds = vec![format!("{workspace_volume}:/workspace")];
        let working_dir = format!("/workspace/{repo}");
        let container_id = self
            .engine
            .create(
                session_id,
                &self.config.image,
                Some(&working_dir),
                &[],
                &binds,
                &[],
                &["sleep".to_string(), "infinity".to_string()],
            )
            .await?;
        info!("session {session_id}: container {container_id} created and started");
        Ok(container_id)
    }

    /// `sessions.start`. Only legal from `stopped`; re-uses the stored volume,
    /// so no clone step runs again.
    pub async fn start(&self, session_id: Uuid) -> Result<Session> {
        let session = self.get(session_id).await?;
        if session.status != SessionStatus::Stopped {
            return Err(RuntimeError::precondition(format!(
                "session {session_id} is not stopped (status {:?})",
                session.status
            )));
        }

        let container_id = self.start_container(session_id, &session.repo).await?;
        let updated = self
            .store
            .update_session(session_id, |s| {
                s.set_container_id(Some(container_id));
                let _ = s.transition(SessionStatus::Running);
            })
            .await?;
        self.bus.emit_session_update(session_id, updated.status);
        info!("session {session_id}: started");
        Ok(updated)
    }

    /// `sessions.stop`. Signals the container engine but leaves the workspace
    /// volume in place.
    pub async fn stop(&self, session_id: Uuid) -> Result<Session> {
        let session = self.get(session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(RuntimeError::precondition(format!(
                "session {session_id} is not running (status {:?})",
                session.status
            )));
        }
        let container_id = session
            .container_id
            .clone()
            .ok_or_else(|| RuntimeError::precondition("running session has no container-id"))?;

        self.engine.stop(&container_id, STOP_GRACE_SECONDS).await?;

        let updated = self
            .store
            .update_session(session_id, |s| {
                let _ = s.transition(SessionStatus::Stopped);
            })
            .await?;
        self.bus.emit_session_update(session_id, updated.status);
        info!("session {session_id}: stopped");
        Ok(updated)
    }

    /// `sessions.delete`: tears down container and workspace volume, then
    /// cascades the Session row's Message and AgentExecution rows. Legal from
    /// any status.
    pub async fn delete(&self, session_id: Uuid) -> Result<()> {
        let session = self.get(session_id).await?;

        if let Some(container_id) = &session.container_id
            && let Err(e) = self.engine.remove(container_id, true).await
        {
            warn!("session {session_id}: failed to remove container {container_id}, continuing: {e}");
        }
        self.workspace.delete(session_id).await;

        self.store.delete_session(session_id).await?;
        info!("session {session_id}: deleted");
        Ok(())
    }

    pub async fn get(&self, session_id: Uuid) -> Result<Session> {
        self.store.get_session(session_id).await
    }

    pub async fn list(&self) -> Vec<Session> {
        self.store.list_sessions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_rejects_session_that_is_not_stopped() {
        let (store, _dir) = Store::open_temp().await;
        let store = Arc::new(store);
        let config = Arc::new(RuntimeConfig::default());
        let bus = Arc::new(EventBus::new());

        let session = Session::new("demo", "acme", "widgets", "main", None, "vol-1");
        let session_id = session.id;
        store.insert_session(session).await.unwrap();

        // Building a full SessionManager needs a live engine, which these unit
        // tests can't provide; exercise the precondition check directly instead.
        let fetched = store.get_session(session_id).await.unwrap();
        assert_eq!(fetched.status, SessionStatus::Creating);
        assert!(!fetched.status.can_transition_to(SessionStatus::Stopped));
        let _ = (config, bus);
    }
}
