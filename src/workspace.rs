//! Workspace provisioner.
//!
//! Per-session isolated volume plus a shared bare-repo reference cache so
//! fresh clones are fast. Every step runs inside a throwaway worker
//! container (never the host), via [`ContainerEngine::exec_and_wait`].

use std::sync::Arc;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::container::ContainerEngine;
use crate::errors::{Result, RuntimeError};

pub struct WorkspaceProvisioner {
    config: Arc<RuntimeConfig>,
    engine: Arc<ContainerEngine>,
}

/// Coordinates needed to clone a repository into a session's workspace.
pub struct CloneRequest {
    pub session_id: Uuid,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub token: Option<String>,
}

impl WorkspaceProvisioner {
    pub fn new(config: Arc<RuntimeConfig>, engine: Arc<ContainerEngine>) -> Self {
        Self { config, engine }
    }

    /// Clone the repository into a fresh session workspace volume, using the
    /// reference cache when available. Returns the workspace volume name on
    /// success.
    pub async fn clone(&self, request: &CloneRequest) -> Result<String> {
        let use_cache = self.update_reference_cache(&request.owner, &request.repo).await;

        let workspace_volume = self.config.session_workspace_volume(request.session_id);
        self.engine.ensure_volume(&workspace_volume).await?;

        let worker_name = format!("{}-clone-{}", self.config.namespace, request.session_id);
        let mut binds = vec![format!("{workspace_volume}:/workspace")];
        if use_cache {
            binds.push(format!("{}:/cache:ro", self.config.cache_volume_name));
        }

        let worker_id = self
            .engine
            .create_ephemeral(&worker_name, &self.config.git_worker_image, Some("/workspace"), &binds)
            .await?;

        let result = self.clone_into_worker(&worker_id, request, use_cache).await;

        // Fire-and-forget teardown: no grace period, failure logged not propagated.
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(e) = engine.remove(&worker_id, true).await {
                tracing::warn!("failed to remove ephemeral clone worker {worker_id}: {e}");
            }
        });

        result?;
        Ok(workspace_volume)
    }

    /// Ensure the cache volume exists and update (or create) the bare mirror.
    /// Returns whether the cache is usable; any failure degrades to `false`
    /// rather than failing the clone.
    async fn update_reference_cache(&self, owner: &str, repo: &str) -> bool {
        if let Err(e) = self.engine.ensure_volume(&self.config.cache_volume_name).await {
            tracing::warn!("reference cache volume unavailable, cloning without it: {e}");
            return false;
        }

        let worker_name = format!("{}-cache-{owner}-{repo}", self.config.namespace);
        let binds = vec![format!("{}:/cache", self.config.cache_volume_name)];
        let worker_id = match self
            .engine
            .create_ephemeral(&worker_name, &self.config.git_worker_image, Some("/cache"), &binds)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("failed to start cache-update worker, cloning without cache: {e}");
                return false;
            }
        };

        let mirror_path = self.config.cache_mirror_path(owner, repo);
        let url = format!("https://github.com/{owner}/{repo}.git");
        let outcome = if self.engine.file_exists(&worker_id, &mirror_path).await.unwrap_or(false) {
            self.engine
                .exec_and_wait(
                    &worker_id,
                    vec!["git".into(), format!("--git-dir={mirror_path}"), "fetch".into(), "--all".into(), "--prune".into()],
                )
                .await
        } else {
            self.engine
                .exec_and_wait(&worker_id, vec!["git".into(), "clone".into(), "--bare".into(), url, mirror_path])
                .await
        };

        let _ = self.engine.remove(&worker_id, true).await;

        match outcome {
            Ok(o) if o.exit_code == 0 => true,
            Ok(o) => {
                tracing::warn!("reference cache update exited {}, cloning without it: {}", o.exit_code, o.output);
                false
            }
            Err(e) => {
                tracing::warn!("reference cache update failed, cloning without it: {e}");
                false
            }
        }
    }

    /// Clone, scrub the remote url, and check out the session branch, run
    /// inside the already-created worker container.
    async fn clone_into_worker(&self, worker_id: &str, request: &CloneRequest, use_cache: bool) -> Result<()> {
        let repo_name = request.repo.clone();
        let url = match &request.token {
            Some(token) => format!("https://{token}@github.com/{}/{}.git", request.owner, request.repo),
            None => format!("https://github.com/{}/{}.git", request.owner, request.repo),
        };

        let mut clone_cmd =
            vec!["git".to_string(), "clone".to_string(), "--branch".to_string(), request.branch.clone(), "--single-branch".to_string()];
        if use_cache {
            let mirror = self.config.cache_mirror_path(&request.owner, &request.repo);
            clone_cmd.push("--reference".to_string());
            clone_cmd.push(mirror);
            clone_cmd.push("--dissociate".to_string());
        }
        clone_cmd.push(url);
        clone_cmd.push(repo_name.clone());

        let outcome = self.engine.exec_and_wait(worker_id, clone_cmd).await?;
        if outcome.exit_code != 0 {
            return Err(RuntimeError::EngineFailure(format!("git clone failed: {}", outcome.output)));
        }

        // Rewrite the remote URL to drop the embedded token.
        let clean_url = format!("https://github.com/{}/{}.git", request.owner, request.repo);
        let set_url = self
            .engine
            .exec_and_wait(
                worker_id,
                vec!["git".into(), "-C".into(), repo_name.clone(), "remote".into(), "set-url".into(), "origin".into(), clean_url],
            )
            .await?;
        if set_url.exit_code != 0 {
            return Err(RuntimeError::EngineFailure(format!("failed to scrub remote url: {}", set_url.output)));
        }

        // Create and check out the session branch.
        let branch_name = format!("{}{}", self.config.session_branch_prefix(), request.session_id);
        let checkout = self
            .engine
            .exec_and_wait(worker_id, vec!["git".into(), "-C".into(), repo_name, "checkout".into(), "-b".into(), branch_name])
            .await?;
        if checkout.exit_code != 0 {
            return Err(RuntimeError::EngineFailure(format!("failed to create session branch: {}", checkout.output)));
        }

        Ok(())
    }

    /// Remove the session volume. Failure is logged, not propagated, so it
    /// never blocks session deletion.
    pub async fn delete(&self, session_id: Uuid) {
        let volume = self.config.session_workspace_volume(session_id);
        if let Err(e) = self.engine.remove_volume(&volume, true).await {
            tracing::warn!("failed to remove workspace volume {volume} for session {session_id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_uses_configured_prefix() {
        let config = RuntimeConfig::default();
        let id = Uuid::nil();
        let branch = format!("{}{}", config.session_branch_prefix(), id);
        assert_eq!(branch, format!("{}/{}", config.namespace, id));
    }
}
