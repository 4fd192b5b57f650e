//! Credential propagator.
//!
//! Watches the host credential directory; on a debounced change to an
//! allow-listed file, pushes it into every running session container at a
//! fixed in-container path under the agent user's home.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;
use crate::container::{ContainerEngine, ObservedStatus};

/// Files propagated verbatim into each session container's `~/.claude/`.
const ALLOWED_FILES: &[&str] = &[".credentials.json", "settings.json"];

/// In-container destination directory, relative to the agent user's home.
const IN_CONTAINER_DEST_DIR: &str = "/home/agent/.claude";

pub struct CredentialPropagator {
    config: Arc<RuntimeConfig>,
    engine: Arc<ContainerEngine>,
}

impl CredentialPropagator {
    pub fn new(config: Arc<RuntimeConfig>, engine: Arc<ContainerEngine>) -> Self {
        Self { config, engine }
    }

    /// Run the watch loop forever. On a watcher error, closes and restarts
    /// after 5s.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.watch_once().await {
                error!("credential watcher error, restarting in 5s: {e}");
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn watch_once(&self) -> notify::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.config.credentials_host_dir, RecursiveMode::NonRecursive)?;
        info!("watching {:?} for credential changes", self.config.credentials_host_dir);

        let mut pending_debounce: Option<tokio::time::Instant> = None;
        let debounce = Duration::from_millis(self.config.credential_debounce_millis);

        loop {
            let sleep_until = pending_debounce.map(|deadline| tokio::time::sleep_until(deadline));
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        Ok(event) if is_relevant(&event) => {
                            pending_debounce = Some(tokio::time::Instant::now() + debounce);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("credential watcher event error: {e}"),
                    }
                }
                _ = async { sleep_until.unwrap().await }, if sleep_until.is_some() => {
                    pending_debounce = None;
                    self.propagate_to_all().await;
                }
            }
        }
        Ok(())
    }

    /// Push allow-listed files into every running session container, never
    /// letting one container's failure block another's update.
    async fn propagate_to_all(&self) {
        let containers = match self.engine.list_session_containers().await {
            Ok(v) => v,
            Err(e) => {
                warn!("credential propagation: failed to list session containers: {e}");
                return;
            }
        };

        let mut successes = 0u32;
        let mut failures = 0u32;
        for entry in containers.iter().filter(|c| c.status == ObservedStatus::Running) {
            match self.propagate_to_one(&entry.container_id).await {
                Ok(()) => successes += 1,
                Err(e) => {
                    failures += 1;
                    warn!("credential propagation to container {} failed: {e}", entry.container_id);
                }
            }
        }
        info!("credential propagation: {successes} succeeded, {failures} failed");
    }

    async fn propagate_to_one(&self, container_id: &str) -> crate::errors::Result<()> {
        for file_name in ALLOWED_FILES {
            let host_path = self.config.credentials_host_dir.join(file_name);
            let Ok(contents) = tokio::fs::read(&host_path).await else { continue };
            self.engine.upload_file(container_id, IN_CONTAINER_DEST_DIR, file_name, &contents).await?;
        }
        // Fix ownership after the upload, since the tar payload is written as root.
        self.engine
            .exec_and_wait(
                container_id,
                vec![
                    "chown".to_string(),
                    "-R".to_string(),
                    "agent:agent".to_string(),
                    IN_CONTAINER_DEST_DIR.to_string(),
                ],
            )
            .await?;
        Ok(())
    }
}

fn is_relevant(event: &Event) -> bool {
    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
        return false;
    }
    event.paths.iter().any(|p| is_allowed_file(p))
}

fn is_allowed_file(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).map(|name| ALLOWED_FILES.contains(&name)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_allow_listed_files_only() {
        assert!(is_allowed_file(Path::new("/home/x/.credentials.json")));
        assert!(is_allowed_file(Path::new("/home/x/settings.json")));
        assert!(!is_allowed_file(Path::new("/home/x/other.json")));
    }
}
