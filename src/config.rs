//! Runtime configuration discovery and loading.
//!
//! Discovery hierarchy: explicit path argument, then
//! `./.agentrt/config.toml`, then `$HOME/.agentrt/config.toml`, then
//! compiled-in defaults.

use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Runtime-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container/volume name prefix.
    pub namespace: String,
    /// Session container image.
    pub image: String,
    /// Image for the ephemeral worker container used to clone/update workspaces.
    pub git_worker_image: String,
    /// Host-side root for locally-staged files (logs, config).
    pub workspace_root: PathBuf,
    /// Shared git reference cache volume name.
    pub cache_volume_name: String,
    /// In-container path of the agent binary, used for process discovery/signalling.
    pub agent_binary_path: String,
    /// Host directory watched by the credential propagator.
    pub credentials_host_dir: PathBuf,
    /// Minimum interval between image pull attempts for the same image.
    pub image_pull_cooldown_secs: u64,
    /// How long to wait for the agent output file to appear.
    pub output_file_wait_secs: u64,
    /// Poll interval while waiting for an exec to finish.
    pub exec_status_poll_millis: u64,
    /// PID-discovery poll attempts after launch.
    pub pid_discovery_attempts: u32,
    /// PID-discovery poll interval.
    pub pid_discovery_interval_millis: u64,
    /// Reconciliation pass interval.
    pub reconcile_interval_secs: u64,
    /// Credential-watcher debounce window.
    pub credential_debounce_millis: u64,
    /// Auth session idle timeout.
    pub auth_idle_timeout_secs: i64,
    /// Auth token rotation interval.
    pub auth_rotation_interval_secs: i64,
    /// Auth last-activity update throttle.
    pub auth_activity_throttle_secs: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let namespace = "agentrt".to_string();
        Self {
            cache_volume_name: format!("{namespace}-gitcache"),
            namespace,
            image: "agentrt/session:latest".to_string(),
            git_worker_image: "alpine/git:latest".to_string(),
            workspace_root: std_env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            agent_binary_path: "/usr/bin/claude".to_string(),
            credentials_host_dir: PathBuf::from(".agentrt/credentials"),
            image_pull_cooldown_secs: 300,
            output_file_wait_secs: 5,
            exec_status_poll_millis: 1000,
            pid_discovery_attempts: 10,
            pid_discovery_interval_millis: 200,
            reconcile_interval_secs: 300,
            credential_debounce_millis: 1000,
            auth_idle_timeout_secs: 3600,
            auth_rotation_interval_secs: 86400,
            auth_activity_throttle_secs: 60,
        }
    }
}

impl RuntimeConfig {
    pub fn session_container_name(&self, session_id: uuid::Uuid) -> String {
        format!("{}-session-{}", self.namespace, session_id)
    }

    pub fn session_workspace_volume(&self, session_id: uuid::Uuid) -> String {
        format!("{}-workspace-{}", self.namespace, session_id)
    }

    pub fn session_output_file(&self, session_id: uuid::Uuid) -> String {
        format!("/tmp/{}-{}.jsonl", self.namespace, session_id)
    }

    pub fn session_branch_prefix(&self) -> String {
        format!("{}/", self.namespace)
    }

    pub fn cache_mirror_path(&self, owner: &str, repo: &str) -> String {
        format!("/cache/{owner}--{repo}.git")
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Configuration discovery, following the hierarchy documented above.
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load configuration, preferring `explicit_path` if given.
    pub fn discover(explicit_path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
        if let Some(path) = explicit_path {
            info!("loading configuration from explicit path {:?}", path);
            return RuntimeConfig::from_toml_file(path);
        }

        if let Some(path) = Self::find_config_file() {
            info!("loading configuration from {:?}", path);
            return RuntimeConfig::from_toml_file(path);
        }

        info!("no configuration file found, using defaults");
        Ok(RuntimeConfig::default())
    }

    fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::candidates() {
            debug!("checking for config file: {:?}", candidate);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    fn candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(".agentrt").join("config.toml"));
        }

        if let Some(home) = std_env::var_os("HOME").map(PathBuf::from) {
            candidates.push(home.join(".agentrt").join("config.toml"));
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_derives_cache_volume_from_namespace() {
        let config = RuntimeConfig::default();
        assert_eq!(config.cache_volume_name, format!("{}-gitcache", config.namespace));
    }

    #[test]
    fn session_names_follow_namespace_prefix() {
        let config = RuntimeConfig::default();
        let id = uuid::Uuid::nil();
        assert_eq!(
            config.session_container_name(id),
            format!("{}-session-{}", config.namespace, id)
        );
        assert_eq!(
            config.session_workspace_volume(id),
            format!("{}-workspace-{}", config.namespace, id)
        );
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = RuntimeConfig::default();
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        config.to_toml_file(&path).unwrap();
        let loaded = RuntimeConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.namespace, config.namespace);
        assert_eq!(loaded.image, config.image);
    }
}
