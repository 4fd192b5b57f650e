//! ContainerEngine adapter.
//!
//! Uniform contract over a rootless container engine, talked to via
//! `bollard` rather than shelling out to a CLI binary. Every container
//! operation the rest of the runtime needs has a method here; the
//! exec-oriented ones return
//! `ExecByteStream`, a boxed merged stdout+stderr byte stream, because the
//! agent runner needs to read tail-file and exec output without caring which
//! exec produced it.

use crate::config::RuntimeConfig;
use crate::container::{ContainerClient, ContainerError, Result};
use bollard::Docker;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::query_parameters::InspectContainerOptions;
use bollard::service::HostConfig;
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// A merged stdout+stderr byte stream from a running exec.
pub type ExecByteStream = Pin<Box<dyn Stream<Item = std::result::Result<String, ContainerError>> + Send>>;

/// Observed container status, as seen by `inspect_state`/`list_session_containers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedStatus {
    Running,
    Stopped,
    NotFound,
}

/// Full state snapshot returned by `inspect_state`.
#[derive(Debug, Clone)]
pub struct ContainerStateInfo {
    pub status: ObservedStatus,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub oom_killed: bool,
}

/// One entry from `list_session_containers`.
#[derive(Debug, Clone)]
pub struct SessionContainerEntry {
    pub container_id: String,
    pub session_id: Uuid,
    pub status: ObservedStatus,
}

/// Status of a tracked exec, as reported by the engine (not the in-process tracker).
#[derive(Debug, Clone)]
pub enum EngineExecStatus {
    Running,
    Exited { exit_code: i64 },
    NotFound,
}

/// Signal to deliver to an in-container process.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Sigint,
    Sigterm,
    Sigkill,
}

impl Signal {
    fn as_str(self) -> &'static str {
        match self {
            Signal::Sigint => "INT",
            Signal::Sigterm => "TERM",
            Signal::Sigkill => "KILL",
        }
    }
}

/// Combined output and exit code of a completed exec.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub output: String,
    pub exit_code: i64,
}

/// Result of launching the agent via exec-to-file.
pub struct ExecToFileHandle {
    pub exec_id: String,
    /// Bytes emitted on the shell-level error stream (redirect failures only).
    pub startup_errors: String,
}

/// The ContainerEngine adapter.
pub struct ContainerEngine {
    docker: Arc<Docker>,
    namespace: String,
    pull_cooldown: Duration,
    last_pull_attempt: DashMap<String, Instant>,
}

impl ContainerEngine {
    pub async fn new(config: &RuntimeConfig) -> Result<Self> {
        let client = ContainerClient::new().await?;
        Ok(Self {
            docker: Arc::new(client.docker().clone()),
            namespace: config.namespace.clone(),
            pull_cooldown: Duration::from_secs(config.image_pull_cooldown_secs),
            last_pull_attempt: DashMap::new(),
        })
    }

    fn session_container_name(&self, session_id: Uuid) -> String {
        format!("{}-session-{}", self.namespace, session_id)
    }

    fn name_prefix(&self) -> String {
        format!("{}-session-", self.namespace)
    }

    /// Idempotent: returns `Ok(())` if the volume already exists.
    pub async fn ensure_volume(&self, name: &str) -> Result<()> {
        if self.volume_exists(name).await? {
            return Ok(());
        }
        self.docker
            .create_volume(bollard::volume::CreateVolumeOptions {
                name,
                driver: "local",
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    pub async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(ContainerError::ApiError(e)),
        }
    }

    pub async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        match self.docker.remove_volume(name, Some(bollard::volume::RemoveVolumeOptions { force })).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(ContainerError::ApiError(e)),
        }
    }

    /// **create**: idempotent by name. Returns the container id, starting it
    /// if it already exists but is stopped.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        session_id: Uuid,
        image: &str,
        working_dir: Option<&str>,
        env: &[String],
        binds: &[String],
        devices: &[String],
        command: &[String],
    ) -> Result<String> {
        let name = self.session_container_name(session_id);

        if let Ok(id) = self.container_id_by_name(&name).await {
            debug!("container {} already exists as {}", name, id);
            if matches!(self.inspect_state(&id).await?.status, ObservedStatus::Stopped) {
                self.start(&id).await?;
            }
            return Ok(id);
        }

        self.ensure_image(image).await?;

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds.to_vec()) },
            devices: if devices.is_empty() {
                None
            } else {
                Some(
                    devices
                        .iter()
                        .map(|d| bollard::service::DeviceMapping {
                            path_on_host: Some(d.clone()),
                            path_in_container: Some(d.clone()),
                            cgroup_permissions: Some("rwm".to_string()),
                        })
                        .collect(),
                )
            },
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert("agentrt.session-id".to_string(), session_id.to_string());

        let config = BollardConfig {
            image: Some(image.to_string()),
            working_dir: working_dir.map(|s| s.to_string()),
            env: if env.is_empty() { None } else { Some(env.to_vec()) },
            cmd: if command.is_empty() { None } else { Some(command.to_vec()) },
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: name.as_str(), ..Default::default() };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 409, .. } => {
                    ContainerError::Other(format!("name conflict with different config: {name}"))
                }
                e => ContainerError::ApiError(e),
            })?;

        info!("created container {} ({})", name, response.id);
        self.start(&response.id).await?;
        Ok(response.id)
    }

    /// Create a throwaway, unnamed-convention container for one-off work (workspace
    /// provisioning's clone/fetch steps). Unlike [`Self::create`] this never looks up
    /// an existing container by name: callers own the container's lifetime and are
    /// expected to force-remove it when done.
    pub async fn create_ephemeral(
        &self,
        name: &str,
        image: &str,
        working_dir: Option<&str>,
        binds: &[String],
    ) -> Result<String> {
        self.ensure_image(image).await?;

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds.to_vec()) },
            ..Default::default()
        };
        let config = BollardConfig {
            image: Some(image.to_string()),
            working_dir: working_dir.map(|s| s.to_string()),
            host_config: Some(host_config),
            // Ephemeral workers sleep until exec'd into; they carry no agent workload
            // of their own, so every actual step (fetch, clone, checkout) runs via exec.
            entrypoint: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };
        let options = CreateContainerOptions { name, ..Default::default() };
        let response = self.docker.create_container(Some(options), config).await?;
        self.start(&response.id).await?;
        Ok(response.id)
    }

    async fn container_id_by_name(&self, name: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                    ContainerError::NotFound(name.to_string())
                }
                e => ContainerError::ApiError(e),
            })?;
        inspect.id.ok_or_else(|| ContainerError::Other(format!("container {name} has no id")))
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let exists = matches!(self.docker.inspect_image(image).await, Ok(_));
        if exists {
            return Ok(());
        }

        if let Some(last) = self.last_pull_attempt.get(image)
            && last.elapsed() < self.pull_cooldown
        {
            return Err(ContainerError::Other(format!(
                "image {image} missing and pull cooldown still active"
            )));
        }
        self.last_pull_attempt.insert(image.to_string(), Instant::now());

        info!("pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(ContainerError::Other(format!("image pull failed: {error}")));
                    }
                }
                Err(e) => return Err(ContainerError::ApiError(e)),
            }
        }
        Ok(())
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Tolerant to already-stopped containers.
    pub async fn stop(&self, container_id: &str, grace_seconds: i64) -> Result<()> {
        let options = StopContainerOptions { t: Some(grace_seconds), ..Default::default() };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304 | 404, .. }) => Ok(()),
            Err(e) => Err(ContainerError::ApiError(e)),
        }
    }

    /// Force-kill, remove, and drop the container's anonymous volumes in one step.
    pub async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions { force, v: true, ..Default::default() };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(ContainerError::ApiError(e)),
        }
    }

    pub async fn inspect_state(&self, container_id: &str) -> Result<ContainerStateInfo> {
        let inspect = match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(i) => i,
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                return Ok(ContainerStateInfo {
                    status: ObservedStatus::NotFound,
                    exit_code: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                    oom_killed: false,
                });
            }
            Err(e) => return Err(ContainerError::ApiError(e)),
        };

        let state = inspect.state.unwrap_or_default();
        let status = if state.running.unwrap_or(false) {
            ObservedStatus::Running
        } else {
            ObservedStatus::Stopped
        };

        Ok(ContainerStateInfo {
            status,
            exit_code: state.exit_code,
            error: state.error.filter(|s| !s.is_empty()),
            started_at: state.started_at,
            finished_at: state.finished_at,
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    pub async fn logs(&self, container_id: &str, tail: Option<u32>) -> Result<Option<String>> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => text.push_str(&log.to_string()),
                Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => return Ok(None),
                Err(e) => return Err(ContainerError::ApiError(e)),
            }
        }
        Ok(Some(text))
    }

    /// Filters by the session-container name prefix; tolerates "running" and "Up ..." status strings.
    pub async fn list_session_containers(&self) -> Result<Vec<SessionContainerEntry>> {
        let options = ListContainersOptions { all: true, filters: HashMap::new(), ..Default::default() };
        let containers = self.docker.list_containers(Some(options)).await?;
        let prefix = self.name_prefix();

        let mut out = Vec::new();
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let Some(suffix) = name.strip_prefix(&prefix) else { continue };
            let Ok(session_id) = Uuid::parse_str(suffix) else { continue };
            let status_str = c.status.unwrap_or_default().to_lowercase();
            let status = if status_str == "running" || status_str.starts_with("up ") {
                ObservedStatus::Running
            } else {
                ObservedStatus::Stopped
            };
            out.push(SessionContainerEntry {
                container_id: c.id.unwrap_or_default(),
                session_id,
                status,
            });
        }
        Ok(out)
    }

    /// **exec**: stream merges stdout and stderr.
    pub async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<(String, ExecByteStream)> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, options).await?;
        let stream = self.start_exec_stream(&exec.id).await?;
        Ok((exec.id, stream))
    }

    async fn start_exec_stream(&self, exec_id: &str) -> Result<ExecByteStream> {
        match self.docker.start_exec(exec_id, None).await? {
            StartExecResults::Attached { output, .. } => {
                let mapped = output.map(|item| match item {
                    Ok(log) => Ok(log.to_string()),
                    Err(e) => Err(ContainerError::ExecutionError(format!("exec stream error: {e}"))),
                });
                Ok(Box::pin(mapped))
            }
            StartExecResults::Detached => Err(ContainerError::ExecutionError(
                "unexpected detached execution".to_string(),
            )),
        }
    }

    /// **exec-to-file**: runs `stdbuf -oL <cmd> > <output-file> 2>&1` under a shell so a
    /// disconnected consumer cannot block the agent via pipe backpressure.
    pub async fn exec_to_file(
        &self,
        container_id: &str,
        cmd: &[String],
        output_file: &str,
    ) -> Result<ExecToFileHandle> {
        let quoted = cmd.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
        let shell_cmd = format!("stdbuf -oL {quoted} > {output_file} 2>&1");

        let options = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), shell_cmd]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, options).await?;

        let mut startup_errors = String::new();
        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            // The shell launches `cmd` in the background of its own redirect; any bytes on
            // this attached stream before it detaches are shell-level errors (e.g. bad redirect).
            let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
            loop {
                tokio::select! {
                    item = output.next() => {
                        match item {
                            Some(Ok(log)) => startup_errors.push_str(&log.to_string()),
                            Some(Err(_)) | None => break,
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }

        Ok(ExecToFileHandle { exec_id: exec.id, startup_errors })
    }

    /// **tail-file**: streams lines produced after `start_line`.
    pub async fn tail_file(&self, container_id: &str, path: &str, start_line: u64) -> Result<(String, ExecByteStream)> {
        let cmd = vec![
            "tail".to_string(),
            "-n".to_string(),
            format!("+{}", start_line + 1),
            "-f".to_string(),
            path.to_string(),
        ];
        self.exec(container_id, cmd).await
    }

    /// **read-file**: full-content read, used to catch up after the tail closes.
    pub async fn read_file(&self, container_id: &str, path: &str) -> Result<String> {
        let out = self.run_to_completion(container_id, vec!["cat".to_string(), path.to_string()]).await?;
        Ok(out)
    }

    pub async fn file_exists(&self, container_id: &str, path: &str) -> Result<bool> {
        let options = CreateExecOptions {
            cmd: Some(vec!["test".to_string(), "-e".to_string(), path.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, options).await?;
        self.drain_exec(&exec.id).await?;
        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code == Some(0))
    }

    /// **find-process**: `pattern` identifies the agent binary path, not a caller-supplied regex.
    pub async fn find_process(&self, container_id: &str, pattern: &str) -> Result<Option<u32>> {
        let out = self
            .run_to_completion(container_id, vec!["pgrep".to_string(), "-f".to_string(), pattern.to_string()])
            .await
            .unwrap_or_default();
        Ok(out.lines().next().and_then(|l| l.trim().parse::<u32>().ok()))
    }

    pub async fn signal_process_by_pid(&self, container_id: &str, pid: u32, signal: Signal) -> Result<()> {
        self.run_to_completion(
            container_id,
            vec!["kill".to_string(), format!("-{}", signal.as_str()), pid.to_string()],
        )
        .await?;
        Ok(())
    }

    pub async fn signal_processes_by_pattern(&self, container_id: &str, pattern: &str, signal: Signal) -> Result<()> {
        self.run_to_completion(
            container_id,
            vec!["pkill".to_string(), format!("-{}", signal.as_str()), "-f".to_string(), pattern.to_string()],
        )
        .await?;
        Ok(())
    }

    /// **exec-status**: `not_found` is reported as `Ok(EngineExecStatus::NotFound)`.
    pub async fn exec_status(&self, exec_id: &str) -> Result<EngineExecStatus> {
        match self.docker.inspect_exec(exec_id).await {
            Ok(inspect) => {
                if inspect.running.unwrap_or(false) {
                    Ok(EngineExecStatus::Running)
                } else {
                    Ok(EngineExecStatus::Exited { exit_code: inspect.exit_code.unwrap_or(0) })
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(EngineExecStatus::NotFound)
            }
            Err(e) => Err(ContainerError::ApiError(e)),
        }
    }

    async fn run_to_completion(&self, container_id: &str, cmd: Vec<String>) -> Result<String> {
        Ok(self.exec_and_wait(container_id, cmd).await?.output)
    }

    /// Runs `cmd` to completion and returns its combined output alongside the exit code,
    /// so callers that care about success/failure (workspace provisioning) don't have to
    /// re-inspect the exec themselves.
    pub async fn exec_and_wait(&self, container_id: &str, cmd: Vec<String>) -> Result<ExecOutcome> {
        let (exec_id, mut stream) = self.exec(container_id, cmd).await?;
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&chunk?);
        }
        let exit_code = match self.exec_status(&exec_id).await? {
            EngineExecStatus::Exited { exit_code } => exit_code,
            _ => 0,
        };
        Ok(ExecOutcome { output, exit_code })
    }

    async fn drain_exec(&self, exec_id: &str) -> Result<()> {
        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(exec_id, None).await? {
            while output.next().await.is_some() {}
        }
        Ok(())
    }

    /// Copy a file into the container at `dest_path`, creating parent directories.
    /// Used by the credential propagator.
    #[cfg(feature = "containers")]
    pub async fn upload_file(&self, container_id: &str, dest_dir: &str, file_name: &str, contents: &[u8]) -> Result<()> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, file_name, contents)?;
        let tar_bytes = builder.into_inner()?;

        self.docker
            .upload_to_container(
                container_id,
                Some(bollard::query_parameters::UploadToContainerOptions {
                    path: dest_dir.to_string(),
                    ..Default::default()
                }),
                tar_bytes.into(),
            )
            .await?;
        Ok(())
    }
}

fn shell_quote(arg: &str) -> String {
    if arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:@%".contains(c)) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_passes_through_plain_args() {
        assert_eq!(shell_quote("--resume"), "--resume");
        assert_eq!(shell_quote("/tmp/out.jsonl"), "/tmp/out.jsonl");
    }

    #[test]
    fn shell_quote_escapes_special_characters() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("hello world"), "'hello world'");
    }

    #[test]
    fn signal_names_match_kill_syntax() {
        assert_eq!(Signal::Sigint.as_str(), "INT");
        assert_eq!(Signal::Sigterm.as_str(), "TERM");
        assert_eq!(Signal::Sigkill.as_str(), "KILL");
    }
}
