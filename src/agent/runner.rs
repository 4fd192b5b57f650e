//! Agent runner.
//!
//! One `run` call launches exactly one agent CLI invocation per user turn,
//! streams its output file live, persists the messages it produces, and fans
//! updates out over the event bus. Grounded on the argument-building shape of
//! `claude::interface` (`--verbose`, `--append-system-prompt`, stream-json
//! output), adapted from a host subprocess to exec-to-file inside a session's
//! container.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::accumulator::AccumulatorRegistry;
use crate::agent::types::{StreamEvent, StreamEventLine};
use crate::config::RuntimeConfig;
use crate::container::{ContainerEngine, EngineExecStatus, ExecTracker, ObservedStatus};
use crate::errors::{Result, RuntimeError};
use crate::events::bus::EventBus;
use crate::session::model::SessionStatus;
use crate::store::{AgentExecution, MessageType, Store};

/// Appended to every agent invocation's system prompt.
pub const SYSTEM_PROMPT: &str = "Commit and push your changes as you go. The user only observes \
your work through the remote repository, not this terminal, so uncommitted or unpushed work is \
invisible to them.";

pub struct AgentRunner {
    pub(crate) config: Arc<RuntimeConfig>,
    pub(crate) engine: Arc<ContainerEngine>,
    pub(crate) store: Arc<Store>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) tracker: Arc<ExecTracker>,
    pub(crate) accumulators: Mutex<AccumulatorRegistry>,
    pub(crate) active: DashSet<Uuid>,
}

impl AgentRunner {
    pub fn new(
        config: Arc<RuntimeConfig>,
        engine: Arc<ContainerEngine>,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        tracker: Arc<ExecTracker>,
    ) -> Self {
        Self { config, engine, store, bus, tracker, accumulators: Mutex::new(AccumulatorRegistry::new()), active: DashSet::new() }
    }

    pub fn is_running(&self, session_id: Uuid) -> bool {
        self.active.contains(&session_id)
    }

    /// Launch one agent invocation for `prompt`. Returns once the exec has been
    /// launched and bookkeeping recorded; the consumption loop runs in the
    /// background and reports progress over the event bus.
    pub async fn run(self: &Arc<Self>, session_id: Uuid, prompt: &str) -> Result<()> {
        self.check_preconditions(session_id).await?;

        let session = self.store.get_session(session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(RuntimeError::precondition(format!("session {session_id} is not running")));
        }
        let container_id =
            session.container_id.clone().ok_or_else(|| RuntimeError::precondition("session has no container"))?;

        let is_first_turn = self.store.list_messages(session_id).await.is_empty();

        let user_message = self
            .store
            .append_message(
                session_id,
                Uuid::new_v4().to_string(),
                MessageType::User,
                serde_json::json!({"type": "user", "content": prompt}).to_string(),
            )
            .await?
            .ok_or_else(|| RuntimeError::precondition("failed to persist user message"))?;
        self.bus.emit_new_message(session_id, user_message.sequence, &user_message.message_id, &user_message.content);

        let cmd = self.build_command(session_id, prompt, is_first_turn);
        let output_file = self.config.session_output_file(session_id);

        let handle = self.engine.exec_to_file(&container_id, &cmd, &output_file).await?;
        if !handle.startup_errors.trim().is_empty() {
            return Err(RuntimeError::EngineFailure(format!("agent launch redirect failed: {}", handle.startup_errors)));
        }

        self.store
            .upsert_execution(AgentExecution {
                session_id,
                container_id: container_id.clone(),
                exec_id: handle.exec_id.clone(),
                output_file: output_file.clone(),
                last_sequence: user_message.sequence,
                pid: None,
                started_at: chrono::Utc::now(),
            })
            .await?;
        self.tracker.track(handle.exec_id.clone(), session_id);
        self.active.insert(session_id);
        self.bus.emit_agent_running(session_id, true);

        let runner = Arc::clone(self);
        let container_id_for_pid = container_id.clone();
        tokio::spawn(async move { runner.discover_pid(session_id, &container_id_for_pid).await });

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.consume(session_id, container_id, handle.exec_id, output_file).await;
        });

        Ok(())
    }

    async fn check_preconditions(&self, session_id: Uuid) -> Result<()> {
        if self.active.contains(&session_id) {
            return Err(RuntimeError::already_running(session_id));
        }
        if let Some(row) = self.store.get_execution(session_id).await {
            let still_running = matches!(self.engine.exec_status(&row.exec_id).await, Ok(EngineExecStatus::Running));
            if still_running {
                return Err(RuntimeError::already_running(session_id));
            }
            self.store.delete_execution(session_id).await?;
        }
        Ok(())
    }

    fn build_command(&self, session_id: Uuid, prompt: &str, is_first_turn: bool) -> Vec<String> {
        let mut cmd = vec![
            "claude".to_string(),
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--include-partial-messages".to_string(),
        ];
        if is_first_turn {
            cmd.push("--session-id".to_string());
            cmd.push(session_id.to_string());
        } else {
            cmd.push("--resume".to_string());
            cmd.push(session_id.to_string());
        }
        cmd.push("--append-system-prompt".to_string());
        cmd.push(SYSTEM_PROMPT.to_string());
        cmd.push(prompt.to_string());
        cmd
    }

    async fn discover_pid(&self, session_id: Uuid, container_id: &str) {
        for _ in 0..self.config.pid_discovery_attempts {
            tokio::time::sleep(Duration::from_millis(self.config.pid_discovery_interval_millis)).await;
            if let Ok(Some(pid)) = self.engine.find_process(container_id, &self.config.agent_binary_path).await {
                let _ = self.store.update_execution_pid(session_id, pid).await;
                return;
            }
        }
    }

    /// Tail the output file to completion, then run cleanup unconditionally.
    async fn consume(self: Arc<Self>, session_id: Uuid, container_id: String, exec_id: String, output_file: String) {
        if let Err(e) = self.wait_for_output_file(&container_id, &output_file).await {
            warn!("session {session_id}: {e}");
            self.finish(&session_id, &container_id, None).await;
            return;
        }

        let lines_consumed = match self.tail_and_process(&session_id, &container_id, &output_file, &exec_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!("session {session_id}: tail loop error: {e}");
                0
            }
        };

        let exit_code = match self.engine.exec_status(&exec_id).await {
            Ok(EngineExecStatus::Exited { exit_code }) => Some(exit_code),
            _ => None,
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Ok(text) = self.engine.read_file(&container_id, &output_file).await {
            let all_lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
            for line in all_lines.into_iter().skip(lines_consumed) {
                self.catch_up_line(session_id, line).await;
            }
        }

        if let Some(code) = exit_code
            && code != 0
            && code != 130
        {
            self.record_failure(session_id, &container_id, code).await;
        }

        self.finish(&session_id, &container_id, exit_code).await;
    }

    async fn wait_for_output_file(&self, container_id: &str, output_file: &str) -> Result<()> {
        let attempts = (self.config.output_file_wait_secs * 10).max(1);
        for _ in 0..attempts {
            if self.engine.file_exists(container_id, output_file).await.unwrap_or(false) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(RuntimeError::precondition(format!("agent output file {output_file} never appeared")))
    }

    /// Tails the output file and polls exec status concurrently; returns the
    /// number of non-empty lines processed from the tail.
    async fn tail_and_process(
        &self,
        session_id: &Uuid,
        container_id: &str,
        output_file: &str,
        exec_id: &str,
    ) -> Result<usize> {
        let (_tail_exec_id, mut stream) = self.engine.tail_file(container_id, output_file, 0).await?;
        let mut buffer = String::new();
        let mut lines_consumed = 0usize;
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.exec_status_poll_millis));
        poll.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            buffer.push_str(&bytes);
                            while let Some(pos) = buffer.find('\n') {
                                let line: String = buffer.drain(..=pos).collect();
                                let line = line.trim_end_matches('\n');
                                if !line.trim().is_empty() {
                                    let _ = self.process_output_line(*session_id, line).await;
                                    lines_consumed += 1;
                                }
                            }
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    }
                }
                _ = poll.tick() => {
                    if matches!(self.engine.exec_status(exec_id).await, Ok(EngineExecStatus::Exited { .. })) {
                        break;
                    }
                }
            }
        }
        Ok(lines_consumed)
    }

    /// Parse, classify, persist, and fan out one line of agent output.
    pub(crate) async fn process_output_line(&self, session_id: Uuid, line: &str) -> Result<()> {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("session {session_id}: unparsable agent output line, dropping: {e}");
                return Ok(());
            }
        };

        let line_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("system");
        if line_type == "stream_event" {
            if let Ok(stream_line) = serde_json::from_value::<StreamEventLine>(value) {
                let snapshot = self.accumulators.lock().await.handle(session_id, stream_line.event);
                if let Some(snapshot) = snapshot {
                    self.bus.emit_partial_message(session_id, &snapshot);
                }
            }
            return Ok(());
        }

        let message_type = MessageType::from_wire_type(line_type);
        let message_id = derive_message_id(&value, message_type);

        if let Some(message) =
            self.store.append_message(session_id, message_id, message_type, value.to_string()).await?
        {
            self.store.update_execution_sequence(session_id, message.sequence).await?;
            self.bus.emit_new_message(session_id, message.sequence, &message.message_id, &message.content);
        }
        Ok(())
    }

    /// Catch-up: same as [`Self::process_output_line`], except an unparsable
    /// line becomes a synthetic `system/error` message instead of being dropped, so
    /// the transcript records that a line was lost. The v5 id keyed on the exact
    /// line content means re-running catch-up over the same file never duplicates it.
    pub(crate) async fn catch_up_line(&self, session_id: Uuid, line: &str) {
        if serde_json::from_str::<serde_json::Value>(line).is_err() {
            let message_id = error_message_id(session_id, line);
            let content = serde_json::json!({
                "type": "system",
                "subtype": "error",
                "error": "failed to parse agent output line during catch-up",
                "raw_line": line,
            });
            if let Ok(Some(message)) =
                self.store.append_message(session_id, message_id, MessageType::System, content.to_string()).await
            {
                self.bus.emit_new_message(session_id, message.sequence, &message.message_id, &message.content);
            }
            return;
        }
        let _ = self.process_output_line(session_id, line).await;
    }

    pub(crate) async fn record_failure(&self, session_id: Uuid, container_id: &str, exit_code: i64) {
        let state = self.engine.inspect_state(container_id).await.ok();
        let container_failed = state.as_ref().map(|s| s.status != ObservedStatus::Running).unwrap_or(true);

        let (tail_lines, synthesized_type) = if container_failed { (50u32, "system") } else { (30u32, "agent") };
        let logs = self.engine.logs(container_id, Some(tail_lines)).await.unwrap_or(None).unwrap_or_default();
        let description = RuntimeError::describe_exit_code(exit_code);

        let content = if container_failed {
            serde_json::json!({
                "type": "system",
                "subtype": "error",
                "error": format!("container stopped unexpectedly: {description}"),
                "exit_code": exit_code,
                "logs": logs,
            })
        } else {
            serde_json::json!({
                "type": "system",
                "subtype": "error",
                "error": format!("Claude process exited unexpectedly: {description}"),
                "exit_code": exit_code,
                "logs": logs,
            })
        };
        info!("session {session_id}: synthesizing {synthesized_type} failure message (exit {exit_code})");

        if let Ok(Some(message)) =
            self.store.append_message(session_id, Uuid::new_v4().to_string(), MessageType::System, content.to_string()).await
        {
            self.bus.emit_new_message(session_id, message.sequence, &message.message_id, &message.content);
        }
    }

    /// Cleanup guaranteed on every exit path.
    pub(crate) async fn finish(&self, session_id: &Uuid, _container_id: &str, _exit_code: Option<i64>) {
        if let Some(row) = self.store.get_execution(*session_id).await {
            self.tracker.forget(&row.exec_id);
        }
        let _ = self.store.delete_execution(*session_id).await;
        self.accumulators.lock().await.forget(*session_id);
        self.active.remove(session_id);
        self.bus.emit_agent_running(*session_id, false);
    }
}

/// Message-id derivation for a normally-parsed output line.
pub(crate) fn derive_message_id(value: &serde_json::Value, message_type: MessageType) -> String {
    if message_type == MessageType::Assistant
        && let Some(id) = value.get("message").and_then(|m| m.get("id")).and_then(|i| i.as_str())
    {
        return id.to_string();
    }
    if let Some(id) = value.get("uuid").and_then(|i| i.as_str()).or_else(|| value.get("id").and_then(|i| i.as_str())) {
        return id.to_string();
    }
    // No id on the wire: two structurally identical lines (e.g. a bare
    // `{"type":"result",...}`) would hash to the same id if derived from
    // content, and the second would be dropped as a duplicate. Fresh v4 for
    // every such message; the deterministic v5 scheme below is reserved for
    // catch-up's synthetic parse-error messages, where dedup on exact replay
    // is the point.
    Uuid::new_v4().to_string()
}

/// Deterministic id for a synthetic parse-error message, keyed on the exact
/// line so re-running catch-up over the same output file never duplicates it.
pub(crate) fn error_message_id(session_id: Uuid, line: &str) -> String {
    let namespace = Uuid::new_v5(&Uuid::NAMESPACE_OID, session_id.as_bytes());
    Uuid::new_v5(&namespace, format!("error:{line}").as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_id_is_stable_for_identical_lines() {
        let session = Uuid::new_v4();
        let a = error_message_id(session, "not json");
        let b = error_message_id(session, "not json");
        assert_eq!(a, b);
        let c = error_message_id(session, "different");
        assert_ne!(a, c);
    }

    #[test]
    fn assistant_message_id_comes_from_model_payload() {
        let value = serde_json::json!({"type": "assistant", "message": {"id": "msg_99"}});
        let id = derive_message_id(&value, MessageType::Assistant);
        assert_eq!(id, "msg_99");
    }

    #[test]
    fn repeated_id_less_lines_get_distinct_ids() {
        let value = serde_json::json!({"type": "result", "subtype": "success", "is_error": false});
        let a = derive_message_id(&value, MessageType::System);
        let b = derive_message_id(&value, MessageType::System);
        assert_ne!(a, b);
    }
}
