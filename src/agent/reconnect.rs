//! Reconnect to an orphaned execution.
//!
//! Runs for every `AgentExecution` row found with no matching in-memory
//! entry: at startup (via the reconciler) or whenever a fresh process
//! discovers a row it didn't create. The exec-id recorded in the row has no
//! meaning across a service restart, so "still running" is decided by
//! process discovery rather than `exec_status`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::warn;
use uuid::Uuid;

use crate::container::{EngineExecStatus, ObservedStatus};
use crate::errors::Result;
use crate::store::AgentExecution;

use super::runner::AgentRunner;

/// Outcome of one reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOutcome {
    pub reconnected: bool,
    pub still_running: bool,
}

impl AgentRunner {
    pub async fn reconnect(self: &Arc<Self>, session_id: Uuid) -> Result<ReconnectOutcome> {
        let Some(execution) = self.store.get_execution(session_id).await else {
            return Ok(ReconnectOutcome { reconnected: false, still_running: false });
        };
        if self.active.contains(&session_id) {
            // Already owned by this process; nothing to reconnect.
            return Ok(ReconnectOutcome { reconnected: true, still_running: true });
        }

        // Step 1: container must still be running for the agent to possibly be alive.
        let state = self.engine.inspect_state(&execution.container_id).await?;
        if state.status != ObservedStatus::Running {
            if let Some(code) = state.exit_code.filter(|c| *c != 0) {
                self.record_failure(session_id, &execution.container_id, code).await;
            }
            self.catch_up_and_drop(session_id, &execution).await;
            return Ok(ReconnectOutcome { reconnected: false, still_running: false });
        }

        // Step 2: probe exec-status; fall back to process discovery when the exec-id
        // is unknown to this process (service restarted since launch).
        let pid = match self.engine.exec_status(&execution.exec_id).await? {
            EngineExecStatus::Running => execution.pid,
            EngineExecStatus::NotFound => {
                match self.engine.find_process(&execution.container_id, &self.config.agent_binary_path).await? {
                    Some(pid) => {
                        self.store.update_execution_pid(session_id, pid).await?;
                        Some(pid)
                    }
                    None => {
                        // Agent finished before the restart; no exit code is knowable
                        // from here (the exec-id that had it is gone), so none is surfaced.
                        self.catch_up_and_drop(session_id, &execution).await;
                        return Ok(ReconnectOutcome { reconnected: false, still_running: false });
                    }
                }
            }
            EngineExecStatus::Exited { exit_code } => {
                if exit_code != 0 && exit_code != 130 {
                    self.record_failure(session_id, &execution.container_id, exit_code).await;
                }
                self.catch_up_and_drop(session_id, &execution).await;
                return Ok(ReconnectOutcome { reconnected: false, still_running: false });
            }
        };

        // Step 3: still running. Register in-memory and resume consumption, but
        // poll `find_process` instead of `exec_status` for termination.
        self.tracker.track(execution.exec_id.clone(), session_id);
        self.active.insert(session_id);
        self.bus.emit_agent_running(session_id, true);

        let runner = Arc::clone(self);
        let container_id = execution.container_id.clone();
        let output_file = execution.output_file.clone();
        tokio::spawn(async move {
            runner.consume_by_pid(session_id, container_id, output_file, pid).await;
        });

        Ok(ReconnectOutcome { reconnected: true, still_running: true })
    }

    /// Catch-up, used for both the "container not running" and "agent already
    /// finished" branches of reconnect.
    async fn catch_up_and_drop(&self, session_id: Uuid, execution: &AgentExecution) {
        if let Ok(text) = self.engine.read_file(&execution.container_id, &execution.output_file).await {
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                self.catch_up_line(session_id, line).await;
            }
        }
        let _ = self.store.delete_execution(session_id).await;
    }

    /// Same shape as the launch-time consumption loop, but termination is decided
    /// by the agent pid disappearing rather than an exec-id exit status, since the
    /// exec-id recorded before a restart is not authoritative.
    async fn consume_by_pid(self: Arc<Self>, session_id: Uuid, container_id: String, output_file: String, pid: Option<u32>) {
        let (_tail_exec_id, mut stream) = match self.engine.tail_file(&container_id, &output_file, 0).await {
            Ok(v) => v,
            Err(e) => {
                warn!("session {session_id}: reconnect tail failed: {e}");
                self.finish(&session_id, &container_id, None).await;
                return;
            }
        };

        let mut buffer = String::new();
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.exec_status_poll_millis));
        poll.tick().await;

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
                                    let _ = self.process_output_line(session_id, line).await;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!("session {session_id}: reconnect tail stream error: {e}");
                            break;
                        }
                        None => break,
                    }
                }
                _ = poll.tick() => {
                    let observed = self.engine.find_process(&container_id, &self.config.agent_binary_path).await.unwrap_or(None);
                    let still_alive = match pid {
                        Some(pid) => observed == Some(pid),
                        None => observed.is_some(),
                    };
                    if !still_alive {
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Ok(text) = self.engine.read_file(&container_id, &output_file).await {
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                self.catch_up_line(session_id, line).await;
            }
        }

        self.finish(&session_id, &container_id, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_outcome_is_plain_data() {
        let outcome = ReconnectOutcome { reconnected: true, still_running: true };
        assert!(outcome.reconnected && outcome.still_running);
    }
}
