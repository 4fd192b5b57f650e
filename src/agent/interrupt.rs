//! Interrupt and "mark interrupted".

use uuid::Uuid;

use crate::container::{EngineExecStatus, ObservedStatus, Signal};
use crate::errors::{Result, RuntimeError};
use crate::store::MessageType;

use super::runner::AgentRunner;

impl AgentRunner {
    /// `interrupt(session-id)`. Returns `Ok(true)` once the signal has been
    /// delivered and the interrupt markers have been written.
    pub async fn interrupt(&self, session_id: Uuid) -> Result<bool> {
        let Some(execution) = self.store.get_execution(session_id).await else {
            return Err(RuntimeError::precondition("no running agent for session"));
        };

        let state = self.engine.inspect_state(&execution.container_id).await?;
        if state.status != ObservedStatus::Running {
            self.store.delete_execution(session_id).await?;
            return Err(RuntimeError::precondition("no running agent: container not running"));
        }

        match execution.pid {
            Some(pid) => {
                self.engine.signal_process_by_pid(&execution.container_id, pid, Signal::Sigint).await?;
            }
            None => {
                self.engine
                    .signal_processes_by_pattern(&execution.container_id, &self.config.agent_binary_path, Signal::Sigint)
                    .await?;
            }
        }

        self.mark_last_message_as_interrupted(session_id).await?;
        Ok(true)
    }

    /// Flip `interrupted: true` on the last non-user message and append a
    /// synthetic `user/interrupt` indicator.
    async fn mark_last_message_as_interrupted(&self, session_id: Uuid) -> Result<()> {
        if let Some(message) = self.store.last_non_user_message(session_id).await {
            let mut content: serde_json::Value = serde_json::from_str(&message.content).unwrap_or(serde_json::json!({}));
            if let Some(obj) = content.as_object_mut() {
                obj.insert("interrupted".to_string(), serde_json::Value::Bool(true));
            }
            self.store.update_message_content(session_id, &message.message_id, content.to_string()).await?;
            self.bus.emit_new_message(session_id, message.sequence, &message.message_id, &content.to_string());
        }

        let indicator = serde_json::json!({"type": "user", "subtype": "interrupt"});
        if let Some(message) = self
            .store
            .append_message(session_id, uuid::Uuid::new_v4().to_string(), MessageType::User, indicator.to_string())
            .await?
        {
            self.bus.emit_new_message(session_id, message.sequence, &message.message_id, &message.content);
        }
        Ok(())
    }

    /// `agent.isRunning(session-id)`, consulting in-memory state first.
    pub async fn is_running_persisted(&self, session_id: Uuid) -> bool {
        if self.is_running(session_id) {
            return true;
        }
        match self.store.get_execution(session_id).await {
            Some(row) => matches!(self.engine.exec_status(&row.exec_id).await, Ok(EngineExecStatus::Running)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_flag_is_set_on_plain_json_object() {
        let mut content: serde_json::Value = serde_json::json!({"type": "assistant"});
        content.as_object_mut().unwrap().insert("interrupted".into(), serde_json::Value::Bool(true));
        assert_eq!(content["interrupted"], serde_json::Value::Bool(true));
    }
}
