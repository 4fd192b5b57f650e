//! Event bus.
//!
//! One broadcast channel per process carries every event for every session;
//! subscribers filter by `(topic, session-id)` in [`super::subscription`].
//! Grounded on the pack's `dcm2610-StellarStack` daemon event bus, which uses
//! the same `tokio::sync::broadcast` shape for the same reason: many
//! concurrent subscribers, synchronous emission from the publisher's point
//! of view, no durability requirement.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Default channel capacity. Raised well past the teacher's default so a
/// burst of assistant-message deltas across many concurrent sessions doesn't
/// lag slow subscribers off the bus before they've had a chance to drain it.
const DEFAULT_CAPACITY: usize = 8192;

/// One event on the bus. Each variant corresponds to one of three topics:
/// `session:<id>`, `messages:<id>`, `agent:<id>`.
#[derive(Debug, Clone)]
pub enum Event {
    /// `session:<id>` — the session's status changed (including via reconciliation).
    SessionUpdate { session_id: Uuid, status: crate::session::model::SessionStatus },
    /// `messages:<id>` — a message was persisted, or an in-flight partial advanced.
    /// Partial emissions carry `sequence = -1`.
    NewMessage { session_id: Uuid, sequence: i64, message_id: String, content: String },
    /// `agent:<id>` — the agent-running flag flipped.
    AgentRunning { session_id: Uuid, running: bool },
}

impl Event {
    pub fn session_id(&self) -> Uuid {
        match self {
            Event::SessionUpdate { session_id, .. } => *session_id,
            Event::NewMessage { session_id, .. } => *session_id,
            Event::AgentRunning { session_id, .. } => *session_id,
        }
    }
}

/// Process-local pub/sub bus. Cloning shares the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Max listener count is effectively the channel capacity times backlog
    /// tolerance; `subscribe` itself has no upper bound on concurrent receivers.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn emit(&self, event: Event) {
        // No receivers is not an error: a session with no live subscribers still runs.
        let _ = self.sender.send(event);
    }

    pub fn emit_session_update(&self, session_id: Uuid, status: crate::session::model::SessionStatus) {
        self.emit(Event::SessionUpdate { session_id, status });
    }

    pub fn emit_new_message(&self, session_id: Uuid, sequence: i64, message_id: &str, content: &str) {
        self.emit(Event::NewMessage {
            session_id,
            sequence,
            message_id: message_id.to_string(),
            content: content.to_string(),
        });
    }

    /// Emit a live partial-message snapshot with `sequence = -1`.
    pub fn emit_partial_message(&self, session_id: Uuid, snapshot: &crate::agent::accumulator::PartialSnapshot) {
        let content = serde_json::json!({
            "type": "assistant",
            "message": {
                "id": snapshot.message_id,
                "content": partial_content_json(&snapshot.content),
            },
        });
        self.emit(Event::NewMessage {
            session_id,
            sequence: -1,
            message_id: snapshot.message_id.clone(),
            content: content.to_string(),
        });
    }

    pub fn emit_agent_running(&self, session_id: Uuid, running: bool) {
        self.emit(Event::AgentRunning { session_id, running });
    }
}

fn partial_content_json(blocks: &[crate::agent::accumulator::PartialContentBlock]) -> serde_json::Value {
    use crate::agent::accumulator::PartialContentBlock;
    serde_json::Value::Array(
        blocks
            .iter()
            .map(|b| match b {
                PartialContentBlock::Text { text } => serde_json::json!({"type": "text", "text": text}),
                PartialContentBlock::ToolUse { id, name, parsed, raw } => match parsed {
                    Some(input) => serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": input}),
                    None => serde_json::json!({"type": "tool_use", "id": id, "name": name, "_partial": raw}),
                },
            })
            .collect(),
    )
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::SessionStatus;

    #[tokio::test]
    async fn subscribers_receive_emitted_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let session_id = Uuid::new_v4();

        bus.emit_session_update(session_id, SessionStatus::Running);
        bus.emit_agent_running(session_id, true);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::SessionUpdate { status: SessionStatus::Running, .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::AgentRunning { running: true, .. }));
    }

    #[tokio::test]
    async fn emitting_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit_agent_running(Uuid::new_v4(), false);
    }

    #[test]
    fn subscriber_count_tracks_live_receivers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
