//! Partial-message accumulator.
//!
//! Reassembles the agent's `stream_event` deltas into an in-progress assistant
//! message, keyed by the model-assigned message id so the eventual persisted
//! final message can replace it in place on the client. At most one
//! partial message is held per session; stream events are never persisted.

use crate::agent::types::{ContentBlockSeed, ContentDelta, StreamEvent};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum PartialBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input_json: String },
}

struct PartialMessage {
    message_id: String,
    #[allow(dead_code)] // carried for parity with the wire shape; not currently surfaced
    model: String,
    blocks: Vec<Option<PartialBlock>>,
}

/// A reconstructed in-progress assistant message, ready to be wrapped in a
/// `new-message` event with `sequence = -1`.
#[derive(Debug, Clone)]
pub struct PartialSnapshot {
    pub message_id: String,
    pub content: Vec<PartialContentBlock>,
}

#[derive(Debug, Clone)]
pub enum PartialContentBlock {
    Text { text: String },
    /// `parsed` is `Some` only once `input_json` is valid JSON; otherwise the
    /// raw accumulator is surfaced under `_partial` so the UI can render progress.
    ToolUse { id: String, name: String, parsed: Option<serde_json::Value>, raw: String },
}

/// One accumulator per session.
#[derive(Default)]
pub struct PartialMessageAccumulator {
    partial: Option<PartialMessage>,
}

impl PartialMessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one `stream_event` payload; returns a snapshot to emit live, if any.
    pub fn handle(&mut self, event: StreamEvent) -> Option<PartialSnapshot> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.partial = Some(PartialMessage { message_id: message.id, model: message.model, blocks: Vec::new() });
                None
            }
            StreamEvent::ContentBlockStart { index, content_block } => {
                let partial = self.partial.as_mut()?;
                if partial.blocks.len() <= index {
                    partial.blocks.resize_with(index + 1, || None);
                }
                partial.blocks[index] = Some(match content_block {
                    ContentBlockSeed::Text { text } => PartialBlock::Text { text: text.unwrap_or_default() },
                    ContentBlockSeed::ToolUse { id, name } => PartialBlock::ToolUse { id, name, input_json: String::new() },
                });
                self.snapshot()
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let partial = self.partial.as_mut()?;
                let Some(Some(block)) = partial.blocks.get_mut(index) else { return None };
                match (block, delta) {
                    (PartialBlock::Text { text }, ContentDelta::TextDelta { text: delta_text }) => {
                        text.push_str(&delta_text);
                    }
                    (PartialBlock::ToolUse { input_json, .. }, ContentDelta::InputJsonDelta { partial_json }) => {
                        input_json.push_str(&partial_json);
                    }
                    _ => {}
                }
                self.snapshot()
            }
            StreamEvent::ContentBlockStop { .. } => self.snapshot(),
            StreamEvent::MessageDelta {} => None,
            StreamEvent::MessageStop {} => {
                self.partial = None;
                None
            }
        }
    }

    /// Build a snapshot if the in-flight partial has any displayable content:
    /// non-empty text, or a named tool_use block.
    fn snapshot(&self) -> Option<PartialSnapshot> {
        let partial = self.partial.as_ref()?;
        let mut content = Vec::new();
        let mut has_displayable = false;

        for block in partial.blocks.iter().flatten() {
            match block {
                PartialBlock::Text { text } => {
                    if !text.is_empty() {
                        has_displayable = true;
                    }
                    content.push(PartialContentBlock::Text { text: text.clone() });
                }
                PartialBlock::ToolUse { id, name, input_json } => {
                    has_displayable = true;
                    let parsed = serde_json::from_str::<serde_json::Value>(input_json).ok();
                    content.push(PartialContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        parsed,
                        raw: input_json.clone(),
                    });
                }
            }
        }

        has_displayable.then(|| PartialSnapshot { message_id: partial.message_id.clone(), content })
    }
}

/// One accumulator per session, looked up by session id.
#[derive(Default)]
pub struct AccumulatorRegistry {
    by_session: HashMap<uuid::Uuid, PartialMessageAccumulator>,
}

impl AccumulatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, session_id: uuid::Uuid, event: StreamEvent) -> Option<PartialSnapshot> {
        self.by_session.entry(session_id).or_default().handle(event)
    }

    pub fn forget(&mut self, session_id: uuid::Uuid) {
        self.by_session.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::MessageStartInfo;

    #[test]
    fn empty_text_block_start_is_not_emitted() {
        let mut acc = PartialMessageAccumulator::new();
        assert!(acc.handle(StreamEvent::MessageStart { message: MessageStartInfo { id: "msg_42".into(), model: "claude".into() } }).is_none());
        assert!(
            acc.handle(StreamEvent::ContentBlockStart { index: 0, content_block: ContentBlockSeed::Text { text: None } })
                .is_none()
        );
    }

    #[test]
    fn stream_then_stop_assembles_incremental_text() {
        let mut acc = PartialMessageAccumulator::new();
        acc.handle(StreamEvent::MessageStart { message: MessageStartInfo { id: "msg_42".into(), model: "claude".into() } });
        acc.handle(StreamEvent::ContentBlockStart { index: 0, content_block: ContentBlockSeed::Text { text: None } });

        let mut emissions = 0;
        for chunk in ["ab", "c", "d"] {
            if acc
                .handle(StreamEvent::ContentBlockDelta { index: 0, delta: ContentDelta::TextDelta { text: chunk.into() } })
                .is_some()
            {
                emissions += 1;
            }
        }
        assert_eq!(emissions, 3);

        let snap = acc.handle(StreamEvent::ContentBlockStop { index: 0 }).unwrap();
        assert_eq!(snap.message_id, "msg_42");
        match &snap.content[0] {
            PartialContentBlock::Text { text } => assert_eq!(text, "abcd"),
            _ => panic!("expected text block"),
        }

        assert!(acc.handle(StreamEvent::MessageStop {}).is_none());
    }

    #[test]
    fn tool_use_surfaces_raw_json_until_valid() {
        let mut acc = PartialMessageAccumulator::new();
        acc.handle(StreamEvent::MessageStart { message: MessageStartInfo { id: "msg_7".into(), model: "claude".into() } });
        acc.handle(StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlockSeed::ToolUse { id: "tool_1".into(), name: "Bash".into() },
        });
        let snap = acc
            .handle(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentDelta::InputJsonDelta { partial_json: "{\"command\":".into() },
            })
            .unwrap();
        match &snap.content[0] {
            PartialContentBlock::ToolUse { parsed, raw, .. } => {
                assert!(parsed.is_none());
                assert_eq!(raw, "{\"command\":");
            }
            _ => panic!("expected tool_use block"),
        }
    }

    #[test]
    fn message_start_with_no_content_is_not_emitted() {
        let mut acc = PartialMessageAccumulator::new();
        let emitted = acc.handle(StreamEvent::MessageStart { message: MessageStartInfo { id: "msg_1".into(), model: "claude".into() } });
        assert!(emitted.is_none());
    }
}
