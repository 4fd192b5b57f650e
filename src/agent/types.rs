//! Wire types for the agent CLI's newline-delimited JSON output.
//!
//! Kept deliberately loose (`serde_json::Value` for nested, not-yet-interpreted
//! payloads) because the runtime only needs to discriminate on `type`, track
//! message ids, and reassemble text/tool_use content blocks — it never
//! round-trips a typed representation back out to the agent.

use serde::{Deserialize, Serialize};

/// Top-level discriminant of one line of agent output.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputLine {
    #[serde(rename = "type")]
    pub line_type: String,
    #[serde(flatten)]
    pub rest: serde_json::Value,
}

/// Payload of a `type: "stream_event"` line.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventLine {
    pub event: StreamEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStartInfo },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: usize, content_block: ContentBlockSeed },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: ContentDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta {},
    #[serde(rename = "message_stop")]
    MessageStop {},
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageStartInfo {
    pub id: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlockSeed {
    #[serde(rename = "text")]
    Text { text: Option<String> },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

/// A reconstructed content block, used both for the live partial-message
/// snapshot and as the shape persisted in a final `assistant` message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        /// Present (and a raw, possibly-invalid-JSON string) while input is
        /// still accumulating; the final non-stream message carries whole,
        /// valid JSON here instead of this escape hatch.
        #[serde(skip_serializing_if = "Option::is_none")]
        _partial: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
    },
}
