use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messages::{Blob, Content, Part, Role};

/// Events emitted by a running live session, in FIFO order per session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    /// Text or inline-data parts. `partial` marks streamed deltas.
    Content {
        role: Role,
        parts: Vec<Part>,
        partial: bool,
    },
    TurnBoundary {
        turn_complete: bool,
        interrupted: bool,
    },
    ToolCall {
        name: String,
        args: Value,
    },
    ToolResult {
        name: String,
        response: Map<String, Value>,
    },
}

impl LiveEvent {
    pub fn turn_complete() -> Self {
        Self::TurnBoundary {
            turn_complete: true,
            interrupted: false,
        }
    }

    pub fn interrupted() -> Self {
        Self::TurnBoundary {
            turn_complete: false,
            interrupted: true,
        }
    }

    pub fn model_text(text: impl Into<String>, partial: bool) -> Self {
        Self::Content {
            role: Role::Model,
            parts: vec![Part::text(text)],
            partial,
        }
    }

    pub fn user_transcription(text: impl Into<String>) -> Self {
        Self::Content {
            role: Role::User,
            parts: vec![Part::text(text)],
            partial: false,
        }
    }

    pub fn model_audio(blob: Blob) -> Self {
        Self::Content {
            role: Role::Model,
            parts: vec![Part::inline(blob)],
            partial: false,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::TurnBoundary { .. } => "turn_boundary",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
        }
    }
}

/// Input pushed into a live session by the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum LiveRequest {
    /// A complete content message (typed text).
    Content(Content),
    /// A realtime media chunk (microphone PCM).
    Realtime(Blob),
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn turn_boundary_constructors() {
        assert_eq!(
            LiveEvent::turn_complete(),
            LiveEvent::TurnBoundary {
                turn_complete: true,
                interrupted: false
            }
        );
        assert_eq!(LiveEvent::interrupted().event_type(), "turn_boundary");
    }

    #[test]
    fn serialization_is_tagged() {
        let event = LiveEvent::ToolCall {
            name: "call_bq_agent".into(),
            args: json!({"user_query": "count users"}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["args"]["user_query"], "count users");
    }

    #[test]
    fn transcription_is_user_role() {
        match LiveEvent::user_transcription("hello") {
            LiveEvent::Content { role, partial, .. } => {
                assert_eq!(role, Role::User);
                assert!(!partial);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
