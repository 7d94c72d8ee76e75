//! Client frames.
//!
//! Inbound frames are `{mime_type, data, role?}`. Outbound frames are one of
//! a turn status, a message with a role, or an error notice.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use serena_core::artifacts::ArtifactRef;
use serena_core::events::{LiveEvent, LiveRequest};
use serena_core::messages::{Blob, Content, Part, Role};
use serena_engine::voice::INPUT_AUDIO_MIME;

pub const TEXT_PLAIN: &str = "text/plain";
pub const AUDIO_PCM: &str = "audio/pcm";
pub const URI_LIST: &str = "text/uri-list";

pub const ROLE_MODEL: &str = "model";
pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER_TRANSCRIPTION: &str = "user_transcription";

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct InboundFrame {
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Status {
        turn_complete: bool,
        interrupted: bool,
    },
    Message {
        mime_type: String,
        data: String,
        role: String,
    },
    Error {
        error: String,
        role: String,
    },
}

impl OutboundFrame {
    pub fn text(data: impl Into<String>, role: &str) -> Self {
        Self::Message {
            mime_type: TEXT_PLAIN.into(),
            data: data.into(),
            role: role.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            role: ROLE_SYSTEM.into(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Mime type not supported: {0}")]
    UnsupportedMime(String),

    #[error("Invalid audio data: {0}")]
    InvalidAudio(String),

    #[error("Invalid frame: {0}")]
    Malformed(String),
}

/// Parse a text frame into a live request.
pub fn decode_inbound(raw: &str) -> Result<LiveRequest, FrameError> {
    let frame: InboundFrame =
        serde_json::from_str(raw).map_err(|e| FrameError::Malformed(e.to_string()))?;
    match frame.mime_type.as_str() {
        TEXT_PLAIN => Ok(LiveRequest::Content(Content::user_text(frame.data))),
        m if m.starts_with(AUDIO_PCM) => {
            let pcm = STANDARD
                .decode(frame.data.as_bytes())
                .map_err(|e| FrameError::InvalidAudio(e.to_string()))?;
            Ok(LiveRequest::Realtime(Blob::new(INPUT_AUDIO_MIME, pcm)))
        }
        other => Err(FrameError::UnsupportedMime(other.to_string())),
    }
}

/// Frames for one live event. Some events produce none.
pub fn encode_event(event: &LiveEvent) -> Vec<OutboundFrame> {
    match event {
        LiveEvent::TurnBoundary {
            turn_complete,
            interrupted,
        } => vec![OutboundFrame::Status {
            turn_complete: *turn_complete,
            interrupted: *interrupted,
        }],
        LiveEvent::ToolCall { name, .. } => {
            vec![OutboundFrame::text(format!("Running {name}..."), ROLE_SYSTEM)]
        }
        LiveEvent::ToolResult { name, response } => match ArtifactRef::from_payload(response) {
            Some(artifact) => vec![OutboundFrame::Message {
                mime_type: URI_LIST.into(),
                data: artifact.url(),
                role: ROLE_MODEL.into(),
            }],
            None => {
                debug!(tool = %name, "tool result carries no artifact");
                Vec::new()
            }
        },
        LiveEvent::Content { role, parts, .. } => parts
            .iter()
            .filter_map(|part| encode_part(*role, part))
            .collect(),
    }
}

fn encode_part(role: Role, part: &Part) -> Option<OutboundFrame> {
    if let Some(text) = part.as_text() {
        if text.is_empty() {
            return None;
        }
        let role = match role {
            Role::User => ROLE_USER_TRANSCRIPTION,
            _ => ROLE_MODEL,
        };
        return Some(OutboundFrame::text(text, role));
    }
    let blob = part.as_blob()?;
    if !blob.is_pcm_audio() {
        debug!(mime_type = %blob.mime_type, "skipping non-audio inline part");
        return None;
    }
    Some(OutboundFrame::Message {
        mime_type: AUDIO_PCM.into(),
        data: STANDARD.encode(&blob.data),
        role: ROLE_MODEL.into(),
    })
}
