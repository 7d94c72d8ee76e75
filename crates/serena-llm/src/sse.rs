//! SSE parsing for the Gemini streaming API.
//!
//! Each `data:` payload is a `GenerateContentResponse` chunk. Chunks are folded
//! into a [`StreamState`] that emits unified [`StreamEvent`]s and a final
//! `Done` carrying the aggregated [`ModelResponse`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

use serena_core::errors::GatewayError;
use serena_core::messages::Blob;
use serena_core::stream::{FinishReason, FunctionCall, ModelResponse, StreamEvent};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiStreamChunk {
    pub candidates: Option<Vec<GeminiCandidate>>,
    pub error: Option<GeminiApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    pub content: Option<GeminiContent>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    pub text: Option<String>,
    pub thought: Option<bool>,
    pub inline_data: Option<GeminiInlineData>,
    pub function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiInlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Deserialize)]
pub struct GeminiApiError {
    pub code: u16,
    pub message: String,
}

/// Accumulated state across the chunks of one stream.
#[derive(Debug, Default)]
pub struct StreamState {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
    pub inline_data: Vec<Blob>,
    pub started: bool,
    pub done: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Extract the `data:` payloads from a block of SSE text.
///
/// Multi-line data fields are joined with `\n`; comment and other field
/// lines are ignored.
pub fn parse_sse_lines(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            match current.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(data);
                }
                None => current = Some(data.to_string()),
            }
        } else if line.is_empty() {
            if let Some(buf) = current.take() {
                payloads.push(buf);
            }
        }
    }

    // Trailing event without blank line
    if let Some(buf) = current {
        payloads.push(buf);
    }
    payloads
}

/// Parse one `data:` payload and fold it into the state.
pub fn process_data(data: &str, state: &mut StreamState) -> Vec<StreamEvent> {
    match serde_json::from_str::<GeminiStreamChunk>(data) {
        Ok(chunk) => process_stream_chunk(&chunk, state),
        Err(e) => vec![StreamEvent::Error {
            error: GatewayError::MalformedResponse(format!("bad stream chunk: {e}")),
        }],
    }
}

pub fn process_stream_chunk(chunk: &GeminiStreamChunk, state: &mut StreamState) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if !state.started {
        state.started = true;
        events.push(StreamEvent::Start);
    }

    if let Some(error) = &chunk.error {
        state.done = true;
        events.push(StreamEvent::Error {
            error: GatewayError::from_status(error.code, error.message.clone()),
        });
        return events;
    }

    let Some(candidate) = chunk.candidates.as_ref().and_then(|c| c.first()) else {
        return events;
    };

    if let Some(content) = &candidate.content {
        for part in &content.parts {
            events.extend(process_part(part, state));
        }
    }

    if let Some(reason) = &candidate.finish_reason {
        events.extend(finish(FinishReason::from_gemini(reason), reason, state));
    }
    events
}

fn process_part(part: &GeminiPart, state: &mut StreamState) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    if let Some(text) = &part.text {
        // Thought summaries are not part of the answer.
        if part.thought != Some(true) && !text.is_empty() {
            state.text.push_str(text);
            events.push(StreamEvent::TextDelta {
                delta: text.clone(),
            });
        }
    }

    if let Some(inline) = &part.inline_data {
        match STANDARD.decode(inline.data.as_bytes()) {
            Ok(bytes) => {
                let blob = Blob::new(inline.mime_type.clone(), bytes);
                state.inline_data.push(blob.clone());
                events.push(StreamEvent::InlineData { blob });
            }
            Err(e) => events.push(StreamEvent::Error {
                error: GatewayError::MalformedResponse(format!("inline data is not base64: {e}")),
            }),
        }
    }

    if let Some(fc) = &part.function_call {
        let call = FunctionCall {
            name: fc.name.clone(),
            args: if fc.args.is_null() {
                Value::Object(Default::default())
            } else {
                fc.args.clone()
            },
        };
        state.function_calls.push(call.clone());
        events.push(StreamEvent::FunctionCall { call });
    }

    events
}

fn finish(reason: FinishReason, raw: &str, state: &mut StreamState) -> Vec<StreamEvent> {
    state.done = true;
    if reason == FinishReason::Safety {
        return vec![StreamEvent::Error {
            error: GatewayError::SafetyBlocked(raw.to_string()),
        }];
    }
    let reason = if !state.function_calls.is_empty() && reason == FinishReason::Stop {
        FinishReason::ToolUse
    } else {
        reason
    };
    vec![StreamEvent::Done {
        response: ModelResponse {
            text: state.text.clone(),
            function_calls: state.function_calls.clone(),
            inline_data: state.inline_data.clone(),
            finish_reason: reason,
        },
    }]
}

/// Synthesize the terminal event when the stream ends without a finish reason.
pub fn synthesize_done(state: &mut StreamState) -> Vec<StreamEvent> {
    if state.done {
        return Vec::new();
    }
    let mut events = Vec::new();
    if !state.started {
        state.started = true;
        events.push(StreamEvent::Start);
    }
    events.extend(finish(FinishReason::Stop, "STOP", state));
    events
}
