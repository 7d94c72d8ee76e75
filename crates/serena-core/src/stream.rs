use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::GatewayError;
use crate::messages::{Blob, Content, Part, Role};

/// A function call requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    ToolUse,
    Other,
}

impl FinishReason {
    pub fn from_gemini(raw: &str) -> Self {
        match raw {
            "STOP" => Self::Stop,
            "MAX_TOKENS" => Self::MaxTokens,
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => Self::Safety,
            "TOOL_USE" => Self::ToolUse,
            _ => Self::Other,
        }
    }
}

/// Aggregated model output for one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
    pub inline_data: Vec<Blob>,
    pub finish_reason: FinishReason,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            function_calls: Vec::new(),
            inline_data: Vec::new(),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn function_call(name: impl Into<String>, args: Value) -> Self {
        Self {
            text: String::new(),
            function_calls: vec![FunctionCall {
                name: name.into(),
                args,
            }],
            inline_data: Vec::new(),
            finish_reason: FinishReason::ToolUse,
        }
    }

    /// The response as a model-authored content message.
    pub fn to_content(&self) -> Content {
        let mut parts = Vec::new();
        if !self.text.is_empty() {
            parts.push(Part::text(self.text.clone()));
        }
        for call in &self.function_calls {
            parts.push(Part::FunctionCall {
                name: call.name.clone(),
                args: call.args.clone(),
            });
        }
        for blob in &self.inline_data {
            parts.push(Part::inline(blob.clone()));
        }
        Content::new(Role::Model, parts)
    }
}

/// Incremental events from a streaming model call.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    TextDelta { delta: String },
    InlineData { blob: Blob },
    FunctionCall { call: FunctionCall },
    Done { response: ModelResponse },
    Error { error: GatewayError },
}

/// Drain a model stream into a single response.
///
/// A stream that ends without `Done` still yields whatever was accumulated.
pub async fn collect_response<S>(stream: S) -> Result<ModelResponse, GatewayError>
where
    S: Stream<Item = StreamEvent>,
{
    futures::pin_mut!(stream);
    let mut text = String::new();
    let mut calls = Vec::new();
    let mut blobs = Vec::new();

    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Start => {}
            StreamEvent::TextDelta { delta } => text.push_str(&delta),
            StreamEvent::InlineData { blob } => blobs.push(blob),
            StreamEvent::FunctionCall { call } => calls.push(call),
            StreamEvent::Done { response } => return Ok(response),
            StreamEvent::Error { error } => return Err(error),
        }
    }

    let finish_reason = if calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolUse
    };
    Ok(ModelResponse {
        text,
        function_calls: calls,
        inline_data: blobs,
        finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    #[tokio::test]
    async fn collect_prefers_done_payload() {
        let events = vec![
            StreamEvent::Start,
            StreamEvent::TextDelta { delta: "partial".into() },
            StreamEvent::Done {
                response: ModelResponse::text("final"),
            },
        ];
        let response = collect_response(stream::iter(events)).await.unwrap();
        assert_eq!(response.text, "final");
    }

    #[tokio::test]
    async fn collect_without_done_accumulates() {
        let events = vec![
            StreamEvent::TextDelta { delta: "SELECT ".into() },
            StreamEvent::TextDelta { delta: "1".into() },
            StreamEvent::FunctionCall {
                call: FunctionCall {
                    name: "call_chat_agent".into(),
                    args: json!({}),
                },
            },
        ];
        let response = collect_response(stream::iter(events)).await.unwrap();
        assert_eq!(response.text, "SELECT 1");
        assert_eq!(response.function_calls.len(), 1);
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
    }

    #[tokio::test]
    async fn collect_surfaces_stream_error() {
        let events = vec![
            StreamEvent::Start,
            StreamEvent::Error {
                error: GatewayError::StreamInterrupted("eof".into()),
            },
        ];
        let err = collect_response(stream::iter(events)).await.unwrap_err();
        assert_eq!(err.error_kind(), "stream_interrupted");
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(FinishReason::from_gemini("STOP"), FinishReason::Stop);
        assert_eq!(FinishReason::from_gemini("SAFETY"), FinishReason::Safety);
        assert_eq!(FinishReason::from_gemini("RECITATION"), FinishReason::Other);
    }

    #[test]
    fn to_content_orders_text_calls_blobs() {
        let mut response = ModelResponse::function_call("call_bq_agent", json!({"q": 1}));
        response.text = "Checking".into();
        let content = response.to_content();
        assert_eq!(content.role, Role::Model);
        assert_eq!(content.parts.len(), 2);
        assert_eq!(content.parts[0].as_text(), Some("Checking"));
    }
}
