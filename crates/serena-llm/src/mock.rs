//! Scripted providers for tests that must not touch the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use serena_core::errors::GatewayError;
use serena_core::messages::Blob;
use serena_core::provider::{EventStream, LlmProvider, LlmRequest};
use serena_core::stream::{FinishReason, FunctionCall, ModelResponse, StreamEvent};

use crate::imagen::ImageGenerator;

/// Pre-programmed responses, consumed in order.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Fail the `stream()` call itself.
    Error(GatewayError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A complete text answer, streamed as one delta.
    pub fn text(text: &str) -> Self {
        Self::text_chunks(&[text])
    }

    /// A text answer streamed as several deltas.
    pub fn text_chunks(chunks: &[&str]) -> Self {
        let mut events = vec![StreamEvent::Start];
        events.extend(chunks.iter().map(|c| StreamEvent::TextDelta {
            delta: (*c).to_string(),
        }));
        events.push(StreamEvent::Done {
            response: ModelResponse::text(chunks.concat()),
        });
        Self::Stream(events)
    }

    pub fn function_call(name: &str, args: Value) -> Self {
        let call = FunctionCall {
            name: name.to_string(),
            args,
        };
        Self::Stream(vec![
            StreamEvent::Start,
            StreamEvent::FunctionCall { call: call.clone() },
            StreamEvent::Done {
                response: ModelResponse {
                    text: String::new(),
                    function_calls: vec![call],
                    inline_data: Vec::new(),
                    finish_reason: FinishReason::ToolUse,
                },
            },
        ])
    }

    /// Spoken output as a single PCM part.
    pub fn audio(pcm: impl Into<Bytes>) -> Self {
        let blob = Blob::new("audio/pcm;rate=24000", pcm);
        Self::Stream(vec![
            StreamEvent::Start,
            StreamEvent::InlineData { blob: blob.clone() },
            StreamEvent::Done {
                response: ModelResponse {
                    text: String::new(),
                    function_calls: Vec::new(),
                    inline_data: vec![blob],
                    finish_reason: FinishReason::Stop,
                },
            },
        ])
    }

    /// A stream that opens fine and then fails.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider returning scripted responses and recording every request.
pub struct MockProvider {
    model: String,
    responses: Mutex<VecDeque<MockResponse>>,
    fallback: Option<MockResponse>,
    requests: Mutex<Vec<LlmRequest>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            model: "mock-model".into(),
            responses: Mutex::new(responses.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Response used once the script is exhausted.
    pub fn with_fallback(mut self, response: MockResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<LlmRequest> {
        self.requests.lock().last().cloned()
    }

    /// Queue more responses after construction.
    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &LlmRequest) -> Result<EventStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let next = self.responses.lock().pop_front();
        let response = match next.or_else(|| self.fallback.clone()) {
            Some(r) => r,
            None => {
                return Err(GatewayError::InvalidRequest(format!(
                    "MockProvider: no response configured for call {idx}"
                )))
            }
        };
        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<EventStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

/// Image generator returning fixed bytes, or failing on demand.
pub struct MockImageGenerator {
    result: Result<Bytes, GatewayError>,
    prompts: Mutex<Vec<String>>,
}

impl MockImageGenerator {
    pub fn returning(bytes: impl Into<Bytes>) -> Self {
        Self {
            result: Ok(bytes.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: GatewayError) -> Self {
        Self {
            result: Err(error),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    fn model(&self) -> &str {
        "mock-image-model"
    }

    async fn generate_image(&self, prompt: &str) -> Result<Blob, GatewayError> {
        self.prompts.lock().push(prompt.to_string());
        self.result
            .clone()
            .map(|bytes| Blob::new("image/png", bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn responses_are_consumed_in_order() {
        let provider = MockProvider::new(vec![
            MockResponse::text("first"),
            MockResponse::function_call("call_chat_agent", json!({"request": "hi"})),
        ]);
        let a = provider.generate(&LlmRequest::default()).await.unwrap();
        let b = provider.generate(&LlmRequest::default()).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.function_calls[0].name, "call_chat_agent");
        assert_eq!(provider.call_count(), 2);
        assert!(provider.generate(&LlmRequest::default()).await.is_err());
    }

    #[tokio::test]
    async fn fallback_repeats() {
        let provider = MockProvider::new(vec![]).with_fallback(MockResponse::text("again"));
        for _ in 0..3 {
            let r = provider.generate(&LlmRequest::default()).await.unwrap();
            assert_eq!(r.text, "again");
        }
    }

    #[tokio::test]
    async fn requests_are_recorded() {
        let provider = MockProvider::new(vec![MockResponse::text("ok")]);
        provider
            .generate(&LlmRequest::new("You are a SQL expert."))
            .await
            .unwrap();
        let request = provider.last_request().unwrap();
        assert_eq!(request.system_instruction.as_deref(), Some("You are a SQL expert."));
    }

    #[tokio::test]
    async fn delayed_response_waits() {
        tokio::time::pause();
        let provider = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(3),
            MockResponse::text("late"),
        )]);
        let start = tokio::time::Instant::now();
        let r = provider.generate(&LlmRequest::default()).await.unwrap();
        assert_eq!(r.text, "late");
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn mock_image_generator_records_prompts() {
        let generator = MockImageGenerator::returning(vec![0x89, b'P', b'N', b'G']);
        let blob = generator.generate_image("summer sale poster").await.unwrap();
        assert_eq!(blob.mime_type, "image/png");
        assert_eq!(generator.prompts(), vec!["summer sale poster"]);
    }
}
