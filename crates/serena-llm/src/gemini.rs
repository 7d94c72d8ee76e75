use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use serena_core::errors::GatewayError;
use serena_core::provider::{EventStream, LlmProvider, LlmRequest};
use serena_core::stream::StreamEvent;

use crate::converter;
use crate::sse::{self, StreamState};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Streaming client for one Gemini model.
pub struct GeminiProvider {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    idle_timeout: Duration,
}

impl GeminiProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Result<Self, GatewayError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL, Duration::from_secs(120))
    }

    pub fn with_base_url(
        api_key: SecretString,
        model: impl Into<String>,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            idle_timeout: SSE_IDLE_TIMEOUT,
        })
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn stream(&self, request: &LlmRequest) -> Result<EventStream, GatewayError> {
        let body = converter::build_request_body(request);
        debug!(
            contents = request.contents.len(),
            tools = request.tools.len(),
            "sending model request"
        );

        let resp = self
            .client
            .post(self.stream_url())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(CONNECT_TIMEOUT)
                } else {
                    GatewayError::NetworkError(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }

        Ok(Box::pin(SseStream::with_idle_timeout(
            resp.bytes_stream(),
            self.idle_timeout,
        )))
    }
}

/// Wraps a byte stream from reqwest and yields StreamEvents.
/// Emits an error if no data arrives within the idle timeout.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    state: StreamState,
    buffer: String,
    pending: Vec<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            state: StreamState::new(),
            buffer: String::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn drain_complete_events(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let chunk: String = self.buffer.drain(..pos + 2).collect();
            for data in sse::parse_sse_lines(&chunk) {
                let events = sse::process_data(&data, &mut self.state);
                self.pending.extend(events);
            }
        }
    }
}

impl Stream for SseStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        if !self.pending.is_empty() {
            return Poll::Ready(Some(self.pending.remove(0)));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                    self.buffer.push_str(&text);
                    self.drain_complete_events();

                    if !self.pending.is_empty() {
                        return Poll::Ready(Some(self.pending.remove(0)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(StreamEvent::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    let remaining = std::mem::take(&mut self.buffer);
                    for data in sse::parse_sse_lines(&remaining) {
                        let events = sse::process_data(&data, &mut self.state);
                        self.pending.extend(events);
                    }
                    let tail = sse::synthesize_done(&mut self.state);
                    self.pending.extend(tail);
                    if self.pending.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(self.pending.remove(0)));
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(StreamEvent::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serena_core::messages::Content;
    use serena_core::stream::FinishReason;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> GeminiProvider {
        GeminiProvider::with_base_url(
            SecretString::from("test-key"),
            "gemini-2.0-flash",
            server.uri(),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[test]
    fn provider_properties() {
        let provider =
            GeminiProvider::new(SecretString::from("k"), "gemini-2.0-flash").unwrap();
        assert_eq!(provider.name(), "gemini");
        assert_eq!(provider.model(), "gemini-2.0-flash");
        assert_eq!(
            provider.stream_url(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
    }

    #[tokio::test]
    async fn streams_text_from_sse_body() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello \"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"there\"}]},\"finishReason\":\"STOP\"}]}\r\n\r\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let request = LlmRequest::new("Be brief.").with_content(Content::user_text("hi"));
        let response = provider.generate(&request).await.unwrap();
        assert_eq!(response.text, "Hello there");
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn missing_finish_reason_still_completes() {
        let server = MockServer::start().await;
        let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]}}]}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let mut stream = provider
            .stream(&LlmRequest::default().with_content(Content::user_text("hi")))
            .await
            .unwrap();
        let mut saw_done = false;
        while let Some(event) = stream.next().await {
            if let StreamEvent::Done { response } = event {
                assert_eq!(response.text, "ok");
                saw_done = true;
            }
        }
        assert!(saw_done);
    }

    #[tokio::test]
    async fn http_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = match provider.stream(&LlmRequest::default()).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, GatewayError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider.generate(&LlmRequest::default()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseStream::with_idle_timeout(
            byte_stream,
            Duration::from_secs(5),
        ));

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(
            matches!(&event, Some(StreamEvent::Error { error: GatewayError::StreamInterrupted(msg) }) if msg.contains("idle timeout")),
            "expected idle timeout error, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn chunk_split_across_reads_is_reassembled() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(4);
        let rx_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut stream = Box::pin(SseStream::with_idle_timeout(
            rx_stream,
            Duration::from_secs(5),
        ));

        tx.send(Ok(bytes::Bytes::from(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"te",
        )))
        .await
        .unwrap();
        tx.send(Ok(bytes::Bytes::from("xt\":\"split\"}]}}]}\n\n")))
            .await
            .unwrap();
        drop(tx);

        let events: Vec<StreamEvent> = stream.by_ref().collect().await;
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { delta } if delta == "split")));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }
}
