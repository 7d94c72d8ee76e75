use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use serena_core::errors::GatewayError;
use serena_core::provider::{EventStream, LlmProvider, LlmRequest};

/// Retry and circuit breaker settings for [`ReliableProvider`].
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps an [`LlmProvider`] with retries and a circuit breaker.
///
/// Only the opening of a stream is retried. Once events flow, the stream is
/// committed and a mid-stream failure surfaces to the caller.
pub struct ReliableProvider<P: LlmProvider> {
    inner: P,
    config: ReliableConfig,
    circuit_state: Arc<RwLock<CircuitState>>,
    consecutive_failures: Arc<AtomicU32>,
    total_retries: Arc<AtomicU64>,
}

impl<P: LlmProvider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: Arc::new(RwLock::new(CircuitState::Closed)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    fn check_circuit(&self) -> Result<(), GatewayError> {
        let state = self.circuit_state.read();
        match &*state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    drop(state);
                    *self.circuit_state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(GatewayError::ServerError {
                        status: 503,
                        body: "circuit breaker open".into(),
                    })
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!(model = self.inner.model(), "circuit breaker closed");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.circuit_breaker_threshold {
            let mut state = self.circuit_state.write();
            if matches!(*state, CircuitState::Closed | CircuitState::HalfOpen) {
                warn!(
                    failures,
                    model = self.inner.model(),
                    cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                    "circuit breaker opened"
                );
                *state = CircuitState::Open {
                    since: Instant::now(),
                };
            }
        }
    }

    /// Exponential backoff with jitter, capped at `max_delay`.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.config.max_delay);
        }

        let max_ms = self.config.max_delay.as_millis() as f64;
        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(max_ms);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        // The floor never lifts a delay past max_delay.
        let final_ms = (capped + jitter).max(50.0).min(max_ms);

        Duration::from_millis(final_ms as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match &*self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// xorshift64 seeded from the clock; only used for jitter.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
                | 1
        );
    }

    STATE.with(|s| {
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn stream(&self, request: &LlmRequest) -> Result<EventStream, GatewayError> {
        self.check_circuit()?;

        let mut attempt = 0;
        loop {
            match self.inner.stream(request).await {
                Ok(stream) => {
                    self.record_success();
                    return Ok(stream);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.config.max_retries {
                        self.record_failure();
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying model call"
                    );

                    tokio::time::sleep(delay).await;
                    self.check_circuit()?;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProvider, MockResponse};

    fn fast_config() -> ReliableConfig {
        ReliableConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            circuit_breaker_threshold: 2,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let mock = MockProvider::new(vec![
            MockResponse::Error(GatewayError::ServerError {
                status: 503,
                body: "busy".into(),
            }),
            MockResponse::text("recovered"),
        ]);
        let provider = ReliableProvider::new(mock, fast_config());
        let response = provider.generate(&LlmRequest::default()).await.unwrap();
        assert_eq!(response.text, "recovered");
        assert_eq!(provider.total_retries(), 1);
        assert_eq!(provider.circuit_state_name(), "closed");
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let mock = MockProvider::new(vec![
            MockResponse::Error(GatewayError::AuthenticationFailed("bad key".into())),
            MockResponse::text("never"),
        ]);
        let provider = ReliableProvider::new(mock, fast_config());
        let err = provider.generate(&LlmRequest::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthenticationFailed(_)));
        assert_eq!(provider.total_retries(), 0);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let busy = || {
            MockResponse::Error(GatewayError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
            })
        };
        let mock = MockProvider::new(vec![busy(), busy(), busy(), MockResponse::text("late")]);
        let provider = ReliableProvider::new(mock, fast_config());
        let err = provider.generate(&LlmRequest::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
        assert_eq!(provider.total_retries(), 2);
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let mock = MockProvider::new(vec![
            MockResponse::Error(GatewayError::InvalidRequest("a".into())),
            MockResponse::Error(GatewayError::InvalidRequest("b".into())),
            MockResponse::text("blocked"),
        ]);
        let provider = ReliableProvider::new(mock, fast_config());
        let _ = provider.generate(&LlmRequest::default()).await;
        let _ = provider.generate(&LlmRequest::default()).await;
        assert_eq!(provider.circuit_state_name(), "open");
        assert!(provider.generate(&LlmRequest::default()).await.is_err());
    }

    #[tokio::test]
    async fn failure_after_stream_opens_is_not_retried() {
        let mock = MockProvider::new(vec![
            MockResponse::stream_error(GatewayError::ServerError {
                status: 500,
                body: "mid-stream".into(),
            }),
            MockResponse::text("never"),
        ]);
        let provider = ReliableProvider::new(mock, fast_config());
        let err = provider.generate(&LlmRequest::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ServerError { status: 500, .. }));
        assert_eq!(provider.total_retries(), 0);
    }

    #[test]
    fn delay_is_capped() {
        let provider = ReliableProvider::new(MockProvider::new(vec![]), fast_config());
        assert!(provider.retry_delay(10, None) <= Duration::from_millis(5));
        assert_eq!(
            provider.retry_delay(0, Some(Duration::from_secs(90))),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let config = ReliableConfig {
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(1_000),
            jitter_factor: 0.5,
            ..fast_config()
        };
        let provider = ReliableProvider::new(MockProvider::new(vec![]), config);
        for attempt in 0..8 {
            let delay = provider.retry_delay(attempt, None);
            assert!(delay <= Duration::from_millis(1_000), "attempt {attempt}: {delay:?}");
            assert!(delay >= Duration::from_millis(50), "attempt {attempt}: {delay:?}");
        }
    }
}
