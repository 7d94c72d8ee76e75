//! A live session: the supervisor behind a pair of queues.
//!
//! The transport pushes [`LiveRequest`]s in and drains [`LiveEvent`]s out.
//! Typed text is routed as a turn straight away. Microphone audio is
//! buffered until the speaker pauses, then transcribed, echoed back as a
//! user transcription and routed like typed text. Turns run one at a time
//! in arrival order.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use serena_core::errors::GatewayError;
use serena_core::events::{LiveEvent, LiveRequest};
use serena_core::ids::SessionId;

use crate::error::EngineError;
use crate::supervisor::Supervisor;
use crate::voice::Transcriber;

const DEFAULT_AUDIO_FLUSH: Duration = Duration::from_millis(800);
const DEFAULT_QUEUE: usize = 256;

const TURN_FAILED: &str = "Sorry, something went wrong while working on that. Please try again.";
const BLOCKED: &str = "Sorry, I can't help with that request.";
const NO_VOICE_INPUT: &str = "Voice input is not available right now. Please type your message.";

#[derive(Clone, Debug)]
pub struct LiveConfig {
    /// Silence after which buffered audio counts as one utterance.
    pub audio_flush: Duration,
    /// Capacity of the request and event queues.
    pub queue: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            audio_flush: DEFAULT_AUDIO_FLUSH,
            queue: DEFAULT_QUEUE,
        }
    }
}

/// Per-connection choices made by the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveOptions {
    pub audio_output: bool,
}

/// Starts live sessions over a shared supervisor.
pub struct LiveAgent {
    supervisor: Arc<Supervisor>,
    transcriber: Option<Transcriber>,
    config: LiveConfig,
}

/// The two ends of a running live session.
pub struct LiveSession {
    pub requests: mpsc::Sender<LiveRequest>,
    pub events: mpsc::Receiver<LiveEvent>,
    pub task: JoinHandle<()>,
}

impl LiveAgent {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            transcriber: None,
            config: LiveConfig::default(),
        }
    }

    pub fn with_transcriber(mut self, transcriber: Transcriber) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_config(mut self, config: LiveConfig) -> Self {
        self.config = config;
        self
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Spawn the session task. It runs until a `Close` request, until the
    /// request queue closes, or until `cancel` fires.
    pub fn start(
        self: &Arc<Self>,
        conversation: SessionId,
        options: LiveOptions,
        cancel: CancellationToken,
    ) -> LiveSession {
        let (req_tx, req_rx) = mpsc::channel(self.config.queue);
        let (event_tx, event_rx) = mpsc::channel(self.config.queue);
        let agent = Arc::clone(self);
        let task = tokio::spawn(async move {
            agent
                .run(conversation, options, req_rx, event_tx, cancel)
                .await;
        });
        LiveSession {
            requests: req_tx,
            events: event_rx,
            task,
        }
    }

    #[instrument(skip_all, fields(session_id = %conversation, audio_output = options.audio_output))]
    async fn run(
        &self,
        conversation: SessionId,
        options: LiveOptions,
        mut requests: mpsc::Receiver<LiveRequest>,
        events: mpsc::Sender<LiveEvent>,
        cancel: CancellationToken,
    ) {
        info!("live session started");
        let mut utterance = BytesMut::new();
        let mut last_audio = Instant::now();

        loop {
            let flush_at = (!utterance.is_empty()).then(|| last_audio + self.config.audio_flush);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(flush_at), if flush_at.is_some() => {
                    let pcm = utterance.split().freeze();
                    debug!(bytes = pcm.len(), "silence detected, flushing utterance");
                    self.voice_turn(&conversation, pcm, options, &events, &cancel).await;
                }
                request = requests.recv() => match request {
                    None | Some(LiveRequest::Close) => break,
                    Some(LiveRequest::Content(content)) => {
                        let text = content.text();
                        if text.trim().is_empty() {
                            debug!("ignoring empty text message");
                            continue;
                        }
                        self.turn(&conversation, &text, options, &events, &cancel).await;
                    }
                    Some(LiveRequest::Realtime(blob)) if blob.is_pcm_audio() => {
                        utterance.extend_from_slice(&blob.data);
                        last_audio = Instant::now();
                    }
                    Some(LiveRequest::Realtime(blob)) => {
                        warn!(mime_type = %blob.mime_type, "ignoring non-audio realtime input");
                    }
                },
            }
        }
        info!("live session ended");
    }

    async fn voice_turn(
        &self,
        conversation: &SessionId,
        pcm: bytes::Bytes,
        options: LiveOptions,
        events: &mpsc::Sender<LiveEvent>,
        cancel: &CancellationToken,
    ) {
        let Some(transcriber) = &self.transcriber else {
            warn!("audio received but no transcription model configured");
            send(events, LiveEvent::model_text(NO_VOICE_INPUT, false)).await;
            send(events, LiveEvent::turn_complete()).await;
            return;
        };

        let text = tokio::select! {
            r = transcriber.transcribe(pcm) => r,
            _ = cancel.cancelled() => return,
        };
        match text {
            Ok(text) if text.is_empty() => debug!("utterance had no speech"),
            Ok(text) => {
                send(events, LiveEvent::user_transcription(text.clone())).await;
                self.turn(conversation, &text, options, events, cancel).await;
            }
            Err(e) => {
                warn!(error = %e, "transcription failed");
                self.report(&EngineError::Gateway(e), events).await;
            }
        }
    }

    async fn turn(
        &self,
        conversation: &SessionId,
        text: &str,
        options: LiveOptions,
        events: &mpsc::Sender<LiveEvent>,
        cancel: &CancellationToken,
    ) {
        let result = self
            .supervisor
            .handle_turn(conversation, text, options.audio_output, events, cancel)
            .await;
        match result {
            Ok(outcome) => debug!(tool = ?outcome.tool, "turn complete"),
            Err(EngineError::Aborted) => {
                info!("turn interrupted");
                send(events, LiveEvent::interrupted()).await;
            }
            Err(e) => {
                error!(error = %e, "turn failed");
                self.report(&e, events).await;
            }
        }
    }

    /// A readable message then an interrupted boundary; no raw error text.
    async fn report(&self, err: &EngineError, events: &mpsc::Sender<LiveEvent>) {
        let text = match err {
            EngineError::Gateway(GatewayError::SafetyBlocked(_)) => BLOCKED,
            _ => TURN_FAILED,
        };
        send(events, LiveEvent::model_text(text, false)).await;
        send(events, LiveEvent::interrupted()).await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn send(events: &mpsc::Sender<LiveEvent>, event: LiveEvent) {
    let kind = event.event_type();
    if events.send(event).await.is_err() {
        warn!(event = kind, "live event receiver gone, event dropped");
    }
}
