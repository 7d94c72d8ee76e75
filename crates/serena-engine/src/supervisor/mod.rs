//! The supervisor: one routing decision per user turn.
//!
//! A turn moves `Idle → Routing → (ToolExecuting | DirectReply) → Rendering
//! → Idle`. Tool calls are awaited inline under a deadline; side-effecting
//! tools pass through the [`CampaignGate`] first.

pub mod gate;
pub mod render;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use serena_core::events::LiveEvent;
use serena_core::ids::{SessionId, SessionKey};
use serena_core::messages::{Content, Role};
use serena_core::provider::{LlmProvider, LlmRequest};
use serena_core::state::SessionState;
use serena_core::stream::{FunctionCall, StreamEvent};
use serena_core::tools::{ToolContext, ToolError, ToolKind, ToolResult};
use serena_store::{SessionHandle, SessionStore};

use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::specialists::visualization::LAST_QUERY_RESULT;
use crate::voice::SpeechSynthesizer;

pub use gate::{CampaignGate, GateDecision};

/// App name the conversation-level sessions are stored under.
pub const SUPERVISOR_APP: &str = "Serena Agent";

pub const KEY_HISTORY: &str = "history";
pub const KEY_GATE: &str = "campaign_gate";

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_HISTORY_LIMIT: usize = 20;

const DECLINED: &str = "Understood, I won't proceed.";
const NO_REPLY: &str = "Sorry, I didn't catch that. Could you rephrase?";

pub const SUPERVISOR_PROMPT: &str = r#"You are Serena, a marketing co-pilot for an online retailer.
Decide for every user message whether to answer directly or to call exactly one tool:
- call_chat_agent for greetings and general conversation,
- call_bq_agent for questions about customers, orders, products or sales data,
- call_visualization_agent to chart the results of a previous data query,
- call_poster_agent to create a promotional poster image,
- call_email_agent to send a promotional email.
A campaign runs one step per message: find the audience, chart it, ask the user to confirm,
then create the poster, then send the email. Always ask for confirmation before creating a
poster or sending an email, and wait for the user's answer.
Pass the user's request to the tool in its own words."#;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub tool_timeout: Duration,
    /// Entries of prior conversation sent to the routing model.
    pub history_limit: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Routing,
    ToolExecuting,
    DirectReply,
    Rendering,
}

/// One remembered exchange line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

/// What a turn did.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// Text shown to the user; empty when an artifact is the whole reply.
    pub reply: String,
    pub tool: Option<String>,
    pub result: Option<ToolResult>,
    pub phases: Vec<TurnPhase>,
}

/// Routes user turns to tools and renders their results.
pub struct Supervisor {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    sessions: Arc<dyn SessionStore>,
    speech: Option<SpeechSynthesizer>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            provider,
            registry,
            sessions,
            speech: None,
            config: SupervisorConfig::default(),
        }
    }

    /// Read final replies aloud when a turn asks for audio output.
    pub fn with_speech(mut self, speech: SpeechSynthesizer) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Session key for a connection's conversation state.
    pub fn conversation_key(conversation: &SessionId) -> SessionKey {
        SessionKey::new(SUPERVISOR_APP, conversation.as_str(), conversation.clone())
    }

    /// Handle one user turn end to end, emitting events as it goes.
    ///
    /// With `audio_output`, the reply is also spoken before the turn closes.
    /// Ends with a turn-complete event on success. Errors are returned
    /// without a terminal event so the caller can report them.
    #[instrument(skip_all, fields(session_id = %conversation))]
    pub async fn handle_turn(
        &self,
        conversation: &SessionId,
        user_text: &str,
        audio_output: bool,
        events: &mpsc::Sender<LiveEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Aborted);
        }
        let session = self
            .sessions
            .get_or_create(Self::conversation_key(conversation), SessionState::new())
            .await?;
        let _guard = session.lock_run().await;

        let state = session.state();
        let mut history: Vec<HistoryEntry> = state.get_as(KEY_HISTORY).unwrap_or_default();
        let mut gate: CampaignGate = state.get_as(KEY_GATE).unwrap_or_default();
        let mut phases = vec![TurnPhase::Routing];

        let step = match gate.on_user_turn(user_text) {
            GateDecision::RunPending(call) => {
                info!(tool = %call.name, "confirmation received, running held call");
                Step::Execute(call)
            }
            GateDecision::Declined => {
                info!("held call declined");
                emit(events, LiveEvent::model_text(DECLINED, false)).await;
                Step::Reply(DECLINED.to_string())
            }
            GateDecision::Route => {
                let (text, call) = self.route(&history, user_text, events, cancel).await?;
                match call {
                    None if text.trim().is_empty() => {
                        emit(events, LiveEvent::model_text(NO_REPLY, false)).await;
                        Step::Reply(NO_REPLY.to_string())
                    }
                    // Already streamed as partial text.
                    None => Step::Reply(text),
                    Some(call) => {
                        let asked = last_reply_was_question(&history);
                        match self.registry.kind(&call.name) {
                            Some(kind) if !gate.authorize(kind, &call, user_text, asked) => {
                                info!(tool = %call.name, "side-effecting call held for confirmation");
                                let ask = confirmation_question(kind);
                                emit(events, LiveEvent::model_text(ask.clone(), false)).await;
                                Step::Reply(ask)
                            }
                            _ => Step::Execute(call),
                        }
                    }
                }
            }
        };

        let (reply, remembered, tool, result) = match step {
            Step::Reply(text) => {
                phases.push(TurnPhase::DirectReply);
                phases.push(TurnPhase::Rendering);
                (text.clone(), text, None, None)
            }
            Step::Execute(call) => {
                phases.push(TurnPhase::ToolExecuting);
                let result = self
                    .execute_tool(&call, conversation, session.state(), events, cancel)
                    .await?;

                let kind = self.registry.kind(&call.name);
                if let Some(kind) = kind {
                    gate.complete(kind);
                    if kind == ToolKind::Query {
                        if let Some(rows @ Value::Array(_)) = result.payload.get("execution_result") {
                            session.set(LAST_QUERY_RESULT, rows.clone());
                        }
                    }
                }

                phases.push(TurnPhase::Rendering);
                let rendered = match kind {
                    Some(kind) => render::render(kind, &result),
                    None => Some(format!(
                        "Sorry, I can't do that: {}",
                        result.error_message().unwrap_or("unknown tool")
                    )),
                };
                match rendered {
                    Some(text) => {
                        emit(events, LiveEvent::model_text(text.clone(), false)).await;
                        (text.clone(), text, Some(call.name), Some(result))
                    }
                    None => {
                        let note = result
                            .artifact()
                            .map(|a| format!("[{} created {}]", call.name, a.filename))
                            .unwrap_or_default();
                        (String::new(), note, Some(call.name), Some(result))
                    }
                }
            }
        };

        self.save(&session, &mut history, &gate, user_text, &remembered);
        if audio_output && !reply.trim().is_empty() {
            self.speak(&reply, events, cancel).await?;
        }
        emit(events, LiveEvent::turn_complete()).await;
        phases.push(TurnPhase::Idle);
        Ok(TurnOutcome {
            reply,
            tool,
            result,
            phases,
        })
    }

    /// Ask the routing model; stream any direct text as partial events.
    async fn route(
        &self,
        history: &[HistoryEntry],
        user_text: &str,
        events: &mpsc::Sender<LiveEvent>,
        cancel: &CancellationToken,
    ) -> Result<(String, Option<FunctionCall>), EngineError> {
        let mut contents: Vec<Content> = history
            .iter()
            .map(|h| match h.role {
                Role::Model => Content::model_text(h.text.clone()),
                _ => Content::user_text(h.text.clone()),
            })
            .collect();
        contents.push(Content::user_text(user_text));
        let request = LlmRequest::new(SUPERVISOR_PROMPT)
            .with_contents(contents)
            .with_tools(self.registry.definitions());

        let mut stream = tokio::select! {
            s = self.provider.stream(&request) => s?,
            _ = cancel.cancelled() => return Err(EngineError::Aborted),
        };

        let mut text = String::new();
        let mut calls: Vec<FunctionCall> = Vec::new();
        loop {
            let event = tokio::select! {
                e = stream.next() => e,
                _ = cancel.cancelled() => return Err(EngineError::Aborted),
            };
            let Some(event) = event else { break };
            match event {
                StreamEvent::Start | StreamEvent::InlineData { .. } => {}
                StreamEvent::TextDelta { delta } => {
                    text.push_str(&delta);
                    emit(events, LiveEvent::model_text(delta, true)).await;
                }
                StreamEvent::FunctionCall { call } => calls.push(call),
                StreamEvent::Done { response } => {
                    if calls.is_empty() {
                        calls = response.function_calls;
                    }
                    break;
                }
                StreamEvent::Error { error } => return Err(error.into()),
            }
        }

        if calls.len() > 1 {
            debug!(count = calls.len(), "routing model asked for several calls, using the first");
        }
        Ok((text, calls.into_iter().next()))
    }

    /// Invoke a tool under the deadline. Timeouts, panics and tool errors
    /// all become an error result.
    async fn execute_tool(
        &self,
        call: &FunctionCall,
        conversation: &SessionId,
        state: SessionState,
        events: &mpsc::Sender<LiveEvent>,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, EngineError> {
        emit(
            events,
            LiveEvent::ToolCall {
                name: call.name.clone(),
                args: call.args.clone(),
            },
        )
        .await;

        let Some(tool) = self.registry.get(&call.name) else {
            warn!(tool = %call.name, "routing model called an unknown tool");
            let result = ToolResult::error(format!("Unknown tool: {}", call.name));
            emit_result(events, &call.name, &result).await;
            return Ok(result);
        };

        let ctx = ToolContext {
            conversation_id: conversation.clone(),
            conversation_state: state,
            abort_signal: cancel.child_token(),
        };
        let timeout = self.config.tool_timeout;
        let start = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            std::panic::AssertUnwindSafe(tool.invoke(call.args.clone(), &ctx)).catch_unwind(),
        )
        .await;
        let duration = start.elapsed();

        let result = match outcome {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(ToolError::Cancelled))) => return Err(EngineError::Aborted),
            Ok(Ok(Err(e))) => {
                warn!(tool = %call.name, error = %e, "tool returned an error");
                ToolResult::error(e.to_string())
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %call.name, panic = %msg, "tool panicked during execution");
                ToolResult::error("Internal error: tool crashed")
            }
            Err(_) => {
                ctx.abort_signal.cancel();
                warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                ToolResult::error(format!("Tool timed out after {}", human_duration(timeout)))
            }
        }
        .with_duration(duration);

        info!(
            tool = %call.name,
            duration_ms = duration.as_millis() as u64,
            is_error = result.is_error,
            "tool finished"
        );
        emit_result(events, &call.name, &result).await;
        Ok(result)
    }

    /// A failed synthesis only loses the audio; the text is already out.
    async fn speak(
        &self,
        text: &str,
        events: &mpsc::Sender<LiveEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let Some(speech) = &self.speech else {
            debug!("audio output requested but no speech model configured");
            return Ok(());
        };
        let blobs = tokio::select! {
            r = speech.synthesize(text) => r,
            _ = cancel.cancelled() => return Err(EngineError::Aborted),
        };
        match blobs {
            Ok(blobs) => {
                for blob in blobs {
                    emit(events, LiveEvent::model_audio(blob)).await;
                }
            }
            Err(e) => warn!(error = %e, "speech synthesis failed, reply sent as text only"),
        }
        Ok(())
    }

    /// Persist history (bounded) and the gate.
    fn save(
        &self,
        session: &SessionHandle,
        history: &mut Vec<HistoryEntry>,
        gate: &CampaignGate,
        user_text: &str,
        reply: &str,
    ) {
        history.push(HistoryEntry {
            role: Role::User,
            text: user_text.to_string(),
        });
        if !reply.is_empty() {
            history.push(HistoryEntry {
                role: Role::Model,
                text: reply.to_string(),
            });
        }
        let excess = history.len().saturating_sub(self.config.history_limit);
        history.drain(..excess);

        session.update(|state| {
            state.insert(
                KEY_HISTORY,
                serde_json::to_value(&*history).unwrap_or(Value::Array(Vec::new())),
            );
            state.insert(KEY_GATE, serde_json::to_value(gate).unwrap_or(Value::Null));
        });
        debug!(gate = gate.name(), history = history.len(), "turn state saved");
    }
}

enum Step {
    Reply(String),
    Execute(FunctionCall),
}

fn last_reply_was_question(history: &[HistoryEntry]) -> bool {
    history
        .iter()
        .rev()
        .find(|h| h.role == Role::Model)
        .is_some_and(|h| h.text.trim_end().ends_with('?'))
}

fn confirmation_question(kind: ToolKind) -> String {
    let action = match kind {
        ToolKind::Email => "send the email",
        ToolKind::Asset => "create the poster",
        _ => "go ahead",
    };
    format!("Before I {action}, can you confirm that you want me to proceed?")
}

fn human_duration(d: Duration) -> String {
    if d.as_secs() > 0 && d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

async fn emit(events: &mpsc::Sender<LiveEvent>, event: LiveEvent) {
    let kind = event.event_type();
    if events.send(event).await.is_err() {
        warn!(event = kind, "no event receiver, event dropped");
    }
}

async fn emit_result(events: &mpsc::Sender<LiveEvent>, name: &str, result: &ToolResult) {
    emit(
        events,
        LiveEvent::ToolResult {
            name: name.to_string(),
            response: result.payload.clone(),
        },
    )
    .await;
}
