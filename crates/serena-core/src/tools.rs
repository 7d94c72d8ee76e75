use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactRef;
use crate::ids::SessionId;
use crate::state::SessionState;

/// The closed set of specialist kinds the supervisor can dispatch to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Conversation,
    Query,
    Visualization,
    Asset,
    Email,
}

impl ToolKind {
    /// Tools whose effects leave the system (publishing content, sending mail).
    pub fn has_side_effects(self) -> bool {
        matches!(self, Self::Asset | Self::Email)
    }
}

/// Context available to tools during execution.
pub struct ToolContext {
    /// Supervisor-level conversation the call belongs to.
    pub conversation_id: SessionId,
    /// Snapshot of the conversation state at call time.
    pub conversation_state: SessionState,
    pub abort_signal: CancellationToken,
}

impl ToolContext {
    pub fn new(conversation_id: SessionId, conversation_state: SessionState) -> Self {
        Self {
            conversation_id,
            conversation_state,
            abort_signal: CancellationToken::new(),
        }
    }
}

/// Structured result of a tool invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub payload: Map<String, Value>,
    pub is_error: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolResult {
    pub fn ok(payload: Map<String, Value>) -> Self {
        Self {
            payload,
            is_error: false,
            duration: Duration::ZERO,
        }
    }

    /// Fallback result carrying a readable error.
    pub fn error(message: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("error".into(), Value::String(message.into()));
        Self {
            payload,
            is_error: true,
            duration: Duration::ZERO,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.get_str("error")
    }

    pub fn artifact(&self) -> Option<ArtifactRef> {
        ArtifactRef::from_payload(&self.payload)
    }
}

/// Tool definition sent to the model as a function declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// A specialist entry point callable by the supervisor.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn kind(&self) -> ToolKind;
    fn parameters_schema(&self) -> Value;

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Pull a required string argument out of a tool argument object.
pub fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing string argument `{key}`")))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
