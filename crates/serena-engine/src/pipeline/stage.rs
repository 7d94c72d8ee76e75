use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use serena_core::ids::SessionKey;
use serena_core::state::{render_value, SessionState};

use crate::error::StageError;

/// Written in place of a model stage's output when it produced nothing.
pub const NOT_GENERATED: &str = "Not generated.";
/// Written in place of a tool stage's output when it produced nothing.
pub const NOT_EXECUTED: &str = "Not executed.";

/// Prefix the runner writes into the output key of a failed stage.
pub const ERROR_PREFIX: &str = "Error:";

/// True for text that stands in for a missing or failed upstream output.
pub fn is_placeholder(text: &str) -> bool {
    let text = text.trim();
    text.is_empty() || text == NOT_GENERATED || text == NOT_EXECUTED || text.starts_with(ERROR_PREFIX)
}

/// Whether a stage is backed by a model call or by host-side work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Model,
    Tool,
}

impl StageKind {
    pub fn sentinel(self) -> &'static str {
        match self {
            Self::Model => NOT_GENERATED,
            Self::Tool => NOT_EXECUTED,
        }
    }
}

/// Progress reported by stages while a pipeline runs.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    StageStarted {
        stage: String,
    },
    StageCompleted {
        stage: String,
        output_key: String,
    },
    StageFailed {
        stage: String,
        error: String,
    },
    ArtifactSaved {
        stage: String,
        filename: String,
        size_bytes: u64,
    },
    RefinementRound {
        stage: String,
        iteration: u32,
        approved: bool,
    },
}

impl PipelineEvent {
    pub fn stage(&self) -> &str {
        match self {
            Self::StageStarted { stage }
            | Self::StageCompleted { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::ArtifactSaved { stage, .. }
            | Self::RefinementRound { stage, .. } => stage,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::StageFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Event sender bound to one stage.
#[derive(Clone)]
pub struct StageEvents {
    stage: String,
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl StageEvents {
    pub fn new(stage: impl Into<String>, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self {
            stage: stage.into(),
            tx,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn emit(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            warn!(stage = %self.stage, "pipeline event receiver dropped");
        }
    }

    pub fn artifact_saved(&self, filename: &str, size_bytes: u64) {
        self.emit(PipelineEvent::ArtifactSaved {
            stage: self.stage.clone(),
            filename: filename.to_string(),
            size_bytes,
        });
    }
}

/// The state keys a stage declared, copied out of the session before it runs.
#[derive(Clone, Debug, Default)]
pub struct StageInputs {
    values: Map<String, Value>,
}

impl StageInputs {
    /// Fails on the first declared key the state does not hold.
    pub fn from_state(keys: &[String], state: &SessionState) -> Result<Self, StageError> {
        let mut values = Map::new();
        for key in keys {
            let value = state
                .get(key)
                .ok_or_else(|| StageError::MissingInput(key.clone()))?;
            values.insert(key.clone(), value.clone());
        }
        Ok(Self { values })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Result<&Value, StageError> {
        self.values
            .get(key)
            .ok_or_else(|| StageError::MissingInput(key.to_string()))
    }

    /// The value as prompt text: strings verbatim, other JSON pretty-printed.
    pub fn text(&self, key: &str) -> Result<String, StageError> {
        self.get(key).map(render_value)
    }

    pub fn render(&self, key: &str) -> Option<String> {
        self.values.get(key).map(render_value)
    }

    /// Copy with an extra value, used for loop-local template variables.
    pub fn with(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut values = self.values.clone();
        values.insert(key.to_string(), value.into());
        Self { values }
    }
}

/// Everything a stage sees while running.
pub struct StageContext {
    /// Session the pipeline runs in; also the scope for artifacts.
    pub scope: SessionKey,
    /// The initiating user message of the run.
    pub message: String,
    pub inputs: StageInputs,
    pub events: StageEvents,
    pub cancel: CancellationToken,
}

/// One ordered unit of a pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    /// State keys this stage reads.
    fn inputs(&self) -> Vec<String>;

    /// The single state key this stage writes.
    fn output_key(&self) -> &str;

    async fn run(&self, ctx: &StageContext) -> Result<Value, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inputs_fail_fast_on_absent_key() {
        let state: SessionState = [("user_query", json!("q"))].into_iter().collect();
        let keys = vec!["user_query".to_string(), "schema_metadata".to_string()];
        let err = StageInputs::from_state(&keys, &state).unwrap_err();
        assert!(matches!(err, StageError::MissingInput(k) if k == "schema_metadata"));
    }

    #[test]
    fn inputs_only_hold_declared_keys() {
        let state: SessionState = [("a", json!(1)), ("b", json!(2))].into_iter().collect();
        let inputs = StageInputs::from_state(&["a".to_string()], &state).unwrap();
        assert!(inputs.contains("a"));
        assert!(!inputs.contains("b"));
        assert_eq!(inputs.text("a").unwrap(), "1");
    }

    #[test]
    fn with_overlays_without_mutating() {
        let inputs = StageInputs::default();
        let extended = inputs.with("candidate_sql", "SELECT 1");
        assert!(!inputs.contains("candidate_sql"));
        assert_eq!(extended.text("candidate_sql").unwrap(), "SELECT 1");
    }

    #[test]
    fn placeholders_are_recognised() {
        assert!(is_placeholder("Not generated."));
        assert!(is_placeholder(" Error: review failed: model returned no output"));
        assert!(is_placeholder(""));
        assert!(!is_placeholder("SELECT COUNT(*) FROM users"));
    }

    #[test]
    fn sentinels_by_kind() {
        assert_eq!(StageKind::Model.sentinel(), "Not generated.");
        assert_eq!(StageKind::Tool.sentinel(), "Not executed.");
    }

    #[tokio::test]
    async fn events_reach_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = StageEvents::new("render", tx);
        events.artifact_saved("plot.svg", 512);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.stage(), "render");
        assert!(matches!(event, PipelineEvent::ArtifactSaved { size_bytes: 512, .. }));
    }
}
