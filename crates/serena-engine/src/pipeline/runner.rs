use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use serena_core::artifacts::{
    KEY_APP_NAME, KEY_ARTIFACT_SAVED, KEY_ARTIFACT_SIZE, KEY_SESSION_ID, NOT_SAVED,
};
use serena_core::ids::{SessionId, SessionKey};
use serena_core::state::SessionState;
use serena_core::SYNTHETIC_USER_ID;
use serena_store::{new_artifacts, ArtifactStore, SessionHandle, SessionStore};

use crate::error::{EngineError, StageError};
use crate::pipeline::stage::{
    PipelineEvent, Stage, StageContext, StageEvents, StageInputs, ERROR_PREFIX,
};
use crate::pipeline::Pipeline;

/// Parameters for one pipeline invocation.
pub struct RunParams {
    pub user_id: String,
    pub initial_state: SessionState,
    /// The initiating message every model stage receives as user content.
    pub message: String,
    pub cancel: CancellationToken,
}

impl RunParams {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_id: SYNTHETIC_USER_ID.to_string(),
            initial_state: SessionState::new(),
            message: message.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of checking the artifact store for a pipeline's declared artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactCheck {
    /// The filename when present, otherwise [`NOT_SAVED`].
    pub filename: String,
    pub saved: bool,
    pub size_bytes: u64,
}

impl ArtifactCheck {
    pub fn absent() -> Self {
        Self {
            filename: NOT_SAVED.to_string(),
            saved: false,
            size_bytes: 0,
        }
    }
}

/// Everything a caller needs from a finished run. Never the raw transcript.
#[derive(Clone, Debug)]
pub struct PipelineRun {
    pub session_id: SessionId,
    pub scope: SessionKey,
    /// Every declared output key, with sentinels in place of missing values.
    pub outputs: Map<String, Value>,
    pub events: Vec<PipelineEvent>,
    /// Messages of the stages that failed, in stage order.
    pub errors: Vec<String>,
    pub artifact: Option<ArtifactCheck>,
    /// Artifact filenames that appeared in this run's scope.
    pub new_artifacts: Vec<String>,
}

impl PipelineRun {
    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    /// An output as display text; sentinel strings come through unchanged.
    pub fn text(&self, key: &str) -> String {
        self.outputs
            .get(key)
            .map(serena_core::state::render_value)
            .unwrap_or_default()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Write the four artifact-reference keys into a tool result map.
    pub fn insert_artifact_fields(&self, payload: &mut Map<String, Value>) {
        let check = self.artifact.clone().unwrap_or_else(ArtifactCheck::absent);
        payload.insert(KEY_APP_NAME.into(), Value::String(self.scope.app_name.clone()));
        payload.insert(
            KEY_SESSION_ID.into(),
            Value::String(self.session_id.to_string()),
        );
        payload.insert(KEY_ARTIFACT_SAVED.into(), Value::String(check.filename));
        payload.insert(KEY_ARTIFACT_SIZE.into(), Value::from(check.size_bytes));
    }
}

/// Executes pipelines against the injected session and artifact stores.
#[derive(Clone)]
pub struct PipelineRunner {
    sessions: Arc<dyn SessionStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl PipelineRunner {
    pub fn new(sessions: Arc<dyn SessionStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            sessions,
            artifacts,
        }
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Run every stage once, in order, in a freshly minted session.
    ///
    /// Stage failures never abort the run: the failing stage's output key
    /// holds an `Error: ...` string and later stages still execute. Only
    /// store failures and cancellation surface as `Err`.
    #[instrument(skip_all, fields(app_name = %pipeline.app_name(), session_id = tracing::field::Empty))]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        params: RunParams,
    ) -> Result<PipelineRun, EngineError> {
        let RunParams {
            user_id,
            mut initial_state,
            message,
            cancel,
        } = params;

        let session_id = SessionId::new();
        tracing::Span::current().record("session_id", tracing::field::display(&session_id));
        let scope = SessionKey::new(pipeline.app_name(), user_id, session_id.clone());

        pipeline.seed(&mut initial_state);
        let session = self.sessions.create(scope.clone(), initial_state).await?;
        let _guard = session.lock_run().await;

        let before = match self.artifacts.list_keys(&scope).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "artifact listing failed before run");
                BTreeSet::new()
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        for stage in pipeline.stages() {
            if cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            match self
                .run_stage(stage.as_ref(), &session, &scope, &message, &tx, &cancel)
                .await
            {
                Err(StageError::Cancelled) => return Err(EngineError::Aborted),
                Err(e) => {
                    let text = format!("{ERROR_PREFIX} {} failed: {e}", stage.name());
                    session.set(stage.output_key(), text);
                    emit(
                        &tx,
                        PipelineEvent::StageFailed {
                            stage: stage.name().to_string(),
                            error: e.to_string(),
                        },
                    );
                }
                Ok(value) => {
                    let value = if is_blank(&value) {
                        Value::String(stage.kind().sentinel().to_string())
                    } else {
                        value
                    };
                    session.set(stage.output_key(), value);
                    emit(
                        &tx,
                        PipelineEvent::StageCompleted {
                            stage: stage.name().to_string(),
                            output_key: stage.output_key().to_string(),
                        },
                    );
                }
            }
        }
        drop(tx);

        let mut events = Vec::new();
        let mut errors = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Some(err) = event.error() {
                warn!(stage = event.stage(), error = err, "stage failed");
                errors.push(format!("{}: {err}", event.stage()));
            }
            events.push(event);
        }

        let state = session.state();
        let mut outputs = Map::new();
        for stage in pipeline.stages() {
            let value = match state.get(stage.output_key()) {
                Some(v) if !is_blank(v) => v.clone(),
                _ => Value::String(stage.kind().sentinel().to_string()),
            };
            outputs.insert(stage.output_key().to_string(), value);
        }

        let artifact = match pipeline.artifact() {
            Some(filename) => Some(self.check_artifact(&scope, filename).await),
            None => None,
        };

        let after = match self.artifacts.list_keys(&scope).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "artifact listing failed after run");
                before.clone()
            }
        };

        info!(
            stages = pipeline.stages().len(),
            failed = errors.len(),
            artifact_saved = artifact.as_ref().map(|a| a.saved).unwrap_or(false),
            "pipeline run finished"
        );

        Ok(PipelineRun {
            session_id,
            scope,
            outputs,
            events,
            errors,
            artifact,
            new_artifacts: new_artifacts(&before, &after),
        })
    }

    async fn run_stage(
        &self,
        stage: &dyn Stage,
        session: &SessionHandle,
        scope: &SessionKey,
        message: &str,
        tx: &mpsc::UnboundedSender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> Result<Value, StageError> {
        emit(
            tx,
            PipelineEvent::StageStarted {
                stage: stage.name().to_string(),
            },
        );
        // Inputs are copied after the previous stage's write, so stage N+1
        // always reads stage N's output.
        let inputs = StageInputs::from_state(&stage.inputs(), &session.state())?;
        let ctx = StageContext {
            scope: scope.clone(),
            message: message.to_string(),
            inputs,
            events: StageEvents::new(stage.name(), tx.clone()),
            cancel: cancel.child_token(),
        };
        debug!(stage = stage.name(), "stage started");
        stage.run(&ctx).await
    }

    /// Presence is decided by loading, never by what a stage claimed.
    async fn check_artifact(&self, scope: &SessionKey, filename: &str) -> ArtifactCheck {
        match self.artifacts.load(scope, filename).await {
            Ok(Some(artifact)) => ArtifactCheck {
                filename: filename.to_string(),
                saved: true,
                size_bytes: artifact.len() as u64,
            },
            Ok(None) => {
                debug!(filename, "declared artifact not found");
                ArtifactCheck::absent()
            }
            Err(e) => {
                warn!(filename, error = %e, "artifact load failed");
                ArtifactCheck::absent()
            }
        }
    }
}

fn emit(tx: &mpsc::UnboundedSender<PipelineEvent>, event: PipelineEvent) {
    if tx.send(event).is_err() {
        warn!("pipeline event receiver dropped");
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use serena_core::artifacts::Artifact;
    use serena_llm::mock::{MockProvider, MockResponse};
    use serena_store::{InMemoryArtifactStore, InMemorySessionStore};

    use crate::pipeline::model_stage::{ModelStage, OutputFormat};
    use crate::pipeline::test_support::FixedStage;
    use crate::pipeline::stage::StageKind;

    fn runner() -> PipelineRunner {
        PipelineRunner::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryArtifactStore::new()),
        )
    }

    fn echo_inputs(ctx: &StageContext) -> Result<Value, StageError> {
        Ok(json!(format!("saw {}", ctx.inputs.text("a")?)))
    }

    fn blank(_: &StageContext) -> Result<Value, StageError> {
        Ok(Value::Null)
    }

    fn fails(_: &StageContext) -> Result<Value, StageError> {
        Err(StageError::MalformedOutput("unparseable SQL".into()))
    }

    /// Writes an artifact only when `save` is true; the summary claims success either way.
    struct ArtifactStage {
        store: Arc<dyn ArtifactStore>,
        save: bool,
    }

    #[async_trait]
    impl Stage for ArtifactStage {
        fn name(&self) -> &str {
            "render"
        }
        fn kind(&self) -> StageKind {
            StageKind::Tool
        }
        fn inputs(&self) -> Vec<String> {
            vec![]
        }
        fn output_key(&self) -> &str {
            "execution_summary"
        }
        async fn run(&self, ctx: &StageContext) -> Result<Value, StageError> {
            if self.save {
                self.store
                    .save(&ctx.scope, "plot.svg", Artifact::new("image/svg+xml", vec![1u8; 64]))
                    .await?;
            }
            Ok(json!("Chart saved as plot.svg"))
        }
    }

    #[tokio::test]
    async fn stages_see_previous_outputs() {
        let pipeline = Pipeline::builder("p")
            .stage(FixedStage::new("first", &[], "a", |_| Ok(json!("alpha"))))
            .stage(FixedStage::new("second", &["a"], "b", echo_inputs))
            .build()
            .unwrap();
        let run = runner().run(&pipeline, RunParams::new("go")).await.unwrap();
        assert_eq!(run.text("b"), "saw alpha");
        assert!(!run.has_errors());
    }

    #[tokio::test]
    async fn missing_outputs_become_sentinels() {
        let pipeline = Pipeline::builder("p")
            .stage(FixedStage::new("model", &[], "a", blank))
            .stage(FixedStage::new("tool", &[], "b", blank).tool())
            .build()
            .unwrap();
        let run = runner().run(&pipeline, RunParams::new("go")).await.unwrap();
        assert_eq!(run.output("a"), Some(&json!("Not generated.")));
        assert_eq!(run.output("b"), Some(&json!("Not executed.")));
    }

    #[tokio::test]
    async fn failed_stage_writes_error_and_run_continues() {
        let pipeline = Pipeline::builder("p")
            .stage(FixedStage::new("review", &[], "a", fails))
            .stage(FixedStage::new("execute", &["a"], "b", echo_inputs).tool())
            .build()
            .unwrap();
        let run = runner().run(&pipeline, RunParams::new("go")).await.unwrap();
        assert!(run.text("a").starts_with("Error: review failed"));
        assert!(run.text("b").starts_with("saw Error: review failed"));
        assert_eq!(run.errors.len(), 1);
        assert!(run
            .events
            .iter()
            .any(|e| matches!(e, PipelineEvent::StageFailed { stage, .. } if stage == "review")));
    }

    #[tokio::test]
    async fn each_run_gets_an_isolated_session() {
        let runner = runner();
        let pipeline = Pipeline::builder("p")
            .seed_keys(&["a"])
            .stage(FixedStage::new("echo", &["a"], "b", echo_inputs))
            .build()
            .unwrap();
        let seed: SessionState = [("a", json!("x"))].into_iter().collect();
        let first = runner
            .run(&pipeline, RunParams::new("go").with_state(seed.clone()))
            .await
            .unwrap();
        let second = runner
            .run(&pipeline, RunParams::new("go").with_state(seed))
            .await
            .unwrap();
        assert_ne!(first.session_id, second.session_id);
        let listed = runner.sessions().list_sessions("p", SYNTHETIC_USER_ID).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(first.text("b"), second.text("b"));
    }

    #[tokio::test]
    async fn claimed_but_unsaved_artifact_is_absent() {
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let runner = PipelineRunner::new(Arc::new(InMemorySessionStore::new()), store.clone());
        let pipeline = Pipeline::builder("visualization_app")
            .stage(ArtifactStage {
                store: store.clone(),
                save: false,
            })
            .produces_artifact("plot.svg")
            .build()
            .unwrap();
        let run = runner.run(&pipeline, RunParams::new("chart")).await.unwrap();
        assert_eq!(run.text("execution_summary"), "Chart saved as plot.svg");
        assert_eq!(run.artifact, Some(ArtifactCheck::absent()));

        let mut payload = Map::new();
        run.insert_artifact_fields(&mut payload);
        assert_eq!(payload["artifact_saved"], "No");
        assert_eq!(payload["artifact_size_bytes"], 0);
    }

    #[tokio::test]
    async fn saved_artifact_is_verified_and_diffed() {
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let runner = PipelineRunner::new(Arc::new(InMemorySessionStore::new()), store.clone());
        let pipeline = Pipeline::builder("visualization_app")
            .stage(ArtifactStage { store, save: true })
            .produces_artifact("plot.svg")
            .build()
            .unwrap();
        let run = runner.run(&pipeline, RunParams::new("chart")).await.unwrap();
        let check = run.artifact.clone().unwrap();
        assert!(check.saved);
        assert_eq!(check.size_bytes, 64);
        assert_eq!(run.new_artifacts, vec!["plot.svg".to_string()]);
    }

    #[tokio::test]
    async fn users_query_generation_mentions_users_table() {
        let understand = Arc::new(MockProvider::new(vec![MockResponse::text(
            "The user wants a count of rows in the users table.",
        )]));
        let generate = Arc::new(MockProvider::new(vec![MockResponse::text(
            "```sql\nSELECT COUNT(*) AS user_count FROM `StyleHub.users` AS u\n```",
        )]));
        let review = Arc::new(MockProvider::new(vec![MockResponse::text(
            "SELECT COUNT(*) AS user_count FROM `StyleHub.users` AS u",
        )]));

        let pipeline = Pipeline::builder("sql_pipeline_app")
            .seed_keys(&["schema_metadata"])
            .stage(ModelStage::new(
                "understand",
                understand,
                "Metadata:\n{schema_metadata}",
                "query_understanding_output",
            ))
            .stage(
                ModelStage::new(
                    "generate",
                    generate,
                    "{schema_metadata}\n{query_understanding_output}",
                    "query_generation_output",
                )
                .with_format(OutputFormat::Sql),
            )
            .stage(
                ModelStage::new(
                    "review",
                    review,
                    "{query_generation_output}",
                    "query_review_rewrite_output",
                )
                .with_format(OutputFormat::Sql),
            )
            .build()
            .unwrap();

        let seed: SessionState = [(
            "schema_metadata",
            json!("Table 'users': registered shoppers\nColumns:\n  - id (INTEGER): key (Primary Key)"),
        )]
        .into_iter()
        .collect();
        let run = runner()
            .run(
                &pipeline,
                RunParams::new("How many users are there?").with_state(seed),
            )
            .await
            .unwrap();

        let generated = run.text("query_generation_output");
        assert!(!generated.is_empty());
        assert!(generated.to_lowercase().contains("users"));
        let order: Vec<&str> = run
            .events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageCompleted { stage, .. } => Some(stage.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["understand", "generate", "review"]);
    }

    #[tokio::test]
    async fn cancelled_run_is_aborted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = Pipeline::builder("p")
            .stage(FixedStage::new("a", &[], "a", |_| Ok(json!(1))))
            .build()
            .unwrap();
        let err = runner()
            .run(&pipeline, RunParams::new("go").with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Aborted));
    }
}
