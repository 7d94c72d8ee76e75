//! Sequential specialist pipelines.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s sharing one session. Each
//! stage reads declared state keys and writes exactly one output key; the
//! [`PipelineRunner`] executes stages strictly in order so stage N+1 always
//! sees stage N's output.

pub mod model_stage;
pub mod refine;
pub mod runner;
pub mod stage;
pub mod template;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serena_core::state::SessionState;

use crate::error::PipelineError;

pub use model_stage::{ModelStage, OutputFormat};
pub use refine::RefinementLoop;
pub use runner::{ArtifactCheck, PipelineRun, PipelineRunner, RunParams};
pub use stage::{
    is_placeholder, PipelineEvent, Stage, StageContext, StageEvents, StageInputs, StageKind,
    ERROR_PREFIX, NOT_EXECUTED, NOT_GENERATED,
};
pub use template::PromptTemplate;

/// Callback that seeds state before the first stage runs.
pub type SeedFn = Arc<dyn Fn(&mut SessionState) + Send + Sync>;

/// A validated, immutable stage sequence.
pub struct Pipeline {
    app_name: String,
    stages: Vec<Arc<dyn Stage>>,
    before_run: Option<SeedFn>,
    artifact: Option<String>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("app_name", &self.app_name)
            .field("stages", &self.stage_names())
            .field("artifact", &self.artifact)
            .finish()
    }
}

impl Pipeline {
    pub fn builder(app_name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            app_name: app_name.into(),
            seed_keys: Vec::new(),
            stages: Vec::new(),
            before_run: None,
            artifact: None,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Output keys in stage order, without duplicates.
    pub fn output_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for stage in &self.stages {
            if !keys.contains(&stage.output_key()) {
                keys.push(stage.output_key());
            }
        }
        keys
    }

    /// Artifact filename this pipeline is expected to persist.
    pub fn artifact(&self) -> Option<&str> {
        self.artifact.as_deref()
    }

    pub(crate) fn seed(&self, state: &mut SessionState) {
        if let Some(f) = &self.before_run {
            f(state);
        }
    }
}

struct PendingStage {
    stage: Arc<dyn Stage>,
    overwrites: bool,
}

pub struct PipelineBuilder {
    app_name: String,
    seed_keys: Vec<String>,
    stages: Vec<PendingStage>,
    before_run: Option<SeedFn>,
    artifact: Option<String>,
}

impl PipelineBuilder {
    /// Keys guaranteed to be present before the first stage (initial state
    /// plus whatever `before_run` inserts).
    pub fn seed_keys(mut self, keys: &[&str]) -> Self {
        self.seed_keys.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn before_run(mut self, f: impl Fn(&mut SessionState) + Send + Sync + 'static) -> Self {
        self.before_run = Some(Arc::new(f));
        self
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(PendingStage {
            stage: Arc::new(stage),
            overwrites: false,
        });
        self
    }

    /// A stage that intentionally rewrites an earlier stage's key. It must
    /// also read that key, so the rewrite is read-before-write.
    pub fn revise(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(PendingStage {
            stage: Arc::new(stage),
            overwrites: true,
        });
        self
    }

    pub fn produces_artifact(mut self, filename: impl Into<String>) -> Self {
        self.artifact = Some(filename.into());
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::Empty(self.app_name));
        }

        let mut available: HashSet<String> = self.seed_keys.iter().cloned().collect();
        let mut written: HashSet<String> = HashSet::new();

        for pending in &self.stages {
            let stage = &pending.stage;
            let inputs = stage.inputs();
            for key in &inputs {
                if !available.contains(key) {
                    return Err(PipelineError::UnknownInput {
                        stage: stage.name().to_string(),
                        key: key.clone(),
                    });
                }
            }

            let key = stage.output_key().to_string();
            if written.contains(&key) || self.seed_keys.contains(&key) {
                if !pending.overwrites {
                    return Err(PipelineError::DuplicateOutput {
                        stage: stage.name().to_string(),
                        key,
                    });
                }
                if !inputs.contains(&key) {
                    return Err(PipelineError::BlindOverwrite {
                        stage: stage.name().to_string(),
                        key,
                    });
                }
            }
            written.insert(key.clone());
            available.insert(key);
        }

        Ok(Pipeline {
            app_name: self.app_name,
            stages: self.stages.into_iter().map(|p| p.stage).collect(),
            before_run: self.before_run,
            artifact: self.artifact,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::error::StageError;

    /// Stage returning a fixed result, for builder and runner tests.
    pub struct FixedStage {
        pub name: String,
        pub inputs: Vec<String>,
        pub output_key: String,
        pub kind: StageKind,
        pub result: fn(&StageContext) -> Result<Value, StageError>,
    }

    impl FixedStage {
        pub fn new(
            name: &str,
            inputs: &[&str],
            output_key: &str,
            result: fn(&StageContext) -> Result<Value, StageError>,
        ) -> Self {
            Self {
                name: name.into(),
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                output_key: output_key.into(),
                kind: StageKind::Model,
                result,
            }
        }

        pub fn tool(mut self) -> Self {
            self.kind = StageKind::Tool;
            self
        }
    }

    #[async_trait]
    impl Stage for FixedStage {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> StageKind {
            self.kind
        }
        fn inputs(&self) -> Vec<String> {
            self.inputs.clone()
        }
        fn output_key(&self) -> &str {
            &self.output_key
        }
        async fn run(&self, ctx: &StageContext) -> Result<Value, StageError> {
            (self.result)(ctx)
        }
    }
}
