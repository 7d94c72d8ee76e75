//! Text-to-SQL specialist: understand → generate → review → execute.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use serena_core::provider::LlmProvider;
use serena_core::tools::{required_str, Tool, ToolContext, ToolError, ToolKind, ToolResult};

use crate::error::{PipelineError, StageError};
use crate::pipeline::model_stage::strip_code_fences;
use crate::pipeline::{
    is_placeholder, ModelStage, OutputFormat, Pipeline, PipelineRunner, RefinementLoop, Stage,
    StageContext, StageKind,
};
use crate::specialists::prompts::{
    SQL_CRITIC_PROMPT, SQL_GENERATE_PROMPT, SQL_REVIEW_PROMPT, SQL_REVISER_PROMPT,
    SQL_UNDERSTAND_PROMPT,
};
use crate::specialists::{run_failure, run_params, string_params};
use crate::warehouse::Warehouse;

pub const SQL_APP: &str = "sql_pipeline_app";

pub const KEY_UNDERSTANDING: &str = "query_understanding_output";
pub const KEY_GENERATED: &str = "query_generation_output";
pub const KEY_REVIEWED: &str = "query_review_rewrite_output";
pub const KEY_EXECUTION: &str = "query_execution_output";

/// Identifiers and schema text seeded into every SQL run.
#[derive(Clone, Debug)]
pub struct SqlPipelineConfig {
    pub project: String,
    pub location: String,
    pub dataset: String,
    /// Rendered table paragraphs, loaded once at startup.
    pub schema_metadata: String,
    /// Critic/reviser rounds for the review stage; 0 keeps the single pass.
    pub refinement_iterations: u32,
}

impl SqlPipelineConfig {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        dataset: impl Into<String>,
        schema_metadata: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            location: location.into(),
            dataset: dataset.into(),
            schema_metadata: schema_metadata.into(),
            refinement_iterations: 0,
        }
    }

    pub fn with_refinement(mut self, iterations: u32) -> Self {
        self.refinement_iterations = iterations;
        self
    }
}

pub fn build_sql_pipeline(
    provider: Arc<dyn LlmProvider>,
    warehouse: Arc<dyn Warehouse>,
    config: &SqlPipelineConfig,
) -> Result<Pipeline, PipelineError> {
    let seed = config.clone();
    let builder = Pipeline::builder(SQL_APP)
        .seed_keys(&["project", "location", "dataset", "schema_metadata", "user_query"])
        .before_run(move |state| {
            state.insert("project", seed.project.clone());
            state.insert("location", seed.location.clone());
            state.insert("dataset", seed.dataset.clone());
            state.insert("schema_metadata", seed.schema_metadata.clone());
        })
        .stage(ModelStage::new(
            "understand",
            provider.clone(),
            SQL_UNDERSTAND_PROMPT,
            KEY_UNDERSTANDING,
        ))
        .stage(
            ModelStage::new("generate", provider.clone(), SQL_GENERATE_PROMPT, KEY_GENERATED)
                .with_format(OutputFormat::Sql),
        );

    let builder = if config.refinement_iterations > 0 {
        builder.stage(
            RefinementLoop::new("review", KEY_GENERATED, KEY_REVIEWED, config.refinement_iterations)
                .build(
                    provider.clone(),
                    SQL_CRITIC_PROMPT,
                    provider,
                    SQL_REVISER_PROMPT,
                ),
        )
    } else {
        builder.stage(
            ModelStage::new("review", provider, SQL_REVIEW_PROMPT, KEY_REVIEWED)
                .with_format(OutputFormat::Sql),
        )
    };

    builder
        .stage(ExecuteQueryStage::new(warehouse, KEY_REVIEWED, KEY_EXECUTION))
        .build()
}

/// Runs the reviewed SQL against the warehouse.
///
/// Writes the row array, or `{"error": ..}` when there is no usable SQL or
/// the warehouse refuses it. Neither case fails the stage.
pub struct ExecuteQueryStage {
    warehouse: Arc<dyn Warehouse>,
    input_key: String,
    output_key: String,
}

impl ExecuteQueryStage {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        input_key: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            warehouse,
            input_key: input_key.into(),
            output_key: output_key.into(),
        }
    }
}

#[async_trait]
impl Stage for ExecuteQueryStage {
    fn name(&self) -> &str {
        "execute"
    }

    fn kind(&self) -> StageKind {
        StageKind::Tool
    }

    fn inputs(&self) -> Vec<String> {
        vec![self.input_key.clone()]
    }

    fn output_key(&self) -> &str {
        &self.output_key
    }

    async fn run(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let text = ctx.inputs.text(&self.input_key)?;
        if is_placeholder(&text) {
            warn!(input = %text, "no usable SQL to execute");
            return Ok(json!({ "error": format!("No valid SQL to execute: {}", text.trim()) }));
        }
        let sql = strip_code_fences(&text);

        let result = tokio::select! {
            r = self.warehouse.execute_query(sql) => r,
            _ = ctx.cancel.cancelled() => return Err(StageError::Cancelled),
        };
        match result {
            Ok(rows) => {
                info!(rows = rows.len(), "query executed");
                Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
            }
            Err(e) => {
                warn!(error = %e, "query execution failed");
                Ok(json!({ "error": e.to_string() }))
            }
        }
    }
}

/// `call_bq_agent`: answers a data question with SQL and its rows.
pub struct QueryTool {
    runner: PipelineRunner,
    pipeline: Pipeline,
}

impl QueryTool {
    pub fn new(runner: PipelineRunner, pipeline: Pipeline) -> Self {
        Self { runner, pipeline }
    }
}

#[async_trait]
impl Tool for QueryTool {
    fn name(&self) -> &str {
        "call_bq_agent"
    }

    fn description(&self) -> &str {
        "Answer a question about customers, orders or sales by generating, reviewing and \
         executing SQL against the data warehouse. Returns the executed SQL and the result rows."
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Query
    }

    fn parameters_schema(&self) -> Value {
        string_params(&[("user_query", "The data question in natural language.")], &[])
    }

    #[instrument(skip_all, fields(tool = "call_bq_agent"))]
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let user_query = required_str(&args, "user_query")?;
        let params = run_params(user_query, &[("user_query", json!(user_query))], ctx);
        let run = match self.runner.run(&self.pipeline, params).await {
            Ok(run) => run,
            Err(e) => return run_failure(self.name(), e),
        };

        let mut payload = Map::new();
        payload.insert("session_id".into(), json!(run.session_id.to_string()));
        payload.insert("user_query".into(), json!(user_query));
        payload.insert("understanding".into(), json!(run.text(KEY_UNDERSTANDING)));
        payload.insert("generated_sql".into(), json!(run.text(KEY_GENERATED)));
        payload.insert("reviewed_sql".into(), json!(run.text(KEY_REVIEWED)));
        payload.insert(
            "execution_result".into(),
            run.output(KEY_EXECUTION).cloned().unwrap_or(Value::Null),
        );
        Ok(ToolResult::ok(payload))
    }
}
