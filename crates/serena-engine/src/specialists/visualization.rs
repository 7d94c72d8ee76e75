//! Chart specialist: chart type → chart spec → SVG render.
//!
//! Seeded with rows from an earlier query instead of querying again.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, instrument};

use serena_core::artifacts::Artifact;
use serena_core::provider::LlmProvider;
use serena_core::tools::{required_str, Tool, ToolContext, ToolError, ToolKind, ToolResult};
use serena_store::ArtifactStore;

use crate::chart::{render_svg, rows_from_value, ChartSpec, SVG_MIME};
use crate::error::{PipelineError, StageError};
use crate::pipeline::{
    is_placeholder, ModelStage, OutputFormat, Pipeline, PipelineRunner, Stage, StageContext,
    StageKind,
};
use crate::specialists::prompts::{CHART_SPEC_PROMPT, CHART_TYPE_PROMPT};
use crate::specialists::{run_failure, run_params, string_params};

pub const VISUALIZATION_APP: &str = "visualization_app";
pub const CHART_FILENAME: &str = "plot.svg";

/// Conversation-state key holding the most recent query rows.
pub const LAST_QUERY_RESULT: &str = "last_query_result";

pub const KEY_ROWS: &str = "query_execution_output";
pub const KEY_CHART_TYPE: &str = "chart_type_output";
pub const KEY_CHART_SPEC: &str = "chart_spec_output";
pub const KEY_SUMMARY: &str = "execution_summary";

const NO_DATA: &str = "No query results are available to visualize. Run a data query first.";

pub fn build_visualization_pipeline(
    provider: Arc<dyn LlmProvider>,
    artifacts: Arc<dyn ArtifactStore>,
) -> Result<Pipeline, PipelineError> {
    Pipeline::builder(VISUALIZATION_APP)
        .seed_keys(&[KEY_ROWS, "user_query"])
        .stage(ModelStage::new(
            "chart_type",
            provider.clone(),
            CHART_TYPE_PROMPT,
            KEY_CHART_TYPE,
        ))
        .stage(
            ModelStage::new("chart_spec", provider, CHART_SPEC_PROMPT, KEY_CHART_SPEC)
                .with_format(OutputFormat::Json),
        )
        .stage(RenderChartStage::new(artifacts))
        .produces_artifact(CHART_FILENAME)
        .build()
}

/// Renders the chart spec over the seeded rows and stores `plot.svg`.
pub struct RenderChartStage {
    artifacts: Arc<dyn ArtifactStore>,
}

impl RenderChartStage {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl Stage for RenderChartStage {
    fn name(&self) -> &str {
        "render"
    }

    fn kind(&self) -> StageKind {
        StageKind::Tool
    }

    fn inputs(&self) -> Vec<String> {
        vec![KEY_CHART_SPEC.to_string(), KEY_ROWS.to_string()]
    }

    fn output_key(&self) -> &str {
        KEY_SUMMARY
    }

    async fn run(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let raw = ctx.inputs.get(KEY_CHART_SPEC)?;
        if let Value::String(text) = raw {
            if is_placeholder(text) {
                return Err(StageError::MalformedOutput(format!(
                    "no chart spec to render ({})",
                    text.trim()
                )));
            }
        }
        let spec = ChartSpec::from_value(raw)?;
        let rows = rows_from_value(ctx.inputs.get(KEY_ROWS)?)?;
        let svg = render_svg(&spec, &rows)?;

        let size = svg.len() as u64;
        self.artifacts
            .save(&ctx.scope, CHART_FILENAME, Artifact::new(SVG_MIME, svg.into_bytes()))
            .await?;
        ctx.events.artifact_saved(CHART_FILENAME, size);
        info!(kind = spec.kind.as_str(), rows = rows.len(), size, "chart rendered");

        Ok(Value::String(format!(
            "Rendered a {} chart \"{}\" from {} rows and saved it as {CHART_FILENAME} ({size} bytes).",
            spec.kind.as_str(),
            spec.title,
            rows.len()
        )))
    }
}

/// `call_visualization_agent`: charts rows from a previous query.
pub struct VisualizationTool {
    runner: PipelineRunner,
    pipeline: Pipeline,
}

impl VisualizationTool {
    pub fn new(runner: PipelineRunner, pipeline: Pipeline) -> Self {
        Self { runner, pipeline }
    }
}

/// Rows passed explicitly win; otherwise the conversation's last query result.
fn query_data(args: &Value, ctx: &ToolContext) -> Option<Value> {
    let explicit = match args.get("query_data") {
        Some(Value::String(s)) if !s.trim().is_empty() => {
            Some(serde_json::from_str::<Value>(s).unwrap_or_else(|_| Value::String(s.clone())))
        }
        Some(v @ (Value::Array(_) | Value::Object(_))) => Some(v.clone()),
        _ => None,
    };
    explicit.or_else(|| ctx.conversation_state.get(LAST_QUERY_RESULT).cloned())
}

#[async_trait]
impl Tool for VisualizationTool {
    fn name(&self) -> &str {
        "call_visualization_agent"
    }

    fn description(&self) -> &str {
        "Create a chart from the rows returned by a previous data query. Pass the rows as \
         query_data, or omit it to chart the most recent query result."
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Visualization
    }

    fn parameters_schema(&self) -> Value {
        string_params(
            &[("user_query", "What to visualize and how.")],
            &[("query_data", "JSON rows returned by the data query.")],
        )
    }

    #[instrument(skip_all, fields(tool = "call_visualization_agent"))]
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let user_query = required_str(&args, "user_query")?;
        let rows = query_data(&args, ctx).ok_or_else(|| ToolError::InvalidArguments(NO_DATA.into()))?;

        let params = run_params(
            user_query,
            &[(KEY_ROWS, rows), ("user_query", json!(user_query))],
            ctx,
        );
        let run = match self.runner.run(&self.pipeline, params).await {
            Ok(run) => run,
            Err(e) => return run_failure(self.name(), e),
        };

        let mut payload = Map::new();
        run.insert_artifact_fields(&mut payload);
        payload.insert("chart_type_info".into(), json!(run.text(KEY_CHART_TYPE)));
        payload.insert(
            "chart_spec".into(),
            run.output(KEY_CHART_SPEC).cloned().unwrap_or(Value::Null),
        );
        payload.insert("execution_summary".into(), json!(run.text(KEY_SUMMARY)));
        Ok(ToolResult::ok(payload))
    }
}
