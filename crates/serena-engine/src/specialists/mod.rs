//! The five specialist tools the supervisor dispatches to.
//!
//! Each tool wraps one [`Pipeline`] and the shared [`PipelineRunner`]. Every
//! invocation runs in a fresh pipeline session under the synthetic user, and
//! the tool returns the pipeline's named outputs, never the transcript.

pub mod chat;
pub mod email;
pub mod poster;
pub mod prompts;
pub mod sql;
pub mod visualization;

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::warn;

use serena_core::provider::LlmProvider;
use serena_core::tools::{ToolContext, ToolError, ToolResult};
use serena_llm::ImageGenerator;

use crate::delivery::EmailSender;
use crate::error::{EngineError, PipelineError};
use crate::pipeline::{PipelineRunner, RunParams};
use crate::registry::ToolRegistry;
use crate::warehouse::Warehouse;

pub use chat::{build_greeting_pipeline, ChatTool, GREETING_APP};
pub use email::{build_email_pipeline, EmailTool, SendEmailStage, EMAIL_APP};
pub use poster::{build_poster_pipeline, GenerateImageStage, PosterTool, POSTER_APP, POSTER_FILENAME};
pub use sql::{build_sql_pipeline, ExecuteQueryStage, QueryTool, SqlPipelineConfig, SQL_APP};
pub use visualization::{
    build_visualization_pipeline, RenderChartStage, VisualizationTool, CHART_FILENAME,
    VISUALIZATION_APP,
};

/// Model per specialist.
#[derive(Clone)]
pub struct SpecialistModels {
    pub chat: Arc<dyn LlmProvider>,
    pub sql: Arc<dyn LlmProvider>,
    pub visualization: Arc<dyn LlmProvider>,
    pub poster: Arc<dyn LlmProvider>,
    pub email: Arc<dyn LlmProvider>,
}

impl SpecialistModels {
    /// One model for every specialist.
    pub fn uniform(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            chat: provider.clone(),
            sql: provider.clone(),
            visualization: provider.clone(),
            poster: provider.clone(),
            email: provider,
        }
    }
}

/// Everything the specialist tools need, injected at startup.
#[derive(Clone)]
pub struct SpecialistDeps {
    pub runner: PipelineRunner,
    pub models: SpecialistModels,
    pub images: Arc<dyn ImageGenerator>,
    pub warehouse: Arc<dyn Warehouse>,
    pub email: Arc<dyn EmailSender>,
    pub sql: SqlPipelineConfig,
}

/// Build the five specialist tools and register them.
pub fn build_registry(deps: &SpecialistDeps) -> Result<ToolRegistry, PipelineError> {
    let artifacts = deps.runner.artifacts().clone();

    let chat = ChatTool::new(
        deps.runner.clone(),
        build_greeting_pipeline(deps.models.chat.clone())?,
    );
    let query = QueryTool::new(
        deps.runner.clone(),
        build_sql_pipeline(deps.models.sql.clone(), deps.warehouse.clone(), &deps.sql)?,
    );
    let visualization = VisualizationTool::new(
        deps.runner.clone(),
        build_visualization_pipeline(deps.models.visualization.clone(), artifacts.clone())?,
    );
    let poster = PosterTool::new(
        deps.runner.clone(),
        build_poster_pipeline(deps.models.poster.clone(), deps.images.clone(), artifacts)?,
    );
    let email = EmailTool::new(
        deps.runner.clone(),
        build_email_pipeline(deps.models.email.clone(), deps.email.clone())?,
    );

    Ok(ToolRegistry::new()
        .with(Arc::new(chat))
        .with(Arc::new(query))
        .with(Arc::new(visualization))
        .with(Arc::new(poster))
        .with(Arc::new(email)))
}

/// Run parameters for a tool call: the initiating message plus seed state,
/// cancelled together with the supervisor turn.
fn run_params(message: &str, seed: &[(&str, Value)], ctx: &ToolContext) -> RunParams {
    let state = seed
        .iter()
        .map(|(k, v)| (*k, v.clone()))
        .collect();
    RunParams::new(message)
        .with_state(state)
        .with_cancel(ctx.abort_signal.child_token())
}

/// Map a runner failure onto the tool contract. Cancellation propagates;
/// anything else becomes a readable error result.
fn run_failure(tool: &str, err: EngineError) -> Result<ToolResult, ToolError> {
    match err {
        EngineError::Aborted => Err(ToolError::Cancelled),
        other => {
            warn!(tool, error = %other, "specialist run failed");
            Ok(ToolResult::error(format!("{tool} failed: {other}")))
        }
    }
}

/// JSON schema for an object of required string arguments.
fn string_params(required: &[(&str, &str)], optional: &[(&str, &str)]) -> Value {
    let mut properties = Map::new();
    for (name, description) in required.iter().chain(optional) {
        properties.insert(
            (*name).to_string(),
            json!({"type": "string", "description": description}),
        );
    }
    let required: Vec<&str> = required.iter().map(|(name, _)| *name).collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use serena_llm::mock::{MockImageGenerator, MockProvider};
    use tempfile::TempDir;

    use crate::delivery::DisabledEmailSender;

    #[test]
    fn schema_lists_required_and_optional() {
        let schema = string_params(&[("user_query", "Question")], &[("query_data", "Rows")]);
        assert_eq!(schema["required"], json!(["user_query"]));
        assert_eq!(schema["properties"]["query_data"]["type"], "string");
    }

    #[test]
    fn failures_become_error_results() {
        let result = run_failure("call_bq_agent", EngineError::Internal("boom".into())).unwrap();
        assert!(result.is_error);
        assert!(result.error_message().unwrap().contains("boom"));
        assert!(matches!(
            run_failure("call_bq_agent", EngineError::Aborted),
            Err(ToolError::Cancelled)
        ));
    }

    #[test]
    fn registry_holds_all_five_tools() {
        let dir = TempDir::new().unwrap();
        let deps = SpecialistDeps {
            runner: test_support::runner(),
            models: SpecialistModels::uniform(Arc::new(MockProvider::new(vec![]))),
            images: Arc::new(MockImageGenerator::returning(vec![0u8; 4])),
            warehouse: test_support::warehouse(dir.path()),
            email: Arc::new(DisabledEmailSender),
            sql: SqlPipelineConfig::new("stylehub-prod", "US", "StyleHub", test_support::SCHEMA),
        };
        let registry = build_registry(&deps).unwrap();
        assert_eq!(
            registry.names(),
            vec![
                "call_bq_agent",
                "call_chat_agent",
                "call_email_agent",
                "call_poster_agent",
                "call_visualization_agent"
            ]
        );
    }
}
