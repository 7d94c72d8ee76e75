//! Conversational specialist: a single reply stage.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::instrument;

use serena_core::provider::LlmProvider;
use serena_core::tools::{required_str, Tool, ToolContext, ToolError, ToolKind, ToolResult};

use crate::error::PipelineError;
use crate::pipeline::{ModelStage, Pipeline, PipelineRunner, NOT_GENERATED};
use crate::specialists::prompts::GREETING_PROMPT;
use crate::specialists::{run_failure, run_params, string_params};

pub const GREETING_APP: &str = "greeting_app";
pub const KEY_GREETING: &str = "greeting_response";

const NO_RESPONSE: &str = "No response was generated.";

pub fn build_greeting_pipeline(provider: Arc<dyn LlmProvider>) -> Result<Pipeline, PipelineError> {
    Pipeline::builder(GREETING_APP)
        .stage(ModelStage::new("reply", provider, GREETING_PROMPT, KEY_GREETING).with_temperature(0.7))
        .build()
}

/// `call_chat_agent`: greetings and general conversation.
pub struct ChatTool {
    runner: PipelineRunner,
    pipeline: Pipeline,
}

impl ChatTool {
    pub fn new(runner: PipelineRunner, pipeline: Pipeline) -> Self {
        Self { runner, pipeline }
    }
}

#[async_trait]
impl Tool for ChatTool {
    fn name(&self) -> &str {
        "call_chat_agent"
    }

    fn description(&self) -> &str {
        "Handle greetings, small talk and general questions about what Serena can do."
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Conversation
    }

    fn parameters_schema(&self) -> Value {
        string_params(&[("user_query", "The user's message.")], &[])
    }

    #[instrument(skip_all, fields(tool = "call_chat_agent"))]
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let user_query = required_str(&args, "user_query")?;
        let run = match self
            .runner
            .run(&self.pipeline, run_params(user_query, &[], ctx))
            .await
        {
            Ok(run) => run,
            Err(e) => return run_failure(self.name(), e),
        };

        let mut response = run.text(KEY_GREETING);
        if response == NOT_GENERATED {
            response = NO_RESPONSE.to_string();
        }
        let mut payload = Map::new();
        payload.insert("session_id".into(), json!(run.session_id.to_string()));
        payload.insert("response".into(), json!(response));
        Ok(ToolResult::ok(payload))
    }
}
