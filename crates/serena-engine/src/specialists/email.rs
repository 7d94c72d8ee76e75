//! Email specialist: compose → send.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use serena_core::provider::LlmProvider;
use serena_core::tools::{required_str, Tool, ToolContext, ToolError, ToolKind, ToolResult};

use crate::delivery::{EmailMessage, EmailSender};
use crate::error::{EngineError, PipelineError, StageError};
use crate::pipeline::{
    is_placeholder, ModelStage, OutputFormat, Pipeline, PipelineRunner, Stage, StageContext,
    StageKind,
};
use crate::specialists::prompts::EMAIL_COMPOSE_PROMPT;
use crate::specialists::{run_failure, run_params, string_params};

pub const EMAIL_APP: &str = "email_app";

pub const KEY_DRAFT: &str = "email_draft";
pub const KEY_RESPONSE: &str = "email_agent_response";

const NO_CONFIRMATION: &str = "No confirmation response was generated.";
const AGENT_FAILED: &str = "Agent execution failed.";

pub fn build_email_pipeline(
    provider: Arc<dyn LlmProvider>,
    sender: Arc<dyn EmailSender>,
) -> Result<Pipeline, PipelineError> {
    Pipeline::builder(EMAIL_APP)
        .stage(
            ModelStage::new("compose", provider, EMAIL_COMPOSE_PROMPT, KEY_DRAFT)
                .with_format(OutputFormat::Json),
        )
        .stage(SendEmailStage::new(sender))
        .build()
}

/// Delivers the composed draft through the configured sender.
pub struct SendEmailStage {
    sender: Arc<dyn EmailSender>,
}

impl SendEmailStage {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Stage for SendEmailStage {
    fn name(&self) -> &str {
        "send"
    }

    fn kind(&self) -> StageKind {
        StageKind::Tool
    }

    fn inputs(&self) -> Vec<String> {
        vec![KEY_DRAFT.to_string()]
    }

    fn output_key(&self) -> &str {
        KEY_RESPONSE
    }

    async fn run(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let draft = ctx.inputs.get(KEY_DRAFT)?;
        if let Value::String(text) = draft {
            if is_placeholder(text) {
                return Err(StageError::MalformedOutput(format!(
                    "no email draft to send ({})",
                    text.trim()
                )));
            }
        }
        let message: EmailMessage = serde_json::from_value(draft.clone())
            .map_err(|e| StageError::MalformedOutput(format!("email draft: {e}")))?;
        message.validate()?;

        tokio::select! {
            r = self.sender.send(&message) => r?,
            _ = ctx.cancel.cancelled() => return Err(StageError::Cancelled),
        }
        info!(to = %message.to, "email sent");
        Ok(Value::String(format!(
            "Email \"{}\" sent to {}.",
            message.subject, message.to
        )))
    }
}

/// `call_email_agent`: composes and sends one promotional email.
pub struct EmailTool {
    runner: PipelineRunner,
    pipeline: Pipeline,
}

impl EmailTool {
    pub fn new(runner: PipelineRunner, pipeline: Pipeline) -> Self {
        Self { runner, pipeline }
    }

    fn failed(&self, err: EngineError) -> Result<ToolResult, ToolError> {
        let mut result = run_failure(self.name(), err)?;
        result
            .payload
            .insert("response".into(), json!(AGENT_FAILED));
        Ok(result)
    }
}

#[async_trait]
impl Tool for EmailTool {
    fn name(&self) -> &str {
        "call_email_agent"
    }

    fn description(&self) -> &str {
        "Compose and send a promotional email. The request must include the recipient \
         address and what the email should say."
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Email
    }

    fn parameters_schema(&self) -> Value {
        string_params(
            &[("user_query", "Recipient address and the content of the email.")],
            &[],
        )
    }

    #[instrument(skip_all, fields(tool = "call_email_agent"))]
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let user_query = required_str(&args, "user_query")?;
        let params = run_params(user_query, &[], ctx);
        let run = match self.runner.run(&self.pipeline, params).await {
            Ok(run) => run,
            Err(e) => return self.failed(e),
        };

        let response = run.text(KEY_RESPONSE);
        let mut payload = Map::new();
        payload.insert("session_id".into(), json!(run.session_id.to_string()));
        if is_placeholder(&response) {
            warn!(response = %response, "email was not sent");
            let shown = if response.trim() == crate::pipeline::NOT_EXECUTED {
                NO_CONFIRMATION.to_string()
            } else {
                response
            };
            payload.insert("error".into(), json!(shown));
            payload.insert("response".into(), json!(shown));
            let mut result = ToolResult::ok(payload);
            result.is_error = true;
            return Ok(result);
        }
        payload.insert("response".into(), json!(response));
        Ok(ToolResult::ok(payload))
    }
}
