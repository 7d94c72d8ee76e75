use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use serena_core::messages::Content;
use serena_core::provider::{LlmProvider, LlmRequest};

use crate::error::StageError;
use crate::pipeline::stage::{Stage, StageContext, StageKind};
use crate::pipeline::template::PromptTemplate;

/// How a model stage post-processes the reply before storing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Trimmed text.
    Text,
    /// SQL with any markdown fence removed.
    Sql,
    /// Parsed JSON; the model is asked for `application/json`.
    Json,
}

/// A stage that renders its instruction from state and asks a model.
pub struct ModelStage {
    name: String,
    provider: Arc<dyn LlmProvider>,
    instruction: PromptTemplate,
    output_key: String,
    format: OutputFormat,
    temperature: Option<f32>,
}

impl ModelStage {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        instruction: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            instruction: PromptTemplate::new(instruction),
            output_key: output_key.into(),
            format: OutputFormat::Text,
            temperature: None,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl Stage for ModelStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Model
    }

    fn inputs(&self) -> Vec<String> {
        self.instruction.keys().to_vec()
    }

    fn output_key(&self) -> &str {
        &self.output_key
    }

    async fn run(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let instruction = self.instruction.render(&ctx.inputs)?;
        let mut request =
            LlmRequest::new(instruction).with_content(Content::user_text(ctx.message.clone()));
        request.config.temperature = self.temperature;
        if self.format == OutputFormat::Json {
            request = request.with_json_output();
        }

        let response = tokio::select! {
            r = self.provider.generate(&request) => r?,
            _ = ctx.cancel.cancelled() => return Err(StageError::Cancelled),
        };
        debug!(stage = %self.name, chars = response.text.len(), "model stage replied");

        parse_output(&response.text, self.format)
    }
}

/// Apply an [`OutputFormat`] to raw model text.
pub fn parse_output(raw: &str, format: OutputFormat) -> Result<Value, StageError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(StageError::EmptyOutput);
    }
    match format {
        OutputFormat::Text => Ok(Value::String(text.to_string())),
        OutputFormat::Sql => {
            let sql = strip_code_fences(text);
            if sql.is_empty() {
                return Err(StageError::EmptyOutput);
            }
            Ok(Value::String(sql.to_string()))
        }
        OutputFormat::Json => serde_json::from_str(strip_code_fences(text))
            .map_err(|e| StageError::MalformedOutput(format!("expected JSON: {e}"))),
    }
}

/// Remove a surrounding markdown code fence (```sql ... ```), if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string on the opening line.
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}
