use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::messages::Content;
use crate::stream::{collect_response, ModelResponse, StreamEvent};
use crate::tools::ToolDefinition;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    /// Ask the model for a specific output mime type (e.g. `application/json`).
    pub response_mime_type: Option<String>,
    pub response_modalities: Vec<Modality>,
    /// Prebuilt voice for audio output.
    pub voice_name: Option<String>,
}

/// A single request to a model.
#[derive(Clone, Debug, Default)]
pub struct LlmRequest {
    pub system_instruction: Option<String>,
    pub contents: Vec<Content>,
    pub tools: Vec<ToolDefinition>,
    pub config: GenerationConfig,
}

impl LlmRequest {
    pub fn new(system_instruction: impl Into<String>) -> Self {
        Self {
            system_instruction: Some(system_instruction.into()),
            ..Default::default()
        }
    }

    pub fn with_contents(mut self, contents: Vec<Content>) -> Self {
        self.contents = contents;
        self
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.contents.push(content);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_json_output(mut self) -> Self {
        self.config.response_mime_type = Some("application/json".into());
        self
    }

    pub fn with_audio_output(mut self, voice_name: impl Into<String>) -> Self {
        self.config.response_modalities = vec![Modality::Audio];
        self.config.voice_name = Some(voice_name.into());
        self
    }
}

/// A model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream(&self, request: &LlmRequest) -> Result<EventStream, GatewayError>;

    /// Run a request to completion.
    async fn generate(&self, request: &LlmRequest) -> Result<ModelResponse, GatewayError> {
        let stream = self.stream(request).await?;
        collect_response(stream).await
    }
}
