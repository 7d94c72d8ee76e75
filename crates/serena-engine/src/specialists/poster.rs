//! Poster specialist: image prompt → image generation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, instrument};

use serena_core::artifacts::Artifact;
use serena_core::provider::LlmProvider;
use serena_core::tools::{required_str, Tool, ToolContext, ToolError, ToolKind, ToolResult};
use serena_llm::ImageGenerator;
use serena_store::ArtifactStore;

use crate::error::{PipelineError, StageError};
use crate::pipeline::{
    is_placeholder, ModelStage, Pipeline, PipelineRunner, Stage, StageContext, StageKind,
};
use crate::specialists::prompts::IMAGE_PROMPT_PROMPT;
use crate::specialists::{run_failure, run_params, string_params};

pub const POSTER_APP: &str = "poster_app";
pub const POSTER_FILENAME: &str = "generated_image.png";

pub const KEY_IMAGE_PROMPT: &str = "image_prompt_output";
pub const KEY_IMAGE_SUMMARY: &str = "image_generation_summary";

pub fn build_poster_pipeline(
    provider: Arc<dyn LlmProvider>,
    images: Arc<dyn ImageGenerator>,
    artifacts: Arc<dyn ArtifactStore>,
) -> Result<Pipeline, PipelineError> {
    Pipeline::builder(POSTER_APP)
        .stage(ModelStage::new(
            "image_prompt",
            provider,
            IMAGE_PROMPT_PROMPT,
            KEY_IMAGE_PROMPT,
        ))
        .stage(GenerateImageStage::new(images, artifacts))
        .produces_artifact(POSTER_FILENAME)
        .build()
}

/// Sends the written prompt to the image model and stores the result.
pub struct GenerateImageStage {
    images: Arc<dyn ImageGenerator>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl GenerateImageStage {
    pub fn new(images: Arc<dyn ImageGenerator>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { images, artifacts }
    }
}

#[async_trait]
impl Stage for GenerateImageStage {
    fn name(&self) -> &str {
        "generate_image"
    }

    fn kind(&self) -> StageKind {
        StageKind::Tool
    }

    fn inputs(&self) -> Vec<String> {
        vec![KEY_IMAGE_PROMPT.to_string()]
    }

    fn output_key(&self) -> &str {
        KEY_IMAGE_SUMMARY
    }

    async fn run(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let prompt = ctx.inputs.text(KEY_IMAGE_PROMPT)?;
        if is_placeholder(&prompt) {
            return Err(StageError::MalformedOutput(format!(
                "no image prompt to render ({})",
                prompt.trim()
            )));
        }

        let blob = tokio::select! {
            r = self.images.generate_image(&prompt) => r?,
            _ = ctx.cancel.cancelled() => return Err(StageError::Cancelled),
        };
        if blob.data.is_empty() {
            return Err(StageError::EmptyOutput);
        }

        let size = blob.data.len() as u64;
        self.artifacts
            .save(&ctx.scope, POSTER_FILENAME, Artifact::new(blob.mime_type, blob.data))
            .await?;
        ctx.events.artifact_saved(POSTER_FILENAME, size);
        info!(model = self.images.model(), size, "poster generated");

        Ok(Value::String(format!(
            "Generated one image and saved it as {POSTER_FILENAME} ({size} bytes)."
        )))
    }
}

/// `call_poster_agent`: creates a promotional poster image.
pub struct PosterTool {
    runner: PipelineRunner,
    pipeline: Pipeline,
}

impl PosterTool {
    pub fn new(runner: PipelineRunner, pipeline: Pipeline) -> Self {
        Self { runner, pipeline }
    }
}

#[async_trait]
impl Tool for PosterTool {
    fn name(&self) -> &str {
        "call_poster_agent"
    }

    fn description(&self) -> &str {
        "Generate a promotional poster image from a description of the campaign, product, \
         audience and headline."
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Asset
    }

    fn parameters_schema(&self) -> Value {
        string_params(&[("user_prompt", "Description of the poster to create.")], &[])
    }

    #[instrument(skip_all, fields(tool = "call_poster_agent"))]
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let user_prompt = required_str(&args, "user_prompt")?;
        let params = run_params(user_prompt, &[], ctx);
        let run = match self.runner.run(&self.pipeline, params).await {
            Ok(run) => run,
            Err(e) => return run_failure(self.name(), e),
        };

        let mut payload = Map::new();
        run.insert_artifact_fields(&mut payload);
        payload.insert("image_prompt".into(), json!(run.text(KEY_IMAGE_PROMPT)));
        payload.insert(
            "image_generation_summary".into(),
            json!(run.text(KEY_IMAGE_SUMMARY)),
        );
        Ok(ToolResult::ok(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serena_core::errors::GatewayError;
    use serena_llm::mock::{MockImageGenerator, MockProvider, MockResponse};

    use crate::specialists::test_support;

    fn tool(prompt_reply: MockResponse, images: Arc<MockImageGenerator>) -> PosterTool {
        let runner = test_support::runner();
        let pipeline = build_poster_pipeline(
            Arc::new(MockProvider::new(vec![prompt_reply])),
            images,
            runner.artifacts().clone(),
        )
        .unwrap();
        PosterTool::new(runner, pipeline)
    }

    #[tokio::test]
    async fn generated_image_is_stored_and_referenced() {
        let images = Arc::new(MockImageGenerator::returning(vec![0x89, b'P', b'N', b'G', 0, 1]));
        let tool = tool(
            MockResponse::text("A bright summer sale poster, bold headline \"20% OFF\"."),
            images.clone(),
        );
        let result = tool
            .invoke(json!({"user_prompt": "summer sale poster"}), &test_support::ctx())
            .await
            .unwrap();

        let artifact = result.artifact().unwrap();
        assert_eq!(artifact.app_name, POSTER_APP);
        assert_eq!(artifact.filename, POSTER_FILENAME);
        assert_eq!(artifact.size_bytes, 6);
        assert_eq!(images.prompts(), vec!["A bright summer sale poster, bold headline \"20% OFF\"."]);
        assert!(result.get_str("image_prompt").unwrap().contains("20% OFF"));
    }

    #[tokio::test]
    async fn image_model_failure_reports_no_artifact() {
        let images = Arc::new(MockImageGenerator::failing(GatewayError::SafetyBlocked(
            "blocked".into(),
        )));
        let tool = tool(MockResponse::text("A poster."), images);
        let result = tool
            .invoke(json!({"user_prompt": "poster"}), &test_support::ctx())
            .await
            .unwrap();
        assert_eq!(result.get_str("artifact_saved"), Some("No"));
        assert_eq!(result.payload["artifact_size_bytes"], 0);
        assert!(result
            .get_str("image_generation_summary")
            .unwrap()
            .starts_with("Error: generate_image failed"));
    }

    #[tokio::test]
    async fn missing_prompt_skips_image_model() {
        let images = Arc::new(MockImageGenerator::returning(vec![1u8; 8]));
        let tool = tool(MockResponse::text(" "), images.clone());
        let result = tool
            .invoke(json!({"user_prompt": "poster"}), &test_support::ctx())
            .await
            .unwrap();
        assert!(images.prompts().is_empty());
        assert_eq!(result.get_str("image_prompt"), Some("Error: image_prompt failed: model returned no output"));
        assert!(result.artifact().is_none());
    }
}
