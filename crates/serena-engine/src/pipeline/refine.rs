use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use serena_core::messages::Content;
use serena_core::provider::{LlmProvider, LlmRequest};

use crate::error::StageError;
use crate::pipeline::model_stage::{parse_output, OutputFormat};
use crate::pipeline::stage::{PipelineEvent, Stage, StageContext, StageKind};
use crate::pipeline::template::PromptTemplate;

/// Loop-local template variable holding the SQL under review.
pub const CANDIDATE_KEY: &str = "candidate_sql";
/// Loop-local template variable holding the critic's last feedback.
pub const FEEDBACK_KEY: &str = "review_feedback";

#[derive(Debug, Deserialize)]
struct Verdict {
    verdict: String,
    #[serde(default)]
    feedback: String,
}

/// Critic/reviser loop that replaces a single review stage.
///
/// The critic answers `{"verdict": "correct"}` or
/// `{"verdict": "incorrect", "feedback": "..."}`; on rejection the reviser
/// rewrites the candidate using the feedback. The loop ends on approval or
/// after `max_iterations` critic rounds and writes one output key.
pub struct RefinementLoop {
    name: String,
    seed_key: String,
    output_key: String,
    critic: Arc<dyn LlmProvider>,
    critic_instruction: PromptTemplate,
    reviser: Arc<dyn LlmProvider>,
    reviser_instruction: PromptTemplate,
    max_iterations: u32,
}

impl RefinementLoop {
    /// `seed_key` holds the first candidate (the generated SQL).
    pub fn new(
        name: impl Into<String>,
        seed_key: impl Into<String>,
        output_key: impl Into<String>,
        max_iterations: u32,
    ) -> RefinementLoopBuilder {
        RefinementLoopBuilder {
            name: name.into(),
            seed_key: seed_key.into(),
            output_key: output_key.into(),
            max_iterations: max_iterations.max(1),
        }
    }

    async fn ask(
        &self,
        provider: &dyn LlmProvider,
        instruction: String,
        ctx: &StageContext,
        format: OutputFormat,
    ) -> Result<Value, StageError> {
        let mut request =
            LlmRequest::new(instruction).with_content(Content::user_text(ctx.message.clone()));
        if format == OutputFormat::Json {
            request = request.with_json_output();
        }
        let response = tokio::select! {
            r = provider.generate(&request) => r?,
            _ = ctx.cancel.cancelled() => return Err(StageError::Cancelled),
        };
        parse_output(&response.text, format)
    }
}

pub struct RefinementLoopBuilder {
    name: String,
    seed_key: String,
    output_key: String,
    max_iterations: u32,
}

impl RefinementLoopBuilder {
    pub fn build(
        self,
        critic: Arc<dyn LlmProvider>,
        critic_instruction: impl Into<String>,
        reviser: Arc<dyn LlmProvider>,
        reviser_instruction: impl Into<String>,
    ) -> RefinementLoop {
        RefinementLoop {
            name: self.name,
            seed_key: self.seed_key,
            output_key: self.output_key,
            critic,
            critic_instruction: PromptTemplate::new(critic_instruction),
            reviser,
            reviser_instruction: PromptTemplate::new(reviser_instruction),
            max_iterations: self.max_iterations,
        }
    }
}

#[async_trait]
impl Stage for RefinementLoop {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Model
    }

    fn inputs(&self) -> Vec<String> {
        let mut keys = vec![self.seed_key.clone()];
        for key in self
            .critic_instruction
            .keys()
            .iter()
            .chain(self.reviser_instruction.keys())
        {
            if key != CANDIDATE_KEY && key != FEEDBACK_KEY && !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    fn output_key(&self) -> &str {
        &self.output_key
    }

    async fn run(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let mut candidate = ctx.inputs.text(&self.seed_key)?;

        for iteration in 1..=self.max_iterations {
            let inputs = ctx
                .inputs
                .with(CANDIDATE_KEY, candidate.clone())
                .with(FEEDBACK_KEY, "");
            let review = self
                .ask(
                    self.critic.as_ref(),
                    self.critic_instruction.render(&inputs)?,
                    ctx,
                    OutputFormat::Json,
                )
                .await?;
            let verdict: Verdict = serde_json::from_value(review)
                .map_err(|e| StageError::MalformedOutput(format!("critic verdict: {e}")))?;
            let approved = verdict.verdict.eq_ignore_ascii_case("correct");

            ctx.events.emit(PipelineEvent::RefinementRound {
                stage: self.name.clone(),
                iteration,
                approved,
            });
            if approved {
                info!(stage = %self.name, iteration, "candidate approved");
                return Ok(Value::String(candidate));
            }

            debug!(stage = %self.name, iteration, feedback = %verdict.feedback, "revising candidate");
            let inputs = ctx
                .inputs
                .with(CANDIDATE_KEY, candidate.clone())
                .with(FEEDBACK_KEY, verdict.feedback);
            let revised = self
                .ask(
                    self.reviser.as_ref(),
                    self.reviser_instruction.render(&inputs)?,
                    ctx,
                    OutputFormat::Sql,
                )
                .await?;
            candidate = revised.as_str().unwrap_or_default().to_string();
        }

        info!(stage = %self.name, max = self.max_iterations, "iteration budget spent");
        Ok(Value::String(candidate))
    }
}
