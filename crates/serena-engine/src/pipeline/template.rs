use std::sync::LazyLock;

use regex::Regex;

use crate::error::StageError;
use crate::pipeline::stage::StageInputs;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Instruction text with `{state_key}` placeholders.
///
/// The placeholders double as the stage's declared inputs, so a template can
/// only ever reference keys the pipeline builder has checked.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    source: String,
    keys: Vec<String>,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let mut keys: Vec<String> = Vec::new();
        for cap in PLACEHOLDER.captures_iter(&source) {
            let key = cap[1].to_string();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Self { source, keys }
    }

    /// Placeholder names in first-appearance order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitute every placeholder; a key absent from `inputs` is an error.
    pub fn render(&self, inputs: &StageInputs) -> Result<String, StageError> {
        for key in &self.keys {
            if !inputs.contains(key) {
                return Err(StageError::MissingInput(key.clone()));
            }
        }
        let rendered = PLACEHOLDER.replace_all(&self.source, |caps: &regex::Captures<'_>| {
            inputs.render(&caps[1]).unwrap_or_default()
        });
        Ok(rendered.into_owned())
    }
}
