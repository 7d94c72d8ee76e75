//! Speech in and out of a live session.
//!
//! Both directions go through ordinary model requests: an utterance is sent
//! as an inline PCM part and transcribed, and replies are read aloud by a
//! model asked for audio output with a prebuilt voice.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use serena_core::errors::GatewayError;
use serena_core::messages::{Blob, Content, Part, Role};
use serena_core::provider::{LlmProvider, LlmRequest};

/// Mime type of microphone audio sent by the client shell.
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

const TRANSCRIBE_PROMPT: &str = "Transcribe the user's speech verbatim. Reply with the \
transcript only, without quotes or commentary. Reply with nothing if there is no speech.";

const SPEAK_PROMPT: &str = "Read the user's text aloud exactly as written, in a warm and \
friendly tone.";

/// Turns one buffered utterance into text.
#[derive(Clone)]
pub struct Transcriber {
    provider: Arc<dyn LlmProvider>,
}

impl Transcriber {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    #[instrument(skip_all, fields(model = %self.provider.model(), bytes = pcm.len()))]
    pub async fn transcribe(&self, pcm: Bytes) -> Result<String, GatewayError> {
        let request = LlmRequest::new(TRANSCRIBE_PROMPT).with_content(Content::new(
            Role::User,
            vec![Part::inline(Blob::new(INPUT_AUDIO_MIME, pcm))],
        ));
        let response = self.provider.generate(&request).await?;
        let text = response.text.trim().to_string();
        debug!(chars = text.len(), "utterance transcribed");
        Ok(text)
    }
}

/// Reads replies aloud.
#[derive(Clone)]
pub struct SpeechSynthesizer {
    provider: Arc<dyn LlmProvider>,
    voice: String,
}

impl SpeechSynthesizer {
    pub fn new(provider: Arc<dyn LlmProvider>, voice: impl Into<String>) -> Self {
        Self {
            provider,
            voice: voice.into(),
        }
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    /// PCM parts for `text`. Non-audio parts in the response are dropped.
    #[instrument(skip_all, fields(voice = %self.voice, chars = text.len()))]
    pub async fn synthesize(&self, text: &str) -> Result<Vec<Blob>, GatewayError> {
        let request = LlmRequest::new(SPEAK_PROMPT)
            .with_content(Content::user_text(text))
            .with_audio_output(self.voice.clone());
        let response = self.provider.generate(&request).await?;
        Ok(response
            .inline_data
            .into_iter()
            .filter(Blob::is_pcm_audio)
            .collect())
    }
}
