//! Settings schema with compiled defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerenaSettings {
    pub server: ServerSettings,
    pub gemini: GeminiSettings,
    pub models: ModelSettings,
    pub warehouse: WarehouseSettings,
    pub email: EmailSettings,
    pub artifacts: ArtifactSettings,
    pub runtime: RuntimeSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Directory holding `index.html` and client assets.
    pub static_dir: PathBuf,
    /// Outbound frame queue per connection.
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            static_dir: PathBuf::from("static"),
            max_send_queue: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    /// API key; usually supplied through `GOOGLE_API_KEY`.
    pub api_key: String,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            request_timeout_secs: 120,
            max_retries: 2,
        }
    }
}

/// Model identifiers per agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub supervisor: String,
    pub chat: String,
    pub sql: String,
    pub visualization: String,
    pub poster: String,
    pub email: String,
    pub image: String,
    pub speech: String,
    pub transcription: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let flash = "gemini-2.0-flash".to_string();
        Self {
            supervisor: flash.clone(),
            chat: flash.clone(),
            sql: flash.clone(),
            visualization: flash.clone(),
            poster: flash.clone(),
            email: flash.clone(),
            image: "imagen-3.0-generate-002".into(),
            speech: "gemini-2.5-flash-preview-tts".into(),
            transcription: flash,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseSettings {
    pub project: String,
    pub location: String,
    pub dataset: String,
    /// SQLite database holding the dataset tables.
    pub path: PathBuf,
    /// Dataset description JSON used to ground SQL generation.
    pub metadata_path: PathBuf,
    pub max_results: usize,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            project: "hackathon-agents".into(),
            location: "us-central1".into(),
            dataset: "StyleHub".into(),
            path: PathBuf::from("data/stylehub.db"),
            metadata_path: PathBuf::from("data/dataset_info.json"),
            max_results: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    /// Delivery webhook. Email sending fails at the send stage when unset.
    pub webhook_url: Option<String>,
    pub sender: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            sender: "serena@stylehub.example".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    pub backend: ArtifactBackend,
    pub sqlite_path: PathBuf,
    /// App name → synthetic user id used when resolving artifact URLs.
    pub owners: BTreeMap<String, String>,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        let owners = ["visualization_app", "poster_app"]
            .into_iter()
            .map(|app| (app.to_string(), "dev_user_01".to_string()))
            .collect();
        Self {
            backend: ArtifactBackend::Memory,
            sqlite_path: PathBuf::from("data/artifacts.db"),
            owners,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Deadline for one tool invocation.
    pub tool_timeout_secs: u64,
    /// Silence gap that ends a spoken utterance.
    pub audio_flush_ms: u64,
    pub voice_name: String,
    /// 0 runs the fixed SQL pipeline; N > 0 wraps review in a critic loop.
    pub refinement_iterations: u32,
    /// Conversation turns kept in the supervisor prompt.
    pub history_limit: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 120,
            audio_flush_ms: 800,
            voice_name: "Kore".into(),
            refinement_iterations: 0,
            history_limit: 40,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
        }
    }
}
