use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use serena_core::provider::LlmProvider;
use serena_engine::delivery::{DisabledEmailSender, EmailSender, WebhookEmailSender};
use serena_engine::pipeline::PipelineRunner;
use serena_engine::warehouse::load_paragraphs;
use serena_engine::{
    build_registry, LiveAgent, LiveConfig, SpecialistDeps, SpecialistModels, SpeechSynthesizer,
    SqlPipelineConfig, SqliteWarehouse, Supervisor, SupervisorConfig, Transcriber,
};
use serena_llm::{GeminiImageGenerator, GeminiProvider, ReliableConfig, ReliableProvider};
use serena_server::{AppState, ArtifactOwners, ServerConfig, WarehouseApi};
use serena_settings::{ArtifactBackend, SerenaSettings};
use serena_store::{ArtifactStore, Database, InMemoryArtifactStore, InMemorySessionStore, SqliteArtifactStore};
use serena_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Serena marketing co-pilot server.
#[derive(Debug, Parser)]
#[command(name = "serena", version)]
struct Cli {
    /// Settings file; defaults to $SERENA_SETTINGS or ./serena.json.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override the listening port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.settings.unwrap_or_else(serena_settings::settings_path);
    let mut settings = serena_settings::load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(Level::INFO),
        module_levels: Vec::new(),
        json: settings.logging.json,
    });

    settings.validate().context("invalid settings")?;
    tracing::info!(settings = %path.display(), "starting Serena");

    let state = build_state(&settings)?;
    let handle = serena_server::start(state)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "Serena ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown();
    handle.wait().await;
    Ok(())
}

fn build_state(settings: &SerenaSettings) -> anyhow::Result<AppState> {
    let api_key = || SecretString::from(settings.gemini.api_key.clone());
    let timeout = Duration::from_secs(settings.gemini.request_timeout_secs);
    let retry = ReliableConfig {
        max_retries: settings.gemini.max_retries,
        ..ReliableConfig::default()
    };
    let model = |id: &str| -> anyhow::Result<Arc<dyn LlmProvider>> {
        let provider =
            GeminiProvider::with_base_url(api_key(), id, settings.gemini.base_url.clone(), timeout)
                .with_context(|| format!("model client for {id}"))?;
        Ok(Arc::new(ReliableProvider::new(provider, retry.clone())))
    };

    let sessions = Arc::new(InMemorySessionStore::new());
    let artifacts: Arc<dyn ArtifactStore> = match settings.artifacts.backend {
        ArtifactBackend::Memory => Arc::new(InMemoryArtifactStore::new()),
        ArtifactBackend::Sqlite => {
            let db = Database::open(&settings.artifacts.sqlite_path)
                .context("opening artifact database")?;
            Arc::new(SqliteArtifactStore::new(db))
        }
    };

    let wh = &settings.warehouse;
    let warehouse = Arc::new(
        SqliteWarehouse::open(&wh.path, wh.project.clone(), wh.dataset.clone())
            .context("opening warehouse")?,
    );
    let schema = load_paragraphs(&wh.metadata_path).context("loading dataset metadata")?;
    tracing::info!(chars = schema.len(), "dataset metadata loaded");

    let email: Arc<dyn EmailSender> = match &settings.email.webhook_url {
        Some(url) => Arc::new(
            WebhookEmailSender::new(url.clone(), settings.email.sender.clone(), timeout)
                .context("email webhook client")?,
        ),
        None => {
            tracing::warn!("no email webhook configured, email delivery disabled");
            Arc::new(DisabledEmailSender)
        }
    };

    let models = &settings.models;
    let deps = SpecialistDeps {
        runner: PipelineRunner::new(sessions.clone(), artifacts.clone()),
        models: SpecialistModels {
            chat: model(&models.chat)?,
            sql: model(&models.sql)?,
            visualization: model(&models.visualization)?,
            poster: model(&models.poster)?,
            email: model(&models.email)?,
        },
        images: Arc::new(
            GeminiImageGenerator::new(
                api_key(),
                models.image.clone(),
                settings.gemini.base_url.clone(),
                timeout,
            )
            .context("image model client")?,
        ),
        warehouse: warehouse.clone(),
        email,
        sql: SqlPipelineConfig::new(wh.project.clone(), wh.location.clone(), wh.dataset.clone(), schema)
            .with_refinement(settings.runtime.refinement_iterations),
    };
    let registry = build_registry(&deps).context("building specialist tools")?;
    tracing::info!(tools = ?registry.names(), "tools registered");

    let runtime = &settings.runtime;
    let supervisor = Supervisor::new(model(&models.supervisor)?, Arc::new(registry), sessions)
        .with_config(SupervisorConfig {
            tool_timeout: Duration::from_secs(runtime.tool_timeout_secs),
            history_limit: runtime.history_limit,
        })
        .with_speech(SpeechSynthesizer::new(
            model(&models.speech)?,
            runtime.voice_name.clone(),
        ));
    let live = LiveAgent::new(Arc::new(supervisor))
        .with_transcriber(Transcriber::new(model(&models.transcription)?))
        .with_config(LiveConfig {
            audio_flush: Duration::from_millis(runtime.audio_flush_ms),
            queue: settings.server.max_send_queue,
        });

    let server = &settings.server;
    let static_dir = server.static_dir.is_dir().then(|| server.static_dir.clone());
    if static_dir.is_none() {
        tracing::warn!(dir = %server.static_dir.display(), "static client directory missing");
    }

    Ok(AppState::new(
        ServerConfig {
            host: server.host.clone(),
            port: server.port,
            static_dir,
            max_send_queue: server.max_send_queue,
        },
        Arc::new(live),
        artifacts,
        settings.artifacts.owners.clone().into_iter().collect::<ArtifactOwners>(),
        WarehouseApi {
            warehouse,
            max_results: wh.max_results,
        },
    ))
}
