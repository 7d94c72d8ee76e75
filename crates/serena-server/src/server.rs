use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use serena_core::ids::SessionId;
use serena_engine::{LiveAgent, LiveOptions};
use serena_store::ArtifactStore;

use crate::artifacts::{get_artifact, ArtifactOwners};
use crate::connection::handle_socket;
use crate::warehouse::{list_tables, run_query, WarehouseApi};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Client shell directory; served at `/` and `/static`.
    pub static_dir: Option<PathBuf>,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            static_dir: None,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub live: Arc<LiveAgent>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub owners: Arc<ArtifactOwners>,
    pub warehouse: WarehouseApi,
    /// Cancelled on shutdown; every connection runs under a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        live: Arc<LiveAgent>,
        artifacts: Arc<dyn ArtifactStore>,
        owners: ArtifactOwners,
        warehouse: WarehouseApi,
    ) -> Self {
        Self {
            config: Arc::new(config),
            live,
            artifacts,
            owners: Arc::new(owners),
            warehouse,
            shutdown: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WsParams {
    is_audio: bool,
    agent_wants_audio_output: bool,
}

impl WsParams {
    /// Audio clients get spoken replies; text clients can ask for them too.
    fn options(&self) -> LiveOptions {
        LiveOptions {
            audio_output: self.is_audio || self.agent_wants_audio_output,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/ws/{session_id}", get(ws_handler))
        .route("/artifacts/{app_name}/{session_id}/{filename}", get(get_artifact))
        .route("/health", get(health_handler))
        .route("/v1/bigquery/list_tables", get(list_tables))
        .route("/v1/bigquery/query", post(run_query));

    if let Some(dir) = &state.config.static_dir {
        router = router
            .route_service("/", ServeFile::new(dir.join("index.html")))
            .nest_service("/static", ServeDir::new(dir));
    }

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns once the listener is up.
pub async fn start(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    let shutdown = state.shutdown.clone();

    let router = build_router(state);
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "server stopped with error");
            }
        }
    });

    info!(port = local_addr.port(), "Serena server started");
    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and cancel the live ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn wait(self) {
        if let Err(e) = self.server.await {
            tracing::error!(error = %e, "server task failed");
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    debug!(%session_id, is_audio = params.is_audio, "websocket upgrade");
    let options = params.options();
    let session_id = SessionId::from_raw(session_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, options))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use rusqlite::Connection;
    use serde_json::Value;
    use serena_core::artifacts::Artifact;
    use serena_core::ids::SessionKey;
    use serena_engine::{SqliteWarehouse, Supervisor, ToolRegistry};
    use serena_llm::mock::MockProvider;
    use serena_store::{InMemoryArtifactStore, InMemorySessionStore};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn state(dir: &TempDir, artifacts: Arc<InMemoryArtifactStore>) -> AppState {
        let path = dir.path().join("shop.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, country TEXT);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER);
             INSERT INTO users VALUES (1, 'PT'), (2, 'SE');",
        )
        .unwrap();
        drop(conn);
        let warehouse = SqliteWarehouse::open(&path, "stylehub-prod", "StyleHub").unwrap();

        let supervisor = Supervisor::new(
            Arc::new(MockProvider::new(vec![])),
            Arc::new(ToolRegistry::new()),
            Arc::new(InMemorySessionStore::new()),
        );
        AppState::new(
            ServerConfig::default(),
            Arc::new(LiveAgent::new(Arc::new(supervisor))),
            artifacts,
            [("visualization_app".to_string(), "dev_user_01".to_string())]
                .into_iter()
                .collect(),
            WarehouseApi {
                warehouse: Arc::new(warehouse),
                max_results: 50,
            },
        )
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let mime = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, mime, body.to_vec())
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let dir = TempDir::new().unwrap();
        let router = build_router(state(&dir, Arc::new(InMemoryArtifactStore::new())));
        let (status, _, body) = get(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn artifact_is_served_with_its_mime_type() {
        let dir = TempDir::new().unwrap();
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let key = SessionKey::new("visualization_app", "dev_user_01", SessionId::from_raw("sess_7"));
        artifacts
            .save(&key, "plot.svg", Artifact::new("image/svg+xml", b"<svg/>".to_vec()))
            .await
            .unwrap();
        let router = build_router(state(&dir, artifacts));

        let (status, mime, body) = get(router, "/artifacts/visualization_app/sess_7/plot.svg").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(mime.as_deref(), Some("image/svg+xml"));
        assert_eq!(body, b"<svg/>");
    }

    #[tokio::test]
    async fn artifact_lookups_that_miss_are_404() {
        let dir = TempDir::new().unwrap();
        let router = build_router(state(&dir, Arc::new(InMemoryArtifactStore::new())));

        let (status, _, _) = get(router.clone(), "/artifacts/unknown_app/sess_7/plot.svg").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, body) = get(router, "/artifacts/visualization_app/sess_7/plot.svg").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["detail"].as_str().unwrap().contains("plot.svg"));
    }

    #[tokio::test]
    async fn list_tables_defaults_to_configured_dataset() {
        let dir = TempDir::new().unwrap();
        let router = build_router(state(&dir, Arc::new(InMemoryArtifactStore::new())));

        let (status, _, body) = get(router.clone(), "/v1/bigquery/list_tables").await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["dataset_id"], "StyleHub");
        assert_eq!(body["tables"], json!(["orders", "users"]));

        let (status, _, _) = get(
            router,
            "/v1/bigquery/list_tables?dataset_project=other&dataset_id=Nope",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn query_runs_reads_and_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let router = build_router(state(&dir, Arc::new(InMemoryArtifactStore::new())));
        let post = |sql: &str| {
            Request::builder()
                .method("POST")
                .uri("/v1/bigquery/query")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "query": sql }).to_string()))
                .unwrap()
        };

        let resp = router
            .clone()
            .oneshot(post("SELECT country FROM users ORDER BY id"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value =
            serde_json::from_slice(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(body["row_count"], 2);
        assert_eq!(body["rows"][0]["data"]["country"], "PT");

        let resp = router.oneshot(post("DELETE FROM users")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value =
            serde_json::from_slice(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert!(body["detail"].as_str().unwrap().contains("rejected"));
    }

    #[test]
    fn audio_clients_get_spoken_replies() {
        let parse = |q: &str| -> WsParams {
            Query::<WsParams>::try_from_uri(&format!("/ws/s1?{q}").parse().unwrap())
                .unwrap()
                .0
        };
        assert!(parse("is_audio=true").options().audio_output);
        assert!(parse("agent_wants_audio_output=true").options().audio_output);
        assert!(parse("is_audio=true&agent_wants_audio_output=false").options().audio_output);
        assert!(!parse("is_audio=false").options().audio_output);
        assert!(!parse("").options().audio_output);
    }
}
