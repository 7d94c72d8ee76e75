//! End-to-end WebSocket tests against a server bound to port 0.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use serena_core::artifacts::Artifact;
use serena_core::ids::{SessionId, SessionKey};
use serena_core::tools::{Tool, ToolContext, ToolError, ToolKind, ToolResult};
use serena_engine::{LiveAgent, SqliteWarehouse, Supervisor, ToolRegistry};
use serena_llm::mock::{MockProvider, MockResponse};
use serena_server::{start, AppState, ArtifactOwners, ServerConfig, ServerHandle, WarehouseApi};
use serena_store::{ArtifactStore, InMemoryArtifactStore, InMemorySessionStore};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn serve(dir: &TempDir, router: MockProvider) -> ServerHandle {
    serve_with(
        dir,
        router,
        ToolRegistry::new(),
        Arc::new(InMemoryArtifactStore::new()),
        ArtifactOwners::default(),
    )
    .await
}

async fn serve_with(
    dir: &TempDir,
    router: MockProvider,
    registry: ToolRegistry,
    artifacts: Arc<InMemoryArtifactStore>,
    owners: ArtifactOwners,
) -> ServerHandle {
    let path = dir.path().join("shop.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, country TEXT);")
        .unwrap();
    drop(conn);
    let warehouse = SqliteWarehouse::open(&path, "stylehub-prod", "StyleHub").unwrap();

    let supervisor = Supervisor::new(
        Arc::new(router),
        Arc::new(registry),
        Arc::new(InMemorySessionStore::new()),
    );
    let state = AppState::new(
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        },
        Arc::new(LiveAgent::new(Arc::new(supervisor))),
        artifacts,
        owners,
        WarehouseApi {
            warehouse: Arc::new(warehouse),
            max_results: 50,
        },
    );
    start(state).await.unwrap()
}

async fn connect(handle: &ServerHandle, session: &str) -> Client {
    let url = format!(
        "ws://127.0.0.1:{}/ws/{session}?is_audio=false&agent_wants_audio_output=false",
        handle.port
    );
    let (ws, _) = tokio::time::timeout(WAIT, connect_async(url))
        .await
        .expect("connect timed out")
        .unwrap();
    ws
}

async fn send_text(ws: &mut Client, text: &str) {
    let frame = json!({"mime_type": "text/plain", "data": text, "role": "user"});
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn next_frame(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("no frame within timeout")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Frames up to and including the next status frame.
async fn frames_until_status(ws: &mut Client) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(ws).await;
        let done = frame.get("turn_complete").is_some();
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

#[tokio::test]
async fn text_turn_streams_model_frames_then_status() {
    let dir = TempDir::new().unwrap();
    let handle = serve(
        &dir,
        MockProvider::new(vec![MockResponse::text_chunks(&["Hello, ", "I'm Serena."])]),
    )
    .await;
    let mut ws = connect(&handle, "sess_it_1").await;

    send_text(&mut ws, "hi").await;
    let frames = frames_until_status(&mut ws).await;

    let text: String = frames
        .iter()
        .filter(|f| f["role"] == "model")
        .filter_map(|f| f["data"].as_str())
        .collect();
    assert_eq!(text, "Hello, I'm Serena.");
    assert_eq!(
        frames.last().unwrap(),
        &json!({"turn_complete": true, "interrupted": false})
    );

    handle.shutdown();
}

#[tokio::test]
async fn unsupported_mime_gets_error_frame_and_connection_survives() {
    let dir = TempDir::new().unwrap();
    let handle = serve(
        &dir,
        MockProvider::new(vec![MockResponse::text("Still here.")]),
    )
    .await;
    let mut ws = connect(&handle, "sess_it_2").await;

    let frame = json!({"mime_type": "video/mp4", "data": "AAAA"});
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    let error = next_frame(&mut ws).await;
    assert_eq!(
        error,
        json!({"error": "Mime type not supported: video/mp4", "role": "system"})
    );

    send_text(&mut ws, "are you there?").await;
    let frames = frames_until_status(&mut ws).await;
    assert!(frames
        .iter()
        .any(|f| f["role"] == "model" && f["data"] == "Still here."));
    assert!(!frames.iter().any(|f| f.get("error").is_some()));

    handle.shutdown();
}

async fn http_get(handle: &ServerHandle, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = TcpStream::connect(("127.0.0.1", handle.port)).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

const CHART_SVG: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\"></svg>";

/// Stores a chart the way the visualization specialist does and reports it.
struct ChartTool {
    artifacts: Arc<InMemoryArtifactStore>,
}

#[async_trait]
impl Tool for ChartTool {
    fn name(&self) -> &str {
        "call_visualization_agent"
    }

    fn description(&self) -> &str {
        "chart"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Visualization
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let scope = SessionKey::new(
            "visualization_app",
            "dev_user_01",
            SessionId::from_raw("sess_chart"),
        );
        self.artifacts
            .save(&scope, "plot.svg", Artifact::new("image/svg+xml", CHART_SVG.as_bytes().to_vec()))
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let payload: Map<String, Value> = json!({
            "app_name": "visualization_app",
            "session_id": "sess_chart",
            "artifact_saved": "plot.svg",
            "artifact_size_bytes": CHART_SVG.len()
        })
        .as_object()
        .cloned()
        .unwrap();
        Ok(ToolResult::ok(payload))
    }
}

#[tokio::test]
async fn tool_artifact_reaches_client_as_fetchable_url() {
    let dir = TempDir::new().unwrap();
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ChartTool {
        artifacts: artifacts.clone(),
    }));
    let owners: ArtifactOwners = [("visualization_app".to_string(), "dev_user_01".to_string())]
        .into_iter()
        .collect();
    let handle = serve_with(
        &dir,
        MockProvider::new(vec![MockResponse::function_call(
            "call_visualization_agent",
            json!({"request": "chart users by country"}),
        )]),
        registry,
        artifacts,
        owners,
    )
    .await;
    let mut ws = connect(&handle, "sess_it_3").await;

    send_text(&mut ws, "chart users by country").await;
    let frames = frames_until_status(&mut ws).await;

    let running = json!({
        "mime_type": "text/plain",
        "data": "Running call_visualization_agent...",
        "role": "system"
    });
    let link = json!({
        "mime_type": "text/uri-list",
        "data": "/artifacts/visualization_app/sess_chart/plot.svg",
        "role": "model"
    });
    let running_at = frames.iter().position(|f| f == &running).expect("tool call notice");
    let link_at = frames.iter().position(|f| f == &link).expect("artifact link");
    assert!(running_at < link_at);
    assert_eq!(
        frames.last().unwrap(),
        &json!({"turn_complete": true, "interrupted": false})
    );

    let response = http_get(&handle, "/artifacts/visualization_app/sess_chart/plot.svg").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("image/svg+xml"));
    assert!(response.ends_with(CHART_SVG));

    handle.shutdown();
}

#[tokio::test]
async fn health_over_http() {
    let dir = TempDir::new().unwrap();
    let handle = serve(&dir, MockProvider::new(vec![])).await;

    let response = http_get(&handle, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#"{"status":"healthy"}"#));

    handle.shutdown();
}
