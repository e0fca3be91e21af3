use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use parley_core::ids::ConversationId;

use crate::client;
use crate::handlers::{self, ApiError};
use crate::sequencer::RunningSystem;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    /// Upper bound on one delivery attempt to one subscriber.
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            max_send_queue: 256,
            send_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub system: Arc<RunningSystem>,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route(
            "/conversations",
            post(handlers::create_conversation).get(handlers::list_conversations),
        )
        .route(
            "/conversations/{id}",
            get(handlers::get_conversation)
                .patch(handlers::update_conversation)
                .delete(handlers::delete_conversation),
        )
        .route("/conversations/{id}/messages", post(handlers::append_message))
        .route("/conversations/{id}/process", post(handlers::process_conversation))
        .route("/search/attributes", post(handlers::search_by_attributes))
        .route("/search/source", post(handlers::search_by_source))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    Router::new()
        .merge(api)
        .route("/ws/{conversation_id}", get(ws_handler))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and serve until the handle is shut down.
pub async fn start(
    config: ServerConfig,
    system: Arc<RunningSystem>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        system,
        max_send_queue: config.max_send_queue,
        heartbeat_interval: config.heartbeat_interval,
    };
    let router = build_router(state, config.request_timeout);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "parley server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for the server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::error!(error = %e, "server task failed");
        }
    }
}

/// WebSocket upgrade for one conversation. Unknown conversations are refused
/// before the upgrade.
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let conversation_id = ConversationId::from_raw(conversation_id);
    if let Err(e) = state.system.orchestrator.get(&conversation_id).await {
        return ApiError::from(e).into_response();
    }
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, conversation_id, state)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, conversation_id: ConversationId, state: AppState) {
    client::handle_ws_connection(
        socket,
        conversation_id,
        Arc::clone(&state.system.groups),
        state.max_send_queue,
        state.heartbeat_interval,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_agent::{MockAgentEngine, MockReply};
    use parley_core::conversation::DEFAULT_TITLE;
    use parley_tools::{McpBackend, ToolProviderRegistry};
    use serde_json::{json, Value};

    use crate::sequencer::{Sequencer, SystemConfig};

    async fn boot(engine: MockAgentEngine) -> (ServerHandle, Arc<RunningSystem>, tempfile::TempDir) {
        boot_with(
            engine,
            ServerConfig {
                port: 0,
                ..Default::default()
            },
        )
        .await
    }

    async fn boot_with(
        engine: MockAgentEngine,
        config: ServerConfig,
    ) -> (ServerHandle, Arc<RunningSystem>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let system = Sequencer::new(
            SystemConfig::new(dir.path().join("blobs")),
            Arc::new(engine),
            Arc::new(McpBackend::default()),
            ToolProviderRegistry::default(),
        )
        .start()
        .await
        .unwrap();
        let system = Arc::new(system);

        let handle = start(config, Arc::clone(&system)).await.unwrap();
        (handle, system, dir)
    }

    fn url(handle: &ServerHandle, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", handle.port, path)
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (handle, _system, _dir) = boot(MockAgentEngine::new(Vec::new())).await;
        assert!(handle.port > 0);

        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["capabilities"], 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn health_degrades_after_shutdown_signal() {
        let (handle, system, _dir) = boot(MockAgentEngine::new(Vec::new())).await;
        system.shutdown().await;

        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 503);

        let resp = reqwest::get(url(&handle, "/conversations")).await.unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn conversation_crud_over_http() {
        let (handle, _system, _dir) = boot(MockAgentEngine::new(Vec::new())).await;
        let http = reqwest::Client::new();

        let created: Value = http
            .post(url(&handle, "/conversations"))
            .json(&json!({"system_prompt": "Be brief.", "attributes": {"source": "web"}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["title"], DEFAULT_TITLE);
        assert_eq!(created["messages"][0]["role"], "system");

        let patched: Value = http
            .patch(url(&handle, &format!("/conversations/{id}")))
            .json(&json!({"title": "Renamed", "attributes": {"pinned": true}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(patched["title"], "Renamed");
        assert_eq!(patched["attributes"]["source"], "web");
        assert_eq!(patched["attributes"]["pinned"], true);

        let listed: Vec<Value> = http
            .get(url(&handle, "/conversations?limit=10&offset=0"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let resp = http
            .get(url(&handle, "/conversations?limit=500"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = http
            .delete(url(&handle, &format!("/conversations/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = http
            .get(url(&handle, &format!("/conversations/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn append_and_process_over_http() {
        let engine = MockAgentEngine::new(vec![MockReply::text("Hello there.")])
            .with_titles(vec![MockReply::text("Greetings")]);
        let (handle, system, _dir) = boot(engine).await;
        let http = reqwest::Client::new();

        let created: Value = http
            .post(url(&handle, "/conversations"))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap();

        let processed: Value = http
            .post(url(&handle, &format!("/conversations/{id}/messages")))
            .json(&json!({"role": "user", "content": "hi", "process": true}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(processed["messages"].as_array().unwrap().len(), 2);
        assert_eq!(processed["messages"][1]["content"], "Hello there.");

        assert!(system.orchestrator.titles().drain(Duration::from_secs(5)).await);
        let fetched: Value = http
            .get(url(&handle, &format!("/conversations/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["title"], "Greetings");
        assert_eq!(fetched["attributes"]["title_generated"], true);
    }

    #[tokio::test]
    async fn agent_failure_maps_to_bad_gateway() {
        let engine = MockAgentEngine::new(vec![MockReply::Error(
            parley_core::errors::AgentError::Transport("refused".into()),
        )]);
        let (handle, _system, _dir) = boot(engine).await;
        let http = reqwest::Client::new();

        let created: Value = http
            .post(url(&handle, "/conversations"))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap();

        let resp = http
            .post(url(&handle, &format!("/conversations/{id}/process")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
    }

    #[tokio::test]
    async fn slow_request_times_out() {
        let engine = MockAgentEngine::new(vec![MockReply::delayed(
            Duration::from_secs(5),
            MockReply::text("too late"),
        )]);
        let config = ServerConfig {
            port: 0,
            request_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (handle, _system, _dir) = boot_with(engine, config).await;
        let http = reqwest::Client::new();

        let created: Value = http
            .post(url(&handle, "/conversations"))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap();

        let resp = http
            .post(url(&handle, &format!("/conversations/{id}/process")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 408);
    }

    #[tokio::test]
    async fn search_over_http() {
        let (handle, _system, _dir) = boot(MockAgentEngine::new(Vec::new())).await;
        let http = reqwest::Client::new();

        let created: Value = http
            .post(url(&handle, "/conversations"))
            .json(&json!({"attributes": {
                "team": "ops",
                "source": {"name": "slack", "channel": "C042"}
            }}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        http.post(url(&handle, "/conversations"))
            .json(&json!({"attributes": {"team": "design"}}))
            .send()
            .await
            .unwrap();

        let by_attrs: Vec<Value> = http
            .post(url(&handle, "/search/attributes"))
            .json(&json!({"team": "ops"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(by_attrs.len(), 1);
        assert_eq!(by_attrs[0]["id"], created["id"]);

        let by_source: Vec<Value> = http
            .post(url(&handle, "/search/source"))
            .json(&json!({"source_name": "slack", "properties": {"channel": "C042"}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(by_source.len(), 1);

        let resp = http
            .post(url(&handle, "/search/attributes"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn websocket_for_unknown_conversation_is_not_found() {
        let (handle, _system, _dir) = boot(MockAgentEngine::new(Vec::new())).await;
        let resp = reqwest::get(url(&handle, "/ws/conv_missing")).await.unwrap();
        assert_eq!(resp.status(), 404);
    }
}
