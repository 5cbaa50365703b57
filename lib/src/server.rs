//! HTTP and WebSocket server
//!
//! Control-plane routes under `/api/sessions`, a `/health` probe, and the
//! streaming plane as a WebSocket on `/` and `/ws`.

use axum::body::Bytes;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::api::{HealthStatus, SessionApi, SessionInfo};
use crate::config::AgentConfig;
use crate::confirmation::ConfirmationBroker;
use crate::connection::{handle_socket, ConnectionRegistry};
use crate::dispatcher::StreamDispatcher;
use crate::error::{AgentError, Result};
use crate::provider::{ConfiguredProviderFactory, ProviderFactory};
use crate::session::{MessageRole, SessionStore};
use crate::tools::ToolRegistry;

/// Shared handles injected into every route and connection
#[derive(Clone)]
pub struct AppState {
    pub api: Arc<SessionApi>,
    pub dispatcher: Arc<StreamDispatcher>,
    pub broker: Arc<ConfirmationBroker>,
    pub sessions: Arc<SessionStore>,
    pub connections: Arc<ConnectionRegistry>,
}

impl AppState {
    pub fn new(config: &AgentConfig, providers: Arc<dyn ProviderFactory>) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let broker = Arc::new(ConfirmationBroker::from_config(&config.confirmation));
        let tools = Arc::new(ToolRegistry::with_builtins(&config.tools));

        Self {
            api: Arc::new(SessionApi::new(
                Arc::clone(&sessions),
                providers,
                Arc::clone(&tools),
            )),
            dispatcher: Arc::new(StreamDispatcher::new(
                Arc::clone(&sessions),
                Arc::clone(&broker),
                tools,
            )),
            broker,
            sessions,
            connections: Arc::new(ConnectionRegistry::new()),
        }
    }
}

/// The Ruby agent server
pub struct RubyServer {
    config: AgentConfig,
    state: AppState,
}

impl RubyServer {
    /// Server whose sessions get providers built from `config.provider`
    pub fn new(config: AgentConfig) -> Self {
        let factory = Arc::new(ConfiguredProviderFactory::new(config.provider.clone()));
        Self::with_provider_factory(config, factory)
    }

    pub fn with_provider_factory(config: AgentConfig, providers: Arc<dyn ProviderFactory>) -> Self {
        let state = AppState::new(&config, providers);
        Self { config, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!("Ruby agent server listening on {}", addr);
        info!("WebSocket endpoint: ws://{}/ws", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!(
            sessions = self.state.sessions.len(),
            "Server shutdown complete"
        );
        Ok(())
    }

    /// Bind the configured address and serve until Ctrl+C or SIGTERM
    pub async fn start(&self) -> Result<()> {
        let address = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&address).await?;
        self.serve_with_shutdown(listener, async {
            if let Err(e) = shutdown_signal().await {
                warn!("Failed to install shutdown handler: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

/// Wait for a shutdown signal
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(AgentError::Io)?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .map_err(AgentError::Io)?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map_err(AgentError::Io)?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route(
            "/api/sessions/{id}/messages",
            get(list_messages).post(append_message),
        )
        .with_state(state)
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        (status, Json(json!({ "error": self.client_message() }))).into_response()
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    let connections = state.connections.len().await;
    Json(state.api.health(connections))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    #[serde(default)]
    system_prompt: Option<String>,
}

async fn create_session(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    // An absent or unreadable body just means no system prompt
    let body: CreateSessionBody = if body.is_empty() {
        CreateSessionBody::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|e| {
            tracing::debug!("Ignoring unreadable create-session body: {}", e);
            CreateSessionBody::default()
        })
    };

    let session_id = state.api.create_session(body.system_prompt)?;
    Ok(Json(json!({ "sessionId": session_id })))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<SessionInfo>> {
    Ok(Json(state.api.get_session(&id)?))
}

async fn list_messages(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let messages = state.api.list_messages(&id)?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
struct AppendMessageBody {
    role: MessageRole,
    content: String,
}

async fn append_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AppendMessageBody>,
) -> Result<Json<Value>> {
    state.api.append_message(&id, body.role, body.content)?;
    Ok(Json(json!({ "success": true })))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let success = state.api.delete_session(&id);
    Json(json!({ "success": success }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo_provider::EchoProvider;
    use crate::provider::SharedProviderFactory;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        let server = RubyServer::with_provider_factory(
            AgentConfig::default(),
            Arc::new(SharedProviderFactory(Arc::new(EchoProvider::immediate()))),
        );
        server.router()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_http() {
        let app = app();

        let (status, body) = send(&app, post_json("/api/sessions", json!({"systemPrompt": "be terse"}))).await;
        assert_eq!(status, StatusCode::OK);
        let id = body["sessionId"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            post_json(
                &format!("/api/sessions/{}/messages", id),
                json!({"role": "user", "content": "hello"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let request = Request::get(format!("/api/sessions/{}/messages", id))
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(&app, request).await;
        assert_eq!(body, json!({"messages": [{"role": "user", "content": "hello"}]}));

        let request = Request::get(format!("/api/sessions/{}", id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["systemPrompt"], json!("be terse"));
        assert_eq!(body["messageCount"], json!(1));
        assert_eq!(body["streaming"], json!(false));

        for expected in [true, false] {
            let request = Request::delete(format!("/api/sessions/{}", id))
                .body(Body::empty())
                .unwrap();
            let (status, body) = send(&app, request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({"success": expected}));
        }
    }

    #[tokio::test]
    async fn test_create_session_without_body() {
        let app = app();
        let request = Request::post("/api/sessions").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["sessionId"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let app = app();

        let request = Request::get("/api/sessions/missing/messages")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "session not found"}));

        let (status, _) = send(
            &app,
            post_json("/api/sessions/missing/messages", json!({"role": "user", "content": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_append_is_client_error() {
        let app = app();
        let (_, body) = send(&app, post_json("/api/sessions", json!({}))).await;
        let id = body["sessionId"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            post_json(&format!("/api/sessions/{}/messages", id), json!({"role": "robot"})),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["sessions"], json!(0));
    }
}
