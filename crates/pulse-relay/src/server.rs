use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pulse_core::events::ActivityEvent;
use pulse_core::ids::SessionId;
use pulse_core::settings::RelaySettings;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ClientRegistry};
use crate::event_bridge::{self, SessionEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Relay configuration.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub max_send_queue: usize,
    /// Clients silent for longer than this are dropped.
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

impl From<&RelaySettings> for RelayConfig {
    fn from(settings: &RelaySettings) -> Self {
        let heartbeat_interval = Duration::from_secs(settings.heartbeat_interval_secs);
        Self {
            host: settings.host.clone(),
            port: settings.port,
            heartbeat_interval,
            max_send_queue: settings.max_send_queue,
            client_timeout: heartbeat_interval * 3,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("relay i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub event_tx: broadcast::Sender<SessionEvent>,
    pub heartbeat_interval: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/activity", get(ws_handler))
        .route("/sessions/{session_id}/events", post(post_event_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. The relay runs until the handle is shut down or dropped.
pub async fn start(config: RelayConfig) -> Result<RelayHandle, RelayError> {
    let registry = Arc::new(ClientRegistry::new(config.max_send_queue, config.client_timeout));
    let (event_tx, bridge_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let bridge = event_bridge::create_bridge(Arc::clone(&registry), bridge_rx);
    let cleanup = client::start_cleanup_task(Arc::clone(&registry), config.cleanup_interval);

    let state = AppState {
        registry: Arc::clone(&registry),
        event_tx: event_tx.clone(),
        heartbeat_interval: config.heartbeat_interval,
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| RelayError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "relay server stopped with error");
        }
    });

    tracing::info!(addr = %local_addr, "activity relay started");

    Ok(RelayHandle {
        local_addr,
        event_tx,
        registry,
        shutdown,
        server: Some(server),
        bridge,
        cleanup,
    })
}

/// Handle returned by `start()`; keeps the relay's tasks alive.
pub struct RelayHandle {
    local_addr: SocketAddr,
    event_tx: broadcast::Sender<SessionEvent>,
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
    server: Option<tokio::task::JoinHandle<()>>,
    bridge: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl RelayHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL of the activity endpoint, without a session.
    pub fn activity_url(&self) -> String {
        format!("ws://{}/ws/activity", self.local_addr)
    }

    /// Sender for in-process producers.
    pub fn sender(&self) -> broadcast::Sender<SessionEvent> {
        self.event_tx.clone()
    }

    /// Queue an event for a session's clients.
    pub fn publish(&self, session_id: SessionId, event: ActivityEvent) -> bool {
        self.event_tx.send((session_id, event)).is_ok()
    }

    pub fn client_count(&self) -> usize {
        self.registry.count()
    }

    pub fn session_client_count(&self, session_id: &SessionId) -> usize {
        self.registry.count_for_session(session_id)
    }

    /// Stop accepting connections and wait for the server task to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.bridge.abort();
        self.cleanup.abort();
    }
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    session_id: Option<String>,
}

/// WebSocket upgrade for `GET /ws/activity?session_id=…`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ActivityQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(session_id) = query
        .session_id
        .filter(|id| !id.is_empty())
        .map(SessionId::from_raw)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "session_id query parameter is required"})),
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: SessionId, state: AppState) {
    let (client_id, rx) = state.registry.register(session_id.clone());
    tracing::info!(client_id = %client_id, session_id = %session_id, "activity client connected");

    client::handle_ws_connection(
        socket,
        client_id,
        rx,
        state.registry,
        state.heartbeat_interval,
    )
    .await;
}

/// `POST /sessions/{session_id}/events` with one activity frame as the body.
async fn post_event_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let text = String::from_utf8_lossy(&body);
    let event = match ActivityEvent::from_frame(&text) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(reason = err.error_kind(), error = %err, "rejected posted frame");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": err.to_string(), "reason": err.error_kind()})),
            )
                .into_response();
        }
    };

    let session_id = SessionId::from_raw(session_id);
    let clients = state.registry.count_for_session(&session_id);
    if state.event_tx.send((session_id, event)).is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "relay is shutting down"})),
        )
            .into_response();
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({"accepted": true, "clients": clients})),
    )
        .into_response()
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"status": "healthy", "clients": state.registry.count()}))
}
