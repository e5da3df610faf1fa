//! `RelayServer`: Axum HTTP + WebSocket server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use sozvon_auth::IdentityProvider;
use sozvon_core::health::{self, HealthResponse};
use sozvon_core::{ErrorBody, ShutdownCoordinator};
use sozvon_settings::DuplicateSessionPolicy;
use sozvon_store::ChatStore;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::api;
use crate::config::RelayConfig;
use crate::errors::ApiError;
use crate::router::MessageRouter;
use crate::websocket::hub::Hub;
use crate::websocket::session::{self, SessionContext};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// What every socket session gets.
    pub session: SessionContext,
    /// Bearer token validation.
    pub identity: Arc<dyn IdentityProvider>,
    /// Shutdown coordinator; sessions are tracked on it.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus render handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// Duplicate-session policy, checked before upgrading.
    pub policy: DuplicateSessionPolicy,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    /// The chat store.
    pub fn store(&self) -> &Arc<dyn ChatStore> {
        self.session.router.store()
    }

    /// The hub handle.
    pub fn hub(&self) -> &Hub {
        self.session.router.hub()
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    state: AppState,
}

impl RelayServer {
    /// Create a server and start its hub dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn ChatStore>,
        identity: Arc<dyn IdentityProvider>,
        metrics: PrometheusHandle,
    ) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let (hub, hub_task) = Hub::spawn(config.duplicate_session, config.hub_capacity);
        let _ = shutdown.spawn(async move {
            if let Err(e) = hub_task.await {
                error!(error = %e, "hub dispatcher panicked");
            }
        });
        let state = AppState {
            session: SessionContext {
                router: MessageRouter::new(store, hub),
                socket: config.socket.clone(),
                shutdown: shutdown.token(),
            },
            identity,
            shutdown,
            metrics,
            policy: config.duplicate_session,
            start_time: Instant::now(),
        };
        Self { config, state }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/chats", get(api::list_chats))
            .route("/chats/create", post(api::create_chat))
            .route("/chats/{id}/messages", get(api::chat_messages))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "relay server failed");
            }
        });
        info!(%addr, "relay listening");
        Ok((addr, handle))
    }

    /// Stop accepting, close every connection and wait (bounded) for the
    /// sessions to finish.
    pub async fn shutdown_gracefully(&self) -> bool {
        info!("relay shutting down");
        self.state.shutdown.shutdown();
        self.state.hub().shutdown().await;
        self.state
            .shutdown
            .graceful_shutdown(self.config.shutdown_timeout)
            .await
    }

    /// The hub handle.
    pub fn hub(&self) -> &Hub {
        self.state.hub()
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// Token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// `/ws` query string.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Bearer token; browsers cannot set headers on upgrade requests.
    pub token: Option<String>,
}

/// GET /ws
///
/// The token is checked before the upgrade so that a bad credential gets a
/// plain 401 and never a socket.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));
    let Some(token) = token else {
        debug!("upgrade without token");
        return ApiError::Unauthorized("missing token".into()).into_response();
    };
    let identity = match state.identity.validate_token(token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(kind = e.kind(), "upgrade with rejected token");
            return ApiError::from(e).into_response();
        }
    };

    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if state.policy == DuplicateSessionPolicy::RejectNew && state.hub().is_online(&identity).await
    {
        info!(%identity, "duplicate session refused");
        let body = ErrorBody {
            error: "duplicate_session".into(),
            message: "already connected".into(),
        };
        return (StatusCode::CONFLICT, Json(body)).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let ctx = state.session.clone();
    let shutdown = Arc::clone(&state.shutdown);
    ws.max_message_size(ctx.socket.max_message_size)
        .on_upgrade(move |socket| shutdown.track(session::serve(socket, identity, ctx)))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.hub().connection_count().await;
    Json(health::health_check("relay", state.start_time, connections))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}
