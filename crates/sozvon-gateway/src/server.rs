//! `GatewayServer`: WebSocket tunnels, reverse proxy, health.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use sozvon_auth::IdentityProvider;
use sozvon_core::health::{self, HealthResponse};
use sozvon_core::{ErrorBody, ShutdownCoordinator};
use sozvon_settings::DuplicateSessionPolicy;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::errors::Result;
use crate::proxy::ProxyClient;
use crate::tunnel::{EdgeContext, EdgeSession, TunnelRegistry, parse_relay_url};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// What every edge session gets.
    pub edge: EdgeContext,
    /// Bearer token validation.
    pub identity: Arc<dyn IdentityProvider>,
    /// HTTP upstream client.
    pub proxy: ProxyClient,
    /// Upstream base URLs and socket settings.
    pub config: Arc<GatewayConfig>,
    /// Shutdown coordinator; tunnels are tracked on it.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus render handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
}

/// The edge gateway.
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    /// Create a gateway. Fails on an unusable relay URL.
    pub fn new(
        config: GatewayConfig,
        identity: Arc<dyn IdentityProvider>,
        metrics: PrometheusHandle,
    ) -> Result<Self> {
        let relay_url = parse_relay_url(&config.relay_url)?;
        let proxy = ProxyClient::new(config.proxy_timeout)?;
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let edge = EdgeContext {
            registry: Arc::new(TunnelRegistry::new(config.duplicate_session)),
            relay_url,
            dial_timeout: config.dial_timeout,
            socket: config.socket.clone(),
            shutdown: shutdown.token(),
        };
        Ok(Self {
            state: AppState {
                edge,
                identity,
                proxy,
                config: Arc::new(config),
                shutdown,
                metrics,
                start_time: Instant::now(),
            },
        })
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/auth/{*rest}", any(proxy_auth))
            .route("/users/{*rest}", any(proxy_users))
            .route("/chats", any(proxy_chats))
            .route("/chats/{*rest}", any(proxy_chats))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen(&self) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "gateway server failed");
            }
        });
        info!(%addr, relay = %self.state.edge.relay_url, "gateway listening");
        Ok((addr, handle))
    }

    /// Close every tunnel and wait (bounded) for them to finish.
    pub async fn shutdown_gracefully(&self) -> bool {
        info!("gateway shutting down");
        self.state.shutdown.shutdown();
        self.state.edge.registry.close_all();
        self.state
            .shutdown
            .graceful_shutdown(self.state.config.shutdown_timeout)
            .await
    }

    /// Live tunnels.
    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.state.edge.registry
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }
}

/// `/ws` query string.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Bearer token, forwarded unchanged to the relay.
    pub token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = ErrorBody {
        error: code.into(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers).map(str::to_owned));
    let Some(token) = token else {
        debug!("upgrade without token");
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized", "Token required");
    };
    let identity = match state.identity.validate_token(&token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(kind = e.kind(), "upgrade with rejected token");
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid token");
        }
    };

    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let registry = &state.edge.registry;
    if registry.policy() == DuplicateSessionPolicy::RejectNew && registry.contains(&identity) {
        info!(%identity, "duplicate tunnel refused");
        return error_response(
            StatusCode::CONFLICT,
            "duplicate_session",
            "User already connected",
        );
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    // Admission applies the duplicate-session policy, so an older tunnel
    // is closed before the client gets its 101.
    let Some(session) = EdgeSession::admit(identity, state.edge.clone()) else {
        return error_response(
            StatusCode::CONFLICT,
            "duplicate_session",
            "User already connected",
        );
    };
    let tunnel = Arc::clone(session.tunnel());
    let registry = Arc::clone(&state.edge.registry);
    let shutdown = Arc::clone(&state.shutdown);
    ws.max_message_size(state.edge.socket.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(error = %e, tunnel_id = tunnel.id(), "client upgrade failed");
            let _ = tunnel.close();
            let _ = registry.unregister(&tunnel);
        })
        .on_upgrade(move |socket| shutdown.track(session.run(socket, token)))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let tunnels = state.edge.registry.count();
    Json(health::health_check("gateway", state.start_time, tunnels))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn proxy_auth(State(state): State<AppState>, req: Request) -> Response {
    state
        .proxy
        .forward("auth", &state.config.auth_service_url, req)
        .await
}

async fn proxy_users(State(state): State<AppState>, req: Request) -> Response {
    state
        .proxy
        .forward("users", &state.config.user_service_url, req)
        .await
}

async fn proxy_chats(State(state): State<AppState>, req: Request) -> Response {
    state
        .proxy
        .forward("chats", &state.config.chat_service_url, req)
        .await
}
