//! Gateway HTTP + WebSocket server (single port).

use crate::auth::TokenVerifier;
use crate::broadcast::BroadcastRegistry;
use crate::config::{self, Config};
use crate::gateway::connection;
use crate::ratelimit::{MemoryCounterStore, RateLimiter};
use crate::store::{MemorySessionStore, SessionStore};
use crate::upstream::UpstreamClient;
use crate::users::MemoryUserDirectory;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Shared state for the gateway: config plus the injected collaborators.
/// The gateway itself holds no locks; all cross-connection state lives
/// behind the collaborators.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub verifier: Arc<TokenVerifier>,
    pub limiter: RateLimiter,
    pub store: Arc<dyn SessionStore>,
    pub events: Arc<BroadcastRegistry>,
    pub upstream: UpstreamClient,
    /// Fired once at graceful shutdown; connections close on receipt.
    pub shutdown: broadcast::Sender<()>,
}

impl GatewayState {
    /// Wire up the default collaborators from config: in-memory user
    /// directory, counter store, and session store.
    pub fn from_config(config: Config) -> Result<Self> {
        let secret = config::resolve_jwt_secret(&config)
            .context("auth secret not configured (set auth.secret or RELAY_JWT_SECRET)")?;
        let directory = Arc::new(MemoryUserDirectory::from_entries(&config.auth.users));
        let events = Arc::new(BroadcastRegistry::new());
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            verifier: Arc::new(TokenVerifier::new(&secret, directory)),
            limiter: RateLimiter::new(
                Arc::new(MemoryCounterStore::new()),
                Duration::from_secs(config.limits.window_secs),
                config.limits.max_connections,
            ),
            store: Arc::new(MemorySessionStore::new(events.clone())),
            events,
            upstream: UpstreamClient::new(&config.upstream)?,
            shutdown,
            config: Arc::new(config),
        })
    }
}

/// Build the gateway router: health on `/`, WebSocket upgrade on `/ws`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// Blocks until shutdown (Ctrl+C or SIGTERM), then broadcasts the shutdown
/// signal so open connections close cleanly.
pub async fn run_gateway(config: Config) -> Result<()> {
    let state = GatewayState::from_config(config)?;
    let bind_addr = format!("{}:{}", state.config.gateway.bind, state.config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let shutdown = state.shutdown.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await
    .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or
/// SIGTERM). Broadcasts the shutdown signal to open connections first.
async fn shutdown_signal(shutdown: broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
    let _ = shutdown.send(());
}

/// GET / returns a simple health JSON (for probes), including an
/// out-of-band upstream liveness check.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "upstreamHealthy": state.upstream.health().await,
    }))
}

/// Connect params from the query string. Both are required for auth, but
/// absence is reported over the opened socket, not as an HTTP rejection.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
    pub auth_type: Option<String>,
}

/// GET /ws upgrades to WebSocket and hands the socket to the per-connection
/// task.
async fn ws_handler(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let source = addr.ip().to_string();
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state, source, query))
}
