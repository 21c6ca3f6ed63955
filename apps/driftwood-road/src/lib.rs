//! Matchmaking server: pairs anonymous websocket clients by mode and relays
//! chat and peer-connection signaling between the two sides of each pair.

pub mod config;
pub mod liveness;
pub mod matchmaking;
pub mod relay;
pub mod telemetry;
pub mod websocket;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{config::ServerConfig, liveness::spawn_liveness_monitor, matchmaking::Matchmaker};

pub struct AppState {
    pub matchmaker: Matchmaker,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(matchmaker: Matchmaker, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            matchmaker,
            metrics,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(websocket::ws_handler))
        .route("/ws", get(websocket::ws_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the configured address and serves until ctrl-c.
pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let state = Arc::new(AppState::new(Matchmaker::new(), Some(metrics)));

    serve(listener, &config, state, shutdown_signal()).await
}

/// Serves on an already bound listener until `shutdown` resolves. The
/// liveness monitor runs for exactly as long as the server does. On shutdown
/// every open websocket is told to close and gets up to `shutdown_grace` to
/// finish its teardown.
pub async fn serve<F>(
    listener: TcpListener,
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().context("listener has no address")?;
    let monitor = spawn_liveness_monitor(state.matchmaker.clone(), config.liveness_interval);
    let matchmaker = state.matchmaker.clone();
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    info!(
        listen_addr = %local_addr,
        liveness_interval_secs = config.liveness_interval.as_secs(),
        "driftwood-road listening"
    );

    let closer = matchmaker.clone();
    let shutdown = async move {
        shutdown.await;
        closer.terminate_all();
    };
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error");
    monitor.abort();
    drain_connections(&matchmaker, config.shutdown_grace).await;
    result
}

async fn drain_connections(matchmaker: &Matchmaker, grace: Duration) {
    let open = matchmaker.terminate_all();
    if open == 0 {
        info!("graceful shutdown complete");
        return;
    }
    info!(
        open,
        grace_ms = grace.as_millis() as u64,
        "closing open websocket connections"
    );
    let drained = tokio::time::timeout(grace, async {
        while matchmaker.snapshot().connections > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    match drained {
        Ok(()) => info!("graceful shutdown complete"),
        Err(_) => warn!(
            remaining = matchmaker.snapshot().connections,
            "shutdown grace elapsed with connections still open"
        ),
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.matchmaker.snapshot())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
