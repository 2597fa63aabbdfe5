//! mesh-road: the room presence service for full-mesh calls.
//!
//! Holds the authoritative set of peers per room, streams presence changes
//! over websockets and serves a polling snapshot for clients that cannot
//! keep a socket open. Media never passes through here.

pub mod auth;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod monitor;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::registry::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub verifier: Arc<TokenVerifier>,
    pub metrics: Option<PrometheusHandle>,
    pub send_timeout: Duration,
}

impl AppState {
    pub fn from_config(config: &Config, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(
                Arc::new(config.directory()),
                config.subscriber_buffer,
            )),
            verifier: Arc::new(config.verifier()),
            metrics,
            send_timeout: config.send_timeout,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/rooms/:room_id/peers",
            post(handlers::join_room).get(handlers::list_peers),
        )
        .route("/rooms/:room_id/peers/:peer_id", delete(handlers::leave_room))
        .route(
            "/rooms/:room_id/peers/:peer_id/heartbeat",
            post(handlers::heartbeat),
        )
        .route("/rooms/:room_id/presence", get(presence::presence_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves `router(state)` on `listener` with the keepalive and liveness
/// tasks running until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    config: &Config,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let keepalive = monitor::spawn_keepalive(state.registry.clone(), config.ping_interval);
    let liveness = monitor::spawn_liveness_monitor(
        state.registry.clone(),
        config.sweep_interval,
        config.liveness_timeout,
    );
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    keepalive.abort();
    liveness.abort();
    result
}
