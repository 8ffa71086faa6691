//! API server setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::routes;
use crate::broadcast::StreamBroadcaster;
use crate::config::AppConfig;
use crate::dbal::DbalClient;
use crate::error::{Error, Result};
use crate::jobs::JobQueue;
use crate::metrics::{HealthChecker, PrometheusExporter};
use crate::plugin::PluginRegistry;
use crate::radio::RadioEngine;
use crate::tv::TvEngine;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub config: Arc<AppConfig>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<PluginRegistry>,
    pub radio: Arc<RadioEngine>,
    pub tv: Arc<TvEngine>,
    pub broadcaster: Arc<StreamBroadcaster>,
    pub dbal: DbalClient,
    pub exporter: Arc<PrometheusExporter>,
    pub health: Arc<HealthChecker>,
}

/// Build the full router.
pub fn build_router(state: AppState) -> Router {
    let enable_cors = state.config.server.enable_cors;
    let mut router = Router::new()
        .nest("/jobs", routes::jobs::router())
        .nest("/radio/channels", routes::radio::router())
        .nest("/tv", routes::tv::router())
        .nest("/plugins", routes::plugins::router())
        .merge(routes::stream::router())
        .merge(routes::health::router())
        .merge(routes::metrics::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    router
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.bind_address, state.config.server.port
    )
    .parse()
    .map_err(|e| Error::validation(format!("invalid bind address: {e}")))?;

    let router = build_router(state);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::unavailable(format!("cannot bind {addr}: {e}")))?;
    info!(addr = %addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::internal(format!("server error: {e}")))?;
    Ok(())
}
