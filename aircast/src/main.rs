//! aircast - media processing and broadcast daemon.

use aircast::config::AppConfig;
use aircast::logging::init_logging;
use aircast::services::ServiceContainer;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let _guard = init_logging(&log_dir)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    info!("starting aircast v{}", env!("CARGO_PKG_VERSION"));

    dotenvy::dotenv().ok();

    let config = AppConfig::load(None)
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {}", e))?;

    let container = ServiceContainer::new(config)
        .map_err(|e| anyhow::anyhow!("failed to build services: {}", e))?;

    container
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize services: {}", e))?;

    container.start_api_server();
    info!("aircast started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, shutting down");
        }
    }

    if let Err(e) = container.shutdown(true).await {
        error!("error during shutdown: {}", e);
    }

    info!("aircast shutdown complete");
    Ok(())
}

/// Wait for SIGTERM (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// On non-Unix targets only Ctrl+C is handled.
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
