//! Logging initialization.
//!
//! Console output through a fmt layer plus a daily-rolling file appender.
//! The filter comes from `RUST_LOG` when set, falling back to
//! [`DEFAULT_LOG_FILTER`].

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "aircast=info,process_utils=info,tower_http=warn";

/// Initialize logging. Returns the appender guard; dropping it stops the
/// background writer, so the caller must hold it for the process lifetime.
pub fn init_logging(log_dir: impl AsRef<Path>) -> Result<WorkerGuard> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)
        .map_err(|e| Error::internal(format!("cannot create log dir {}: {}", log_dir.display(), e)))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let file_appender = tracing_appender::rolling::daily(log_dir, "aircast.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()
        .map_err(|e| Error::internal(format!("failed to initialize logging: {}", e)))?;

    Ok(guard)
}
