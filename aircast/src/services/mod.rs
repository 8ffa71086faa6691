//! Service wiring: construct, initialize, and tear down every subsystem.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::broadcast::StreamBroadcaster;
use crate::config::AppConfig;
use crate::dbal::DbalClient;
use crate::error::Result;
use crate::jobs::{JobQueue, JobSweeper};
use crate::metrics::{HealthChecker, MetricsCollector, PrometheusExporter};
use crate::plugin::{PluginRegistry, builtin};
use crate::radio::RadioEngine;
use crate::tv::TvEngine;

/// Owns every long-lived component of the daemon.
pub struct ServiceContainer {
    pub config: Arc<AppConfig>,
    pub registry: Arc<PluginRegistry>,
    pub queue: Arc<JobQueue>,
    pub radio: Arc<RadioEngine>,
    pub tv: Arc<TvEngine>,
    pub broadcaster: Arc<StreamBroadcaster>,
    pub dbal: DbalClient,
    exporter: Arc<PrometheusExporter>,
    health: Arc<HealthChecker>,
    start_time: Instant,
    cancel: CancellationToken,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Construct all components. Nothing runs yet; `initialize` starts the
    /// background machinery.
    pub fn new(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);
        let dbal = DbalClient::new(config.dbal.clone())?;
        let registry = Arc::new(PluginRegistry::new(config.plugins.clone()));

        for plugin in builtin::all(&config.plugins, &config.queue) {
            registry.register_builtin(plugin)?;
        }

        let broadcaster = Arc::new(StreamBroadcaster::new(
            config.broadcaster.listener_buffer_chunks,
        ));
        let queue = JobQueue::new(config.queue.clone(), registry.clone(), dbal.clone());
        let radio = RadioEngine::new(
            config.radio.clone(),
            config.plugins.clone(),
            config.broadcaster.clone(),
            broadcaster.clone(),
            registry.clone(),
            dbal.clone(),
        );
        let tv = TvEngine::new(
            config.tv.clone(),
            config.plugins.clone(),
            config.broadcaster.clone(),
            broadcaster.clone(),
            registry.clone(),
            dbal.clone(),
        );

        let collector = Arc::new(MetricsCollector::new(
            queue.clone(),
            registry.clone(),
            radio.clone(),
            tv.clone(),
            broadcaster.clone(),
        ));
        let exporter = Arc::new(PrometheusExporter::new(collector));
        let health = Arc::new(HealthChecker::new(
            queue.clone(),
            registry.clone(),
            dbal.clone(),
        ));

        Ok(Self {
            config,
            registry,
            queue,
            radio,
            tv,
            broadcaster,
            dbal,
            exporter,
            health,
            start_time: Instant::now(),
            cancel: CancellationToken::new(),
            server_task: Mutex::new(None),
        })
    }

    /// Initialize plugins and start the queue, sweeper and health probe.
    pub async fn initialize(&self) -> Result<()> {
        self.registry.initialize().await?;
        self.registry.health_check().await;
        self.registry.spawn_health_probe(self.cancel.clone());

        self.queue.start();
        JobSweeper::new(self.queue.clone()).start_background_task(self.cancel.clone());

        if self.dbal.is_enabled() {
            if let Err(e) = self.dbal.ping().await {
                // The daemon still comes up; notifications retry and
                // permission checks deny until DBAL is reachable.
                tracing::warn!("DBAL is not reachable at startup: {}", e);
            }
        }

        info!(
            plugins = self.registry.plugin_count(),
            "services initialized"
        );
        Ok(())
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            start_time: self.start_time,
            config: self.config.clone(),
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            radio: self.radio.clone(),
            tv: self.tv.clone(),
            broadcaster: self.broadcaster.clone(),
            dbal: self.dbal.clone(),
            exporter: self.exporter.clone(),
            health: self.health.clone(),
        }
    }

    /// Start the HTTP server in the background.
    pub fn start_api_server(&self) {
        let state = self.app_state();
        let shutdown = self.cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = api::serve(state, shutdown).await {
                error!("API server exited: {}", e);
            }
        });
        *self.server_task.lock() = Some(task);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Graceful shutdown: stop engines, drain or cancel the queue, shut
    /// plugins down, stop the server.
    pub async fn shutdown(&self, wait_for_completion: bool) -> Result<()> {
        info!("shutting down services");
        self.radio.shutdown().await;
        self.tv.shutdown().await;
        self.queue.stop(wait_for_completion).await;
        self.registry.shutdown_all().await;
        self.cancel.cancel();

        let task = { self.server_task.lock().take() };
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("services shut down");
        Ok(())
    }
}
