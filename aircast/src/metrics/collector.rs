//! Metrics collection.
//!
//! The collector reads live component state at scrape time rather than
//! mirroring it into counters; every value below is already tracked by the
//! owning subsystem.

use std::sync::Arc;

use serde::Serialize;

use crate::broadcast::StreamBroadcaster;
use crate::jobs::JobQueue;
use crate::plugin::PluginRegistry;
use crate::radio::RadioEngine;
use crate::tv::TvEngine;

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_pending: usize,
    pub jobs_processing: usize,
    pub jobs_completed_total: usize,
    pub jobs_failed_total: usize,
    pub jobs_cancelled_total: usize,
    pub workers_total: usize,
    pub workers_busy: usize,
    pub radio_channels: usize,
    pub radio_listeners_total: i64,
    pub tv_channels: usize,
    pub tv_viewers_total: i64,
    pub broadcast_mounts: usize,
    pub broadcast_listeners: usize,
    pub plugin_health: Vec<(String, bool)>,
}

/// Gathers metrics from the live components.
pub struct MetricsCollector {
    queue: Arc<JobQueue>,
    registry: Arc<PluginRegistry>,
    radio: Arc<RadioEngine>,
    tv: Arc<TvEngine>,
    broadcaster: Arc<StreamBroadcaster>,
}

impl MetricsCollector {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: Arc<PluginRegistry>,
        radio: Arc<RadioEngine>,
        tv: Arc<TvEngine>,
        broadcaster: Arc<StreamBroadcaster>,
    ) -> Self {
        Self {
            queue,
            registry,
            radio,
            tv,
            broadcaster,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stats = self.queue.stats();
        MetricsSnapshot {
            jobs_pending: stats.pending_jobs,
            jobs_processing: stats.processing_jobs,
            jobs_completed_total: stats.completed_jobs,
            jobs_failed_total: stats.failed_jobs,
            jobs_cancelled_total: stats.cancelled_jobs,
            workers_total: stats.total_workers,
            workers_busy: stats.busy_workers,
            radio_channels: self.radio.channel_count(),
            radio_listeners_total: self.radio.total_listeners(),
            tv_channels: self.tv.channel_count(),
            tv_viewers_total: self.tv.total_viewers(),
            broadcast_mounts: self.broadcaster.mounts().len(),
            broadcast_listeners: self.broadcaster.total_listeners(),
            plugin_health: self.registry.health_snapshot(),
        }
    }
}
