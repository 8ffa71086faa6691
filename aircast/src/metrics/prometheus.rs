//! Prometheus metrics exporter.
//!
//! Exports the collector's snapshot in Prometheus text format under the
//! `media` namespace.

use std::sync::Arc;

use super::collector::MetricsCollector;

/// Prometheus text-format exporter.
pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self {
            collector,
            namespace: "media".to_string(),
        }
    }

    /// Export the current snapshot.
    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();

        self.write_gauge(
            &mut output,
            "jobs_pending",
            "Jobs waiting in the queue",
            snapshot.jobs_pending as f64,
        );
        self.write_gauge(
            &mut output,
            "jobs_processing",
            "Jobs currently being processed",
            snapshot.jobs_processing as f64,
        );
        self.write_counter(
            &mut output,
            "jobs_completed_total",
            "Total completed jobs still retained",
            snapshot.jobs_completed_total as f64,
        );
        self.write_counter(
            &mut output,
            "jobs_failed_total",
            "Total failed jobs still retained",
            snapshot.jobs_failed_total as f64,
        );
        self.write_gauge(
            &mut output,
            "workers_total",
            "Configured worker count across all job types",
            snapshot.workers_total as f64,
        );
        self.write_gauge(
            &mut output,
            "workers_busy",
            "Workers currently processing a job",
            snapshot.workers_busy as f64,
        );
        self.write_gauge(
            &mut output,
            "radio_listeners_total",
            "Listeners across all radio channels",
            snapshot.radio_listeners_total as f64,
        );
        self.write_gauge(
            &mut output,
            "tv_viewers_total",
            "Viewers across all TV channels",
            snapshot.tv_viewers_total as f64,
        );
        self.write_gauge(
            &mut output,
            "radio_channels",
            "Radio channels configured",
            snapshot.radio_channels as f64,
        );
        self.write_gauge(
            &mut output,
            "tv_channels",
            "TV channels configured",
            snapshot.tv_channels as f64,
        );
        self.write_gauge(
            &mut output,
            "broadcast_mounts",
            "Active broadcaster mounts",
            snapshot.broadcast_mounts as f64,
        );
        self.write_gauge(
            &mut output,
            "broadcast_listeners",
            "Listeners attached across all mounts",
            snapshot.broadcast_listeners as f64,
        );

        for (plugin, healthy) in &snapshot.plugin_health {
            self.write_gauge_with_labels(
                &mut output,
                "plugin_healthy",
                "Last-known plugin health (1 healthy, 0 unhealthy)",
                if *healthy { 1.0 } else { 0.0 },
                &[("plugin", plugin)],
            );
        }

        output
    }

    fn write_gauge(&self, output: &mut String, name: &str, help: &str, value: f64) {
        let full_name = format!("{}_{}", self.namespace, name);
        output.push_str(&format!("# HELP {} {}\n", full_name, help));
        output.push_str(&format!("# TYPE {} gauge\n", full_name));
        output.push_str(&format!("{} {}\n", full_name, value));
    }

    fn write_gauge_with_labels(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let full_name = format!("{}_{}", self.namespace, name);
        output.push_str(&format!("# HELP {} {}\n", full_name, help));
        output.push_str(&format!("# TYPE {} gauge\n", full_name));

        let labels_str = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect::<Vec<_>>()
            .join(",");
        output.push_str(&format!("{}{{{}}} {}\n", full_name, labels_str, value));
    }

    fn write_counter(&self, output: &mut String, name: &str, help: &str, value: f64) {
        let full_name = format!("{}_{}", self.namespace, name);
        output.push_str(&format!("# HELP {} {}\n", full_name, help));
        output.push_str(&format!("# TYPE {} counter\n", full_name));
        output.push_str(&format!("{} {}\n", full_name, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::StreamBroadcaster;
    use crate::config::{
        BroadcasterConfig, DbalConfig, PluginConfig, QueueConfig, RadioConfig, TvConfig,
    };
    use crate::dbal::DbalClient;
    use crate::jobs::JobQueue;
    use crate::plugin::PluginRegistry;
    use crate::radio::RadioEngine;
    use crate::tv::TvEngine;

    fn exporter() -> PrometheusExporter {
        let registry = Arc::new(PluginRegistry::new(PluginConfig::default()));
        let dbal = DbalClient::new(DbalConfig::default()).unwrap();
        let broadcaster = Arc::new(StreamBroadcaster::new(8));
        let queue = JobQueue::new(QueueConfig::default(), registry.clone(), dbal.clone());
        let radio = RadioEngine::new(
            RadioConfig::default(),
            PluginConfig::default(),
            BroadcasterConfig::default(),
            broadcaster.clone(),
            registry.clone(),
            dbal.clone(),
        );
        let tv = TvEngine::new(
            TvConfig::default(),
            PluginConfig::default(),
            BroadcasterConfig::default(),
            broadcaster.clone(),
            registry.clone(),
            dbal,
        );
        PrometheusExporter::new(Arc::new(MetricsCollector::new(
            queue,
            registry,
            radio,
            tv,
            broadcaster,
        )))
    }

    #[tokio::test]
    async fn export_carries_the_required_series() {
        let output = exporter().export();
        for series in [
            "media_jobs_pending",
            "media_jobs_processing",
            "media_jobs_completed_total",
            "media_jobs_failed_total",
            "media_workers_total",
            "media_workers_busy",
            "media_radio_listeners_total",
            "media_tv_viewers_total",
        ] {
            assert!(output.contains(series), "missing series {series}");
        }
        assert!(output.contains("# TYPE media_jobs_pending gauge"));
        assert!(output.contains("# TYPE media_jobs_completed_total counter"));
    }

    #[tokio::test]
    async fn plugin_health_series_is_labelled() {
        let exporter = exporter();
        // No plugins registered yet: no labelled series.
        assert!(!exporter.export().contains("media_plugin_healthy{"));
    }
}
