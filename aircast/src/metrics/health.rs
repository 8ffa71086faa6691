//! Aggregate health snapshot for the `/health` endpoint.

use std::sync::Arc;

use serde::Serialize;

use crate::dbal::DbalClient;
use crate::jobs::JobQueue;
use crate::plugin::PluginRegistry;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Health of one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Aggregate system health.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

/// Computes health across the queue, the plugin registry and the external
/// DBAL service.
pub struct HealthChecker {
    queue: Arc<JobQueue>,
    registry: Arc<PluginRegistry>,
    dbal: DbalClient,
}

impl HealthChecker {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<PluginRegistry>, dbal: DbalClient) -> Self {
        Self {
            queue,
            registry,
            dbal,
        }
    }

    pub async fn check_all(&self) -> SystemHealth {
        let mut components = Vec::new();

        components.push(ComponentHealth {
            name: "job_queue".to_string(),
            status: if self.queue.is_running() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            message: None,
        });

        let plugins = self.registry.health_snapshot();
        let unhealthy: Vec<&str> = plugins
            .iter()
            .filter(|(_, healthy)| !healthy)
            .map(|(id, _)| id.as_str())
            .collect();
        components.push(ComponentHealth {
            name: "plugins".to_string(),
            status: if plugins.is_empty() {
                HealthStatus::Degraded
            } else if unhealthy.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            message: if unhealthy.is_empty() {
                None
            } else {
                Some(format!("unhealthy plugins: {}", unhealthy.join(", ")))
            },
        });

        if self.dbal.is_enabled() {
            let status = match self.dbal.ping().await {
                Ok(()) => HealthStatus::Healthy,
                Err(_) => HealthStatus::Degraded,
            };
            components.push(ComponentHealth {
                name: "dbal".to_string(),
                status,
                message: None,
            });
        }

        let status = if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemHealth { status, components }
    }
}
