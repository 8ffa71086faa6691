//! Client for the external DBAL service.
//!
//! The daemon talks to DBAL for three things: emitting user notifications,
//! checking permissions, and best-effort write-through of job records.
//! Notification delivery retries with exponential backoff and is dropped
//! after exhaustion; it never fails the operation that produced it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::DbalConfig;
use crate::error::{Error, Result};
use crate::jobs::JobInfo;

/// Notification kinds emitted by the queue and the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    StreamStarted,
    StreamStopped,
    TrackChanged,
    ProgramChanged,
}

/// A notification bound for DBAL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub tenant_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Notification {
    pub fn job(kind: NotificationKind, job: &JobInfo, payload: Value) -> Self {
        Self {
            kind,
            tenant_id: job.tenant_id.clone(),
            user_id: Some(job.user_id.clone()),
            job_id: Some(job.id.clone()),
            channel_id: None,
            payload,
        }
    }

    pub fn channel(
        kind: NotificationKind,
        tenant_id: impl Into<String>,
        channel_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            tenant_id: tenant_id.into(),
            user_id: None,
            job_id: None,
            channel_id: Some(channel_id.into()),
            payload,
        }
    }

    /// The wire body DBAL expects.
    fn to_wire(&self) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("kind".to_string(), json!(self.kind));
        body.insert("tenantId".to_string(), json!(self.tenant_id));
        if let Some(user_id) = &self.user_id {
            body.insert("userId".to_string(), json!(user_id));
        }
        if let Some(job_id) = &self.job_id {
            body.insert("jobId".to_string(), json!(job_id));
        }
        if let Some(channel_id) = &self.channel_id {
            body.insert("channelId".to_string(), json!(channel_id));
        }
        body.insert("payload".to_string(), self.payload.clone());
        Value::Object(body)
    }
}

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    allowed: bool,
}

/// HTTP client for the DBAL daemon.
#[derive(Clone)]
pub struct DbalClient {
    config: DbalConfig,
    http: reqwest::Client,
}

impl DbalClient {
    pub fn new(config: DbalConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(100)))
            .build()
            .map_err(Error::Http)?;
        Ok(Self { config, http })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether permission checks gate mutating API calls.
    pub fn enforces_permissions(&self) -> bool {
        self.config.enabled && self.config.enforce_permissions
    }

    /// Connectivity probe.
    pub async fn ping(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let url = format!("{}/health", self.config.url);
        let response = self.request(self.http.get(&url)).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::unavailable(format!(
                "DBAL health returned {}",
                response.status()
            )))
        }
    }

    /// Queue a notification for delivery. Fire-and-forget: retries run in
    /// the background and exhaustion is logged and dropped.
    pub fn notify(&self, notification: Notification) {
        if !self.config.enabled {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.deliver(&notification).await {
                warn!(
                    kind = ?notification.kind,
                    tenant = %notification.tenant_id,
                    "notification dropped after {} attempts: {}",
                    client.config.retry_attempts,
                    e
                );
            }
        });
    }

    /// Deliver with exponential backoff.
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let url = format!("{}/api/notifications", self.config.url);
        let body = notification.to_wire();
        let mut delay = Duration::from_millis(self.config.retry_delay_ms.max(1));
        let attempts = self.config.retry_attempts.max(1);

        let mut last_err = None;
        for attempt in 1..=attempts {
            let result = self
                .request(self.http.post(&url))
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(kind = ?notification.kind, attempt, "notification delivered");
                    return Ok(());
                }
                Ok(response) => {
                    last_err = Some(Error::internal(format!(
                        "DBAL returned {}",
                        response.status()
                    )));
                }
                Err(e) => last_err = Some(Error::Http(e)),
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
        Err(last_err.unwrap_or_else(|| Error::internal("notification delivery failed")))
    }

    /// Check whether a user holds a permission. Conservative policy: any
    /// non-200 response or transport failure is a deny.
    pub async fn check_permission(&self, tenant_id: &str, user_id: &str, permission: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let url = format!("{}/api/permissions/check", self.config.url);
        let result = self
            .request(self.http.get(&url))
            .query(&[
                ("tenantId", tenant_id),
                ("userId", user_id),
                ("permission", permission),
            ])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => response
                .json::<PermissionResponse>()
                .await
                .map(|r| r.allowed)
                .unwrap_or(false),
            Ok(response) => {
                debug!(
                    permission = %permission,
                    status = %response.status(),
                    "permission check denied (non-200)"
                );
                false
            }
            Err(e) => {
                warn!(permission = %permission, "permission check unreachable, denying: {}", e);
                false
            }
        }
    }

    /// Best-effort job record write-through. Failures are logged.
    pub async fn store_job(&self, job: &JobInfo) {
        if !self.config.enabled {
            return;
        }
        let url = format!("{}/api/jobs", self.config.url);
        if let Err(e) = self.request(self.http.post(&url)).json(job).send().await {
            debug!(job = %job.id, "job write-through failed: {}", e);
        }
    }

    /// Best-effort job record update.
    pub async fn update_job(&self, job: &JobInfo) {
        if !self.config.enabled {
            return;
        }
        let url = format!("{}/api/jobs/{}", self.config.url, job.id);
        if let Err(e) = self.request(self.http.put(&url)).json(job).send().await {
            debug!(job = %job.id, "job update write-through failed: {}", e);
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.config.api_key)
        }
    }
}
