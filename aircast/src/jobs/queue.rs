//! Thread-safe priority job queue with per-type worker pools.
//!
//! Jobs live in an in-memory record map; scheduling happens on one binary
//! heap per job type ordered by (priority desc, submitted-at asc). Workers
//! are tokio tasks that wait on the type's notifier with a poll fallback,
//! route each job through the plugin registry and decide the terminal
//! status at return time.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::progress::spawn_progress_flusher;
use super::types::{
    JobInfo, JobParams, JobPriority, JobProgress, JobRequest, JobStatus, JobType,
};
use crate::config::QueueConfig;
use crate::dbal::{DbalClient, Notification, NotificationKind};
use crate::error::{Error, Result};
use crate::plugin::{PluginRegistry, ProcessRequest, ProgressSink};

/// Poll fallback for workers, in case a notify is missed.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One stored job.
struct JobRecord {
    info: JobInfo,
    /// Set by `cancel` while the job is processing; the worker reads it
    /// when the plugin returns to decide the terminal status.
    cancel_requested: bool,
    /// Plugin currently processing this job, for cancel routing.
    active_plugin: Option<String>,
}

/// Heap entry: highest priority first, earliest submission first within a
/// priority, submission sequence as the final tiebreak.
#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: JobPriority,
    submitted_at: DateTime<Utc>,
    seq: u64,
    job_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct TypeQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    workers: usize,
}

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending_jobs: usize,
    pub processing_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub pending_by_type: HashMap<String, usize>,
    pub processing_by_type: HashMap<String, usize>,
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
}

/// The job queue.
pub struct JobQueue {
    config: QueueConfig,
    registry: Arc<PluginRegistry>,
    dbal: DbalClient,
    jobs: DashMap<String, JobRecord>,
    queues: HashMap<JobType, TypeQueue>,
    seq: AtomicU64,
    running: AtomicBool,
    shutdown: CancellationToken,
    workers: Mutex<Option<JoinSet<()>>>,
    busy_workers: Arc<AtomicUsize>,
    total_workers: usize,
}

impl JobQueue {
    pub fn new(config: QueueConfig, registry: Arc<PluginRegistry>, dbal: DbalClient) -> Arc<Self> {
        let worker_counts = [
            (JobType::VideoTranscode, config.video_workers),
            (JobType::AudioTranscode, config.audio_workers),
            (JobType::ImageProcess, config.image_workers),
            (JobType::DocumentConvert, config.document_workers),
            (JobType::Custom, config.custom_workers),
        ];
        let queues = worker_counts
            .into_iter()
            .map(|(job_type, workers)| {
                (
                    job_type,
                    TypeQueue {
                        heap: Mutex::new(BinaryHeap::new()),
                        notify: Notify::new(),
                        workers,
                    },
                )
            })
            .collect::<HashMap<_, _>>();
        let total_workers = queues.values().map(|q| q.workers).sum();

        Arc::new(Self {
            config,
            registry,
            dbal,
            jobs: DashMap::new(),
            queues,
            seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Some(JoinSet::new())),
            busy_workers: Arc::new(AtomicUsize::new(0)),
            total_workers,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the per-type worker pools. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.workers.lock();
        if let Some(join_set) = tasks.as_mut() {
            for (&job_type, type_queue) in &self.queues {
                for worker_id in 0..type_queue.workers {
                    let queue = self.clone();
                    join_set.spawn(async move {
                        queue.worker_loop(job_type, worker_id).await;
                    });
                }
            }
        }
        info!(workers = self.total_workers, "job queue started");
    }

    /// Stop the queue. With `wait_for_completion` the workers finish their
    /// current jobs; without it every outstanding job is cancelled first.
    pub async fn stop(&self, wait_for_completion: bool) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if !wait_for_completion {
            let ids: Vec<String> = self
                .jobs
                .iter()
                .filter(|r| !r.info.status.is_terminal())
                .map(|r| r.info.id.clone())
                .collect();
            for id in ids {
                if let Err(e) = self.cancel(&id) {
                    debug!(job = %id, "cancel during shutdown: {}", e);
                }
            }
        }
        self.shutdown.cancel();

        let join_set = { self.workers.lock().take() };
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }
        info!("job queue stopped");
    }

    // ========================================================================
    // Job management
    // ========================================================================

    /// Submit a job. Validates the request shape, enqueues it and returns
    /// the new id. Never blocks on worker availability.
    pub fn submit(&self, request: JobRequest) -> Result<String> {
        self.submit_linked(request, None)
    }

    fn submit_linked(&self, request: JobRequest, parent_id: Option<String>) -> Result<String> {
        if !self.is_running() {
            return Err(Error::unavailable("job queue is not running"));
        }
        request.params.validate()?;
        if request.tenant_id.trim().is_empty() || request.user_id.trim().is_empty() {
            return Err(Error::validation("tenant and user ids are required"));
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = format!(
            "job-{}-{}",
            seq,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let job_type = request.params.job_type();
        let now = Utc::now();

        let info = JobInfo {
            id: id.clone(),
            job_type,
            status: JobStatus::Pending,
            priority: request.priority,
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            params: request.params.clone(),
            progress: JobProgress::default(),
            submitted_at: now,
            started_at: None,
            ended_at: None,
            error: None,
            output_path: None,
            parent_id,
            retries_left: request.max_retries,
        };

        self.jobs.insert(
            id.clone(),
            JobRecord {
                info: info.clone(),
                cancel_requested: false,
                active_plugin: None,
            },
        );

        let type_queue = &self.queues[&job_type];
        type_queue.heap.lock().push(QueueEntry {
            priority: request.priority,
            submitted_at: now,
            seq,
            job_id: id.clone(),
        });
        type_queue.notify.notify_one();

        debug!(job = %id, r#type = %job_type, priority = ?request.priority, "job submitted");

        self.dbal.notify(Notification::job(
            NotificationKind::JobStarted,
            &info,
            json!({ "jobType": job_type }),
        ));
        let dbal = self.dbal.clone();
        tokio::spawn(async move { dbal.store_job(&info).await });

        Ok(id)
    }

    /// Snapshot one job.
    pub fn get(&self, job_id: &str) -> Result<JobInfo> {
        self.jobs
            .get(job_id)
            .map(|r| r.info.clone())
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    /// List jobs, newest submissions first.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .jobs
            .iter()
            .filter(|r| {
                filter
                    .tenant_id
                    .as_ref()
                    .is_none_or(|t| &r.info.tenant_id == t)
                    && filter.user_id.as_ref().is_none_or(|u| &r.info.user_id == u)
                    && filter.status.is_none_or(|s| r.info.status == s)
            })
            .map(|r| r.info.clone())
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(b.id.cmp(&a.id)));

        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        jobs.into_iter().skip(filter.offset).take(limit).collect()
    }

    /// Cancel a job.
    ///
    /// Pending jobs become cancelled immediately (their heap entries are
    /// removed lazily by workers). Processing jobs get the cancel flag set
    /// and the owning plugin's cancel hook invoked; the worker records the
    /// terminal status when the plugin returns, so a job in late completion
    /// may still finish as completed.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let mut record = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::not_found("job", job_id))?;

        match record.info.status {
            JobStatus::Pending => {
                record.info.status = JobStatus::Cancelled;
                record.info.ended_at = Some(Utc::now());
                debug!(job = %job_id, "pending job cancelled");
                Ok(())
            }
            JobStatus::Processing => {
                record.cancel_requested = true;
                let plugin_id = record.active_plugin.clone();
                drop(record);
                if let Some(plugin_id) = plugin_id
                    && let Some(handle) = self.registry.get(&plugin_id)
                {
                    let job_id = job_id.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = handle.cancel(&job_id).await {
                            debug!(job = %job_id, "plugin cancel hook: {}", e);
                        }
                    });
                }
                Ok(())
            }
            JobStatus::Cancelled => Ok(()),
            status => Err(Error::conflict(format!(
                "job {job_id} is already {status}"
            ))),
        }
    }

    /// Retry a failed job: a new job with identical parameters, linked to
    /// the original through `parent_id`.
    pub fn retry(&self, job_id: &str) -> Result<String> {
        let (request, retries_left) = {
            let record = self
                .jobs
                .get(job_id)
                .ok_or_else(|| Error::not_found("job", job_id))?;
            if record.info.status != JobStatus::Failed {
                return Err(Error::conflict(format!(
                    "only failed jobs can be retried; job {job_id} is {}",
                    record.info.status
                )));
            }
            (
                JobRequest {
                    params: record.info.params.clone(),
                    priority: record.info.priority,
                    tenant_id: record.info.tenant_id.clone(),
                    user_id: record.info.user_id.clone(),
                    max_retries: record.info.retries_left,
                },
                record.info.retries_left,
            )
        };
        if retries_left == 0 {
            return Err(Error::conflict(format!(
                "retry budget exhausted for job {job_id}"
            )));
        }
        let mut request = request;
        request.max_retries = retries_left - 1;
        self.submit_linked(request, Some(job_id.to_string()))
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total_workers: self.total_workers,
            busy_workers: self.busy_workers.load(Ordering::SeqCst),
            ..QueueStats::default()
        };
        stats.idle_workers = stats.total_workers.saturating_sub(stats.busy_workers);

        for record in self.jobs.iter() {
            let type_key = record.info.job_type.as_str().to_string();
            match record.info.status {
                JobStatus::Pending => {
                    stats.pending_jobs += 1;
                    *stats.pending_by_type.entry(type_key).or_default() += 1;
                }
                JobStatus::Processing => {
                    stats.processing_jobs += 1;
                    *stats.processing_by_type.entry(type_key).or_default() += 1;
                }
                JobStatus::Completed => stats.completed_jobs += 1,
                JobStatus::Failed => stats.failed_jobs += 1,
                JobStatus::Cancelled => stats.cancelled_jobs += 1,
            }
        }
        stats
    }

    /// Remove terminal jobs past their retention window. Returns how many
    /// were removed. Output artifacts on disk are left alone.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let completed_cutoff = chrono::Duration::hours(self.config.completed_retention_hours as i64);
        let failed_cutoff = chrono::Duration::hours(self.config.failed_retention_hours as i64);

        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|r| {
                let Some(ended_at) = r.info.ended_at else {
                    return false;
                };
                let age = now - ended_at;
                match r.info.status {
                    JobStatus::Completed | JobStatus::Cancelled => age > completed_cutoff,
                    JobStatus::Failed => age > failed_cutoff,
                    _ => false,
                }
            })
            .map(|r| r.info.id.clone())
            .collect();

        for id in &expired {
            self.jobs.remove(id);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "swept expired jobs");
        }
        expired.len()
    }

    // ========================================================================
    // Workers
    // ========================================================================

    async fn worker_loop(self: Arc<Self>, job_type: JobType, worker_id: usize) {
        debug!(r#type = %job_type, worker = worker_id, "worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Some(job_id) = self.pop_ready(job_type) {
                self.busy_workers.fetch_add(1, Ordering::SeqCst);
                self.process_one(job_id).await;
                self.busy_workers.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            let type_queue = &self.queues[&job_type];
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = type_queue.notify.notified() => {}
                _ = tokio::time::sleep(WORKER_POLL_INTERVAL) => {}
            }
        }
        debug!(r#type = %job_type, worker = worker_id, "worker stopped");
    }

    /// Pop the next runnable job id. Entries whose record is no longer
    /// pending (cancelled, swept) are discarded — lazy removal.
    fn pop_ready(&self, job_type: JobType) -> Option<String> {
        let type_queue = &self.queues[&job_type];
        loop {
            let entry = type_queue.heap.lock().pop()?;
            let runnable = self
                .jobs
                .get(&entry.job_id)
                .map(|r| r.info.status == JobStatus::Pending)
                .unwrap_or(false);
            if runnable {
                return Some(entry.job_id);
            }
        }
    }

    async fn process_one(self: &Arc<Self>, job_id: String) {
        // Transition pending → processing; a cancel that raced the pop wins.
        let params: JobParams = {
            let Some(mut record) = self.jobs.get_mut(&job_id) else {
                return;
            };
            if record.info.status != JobStatus::Pending {
                return;
            }
            record.info.status = JobStatus::Processing;
            record.info.started_at = Some(Utc::now());
            record.info.params.clone()
        };

        let Some(plugin) = self.registry.find_for(&params) else {
            self.finish(
                &job_id,
                Err(Error::plugin(format!(
                    "no plugin available for type '{}'",
                    params.job_type()
                ))),
            );
            return;
        };
        let plugin_id = plugin.descriptor().id.clone();
        if let Some(mut record) = self.jobs.get_mut(&job_id) {
            record.active_plugin = Some(plugin_id.clone());
        }
        debug!(job = %job_id, plugin = %plugin_id, "job dispatched");

        // Progress flows through a coalescing flusher into the record.
        let (tx, rx) = mpsc::channel::<JobProgress>(64);
        let flusher = {
            let queue = self.clone();
            let job_id = job_id.clone();
            spawn_progress_flusher(rx, move |p| queue.apply_progress(&job_id, p))
        };
        let sink = ProgressSink::new(move |p| {
            let _ = tx.try_send(p);
        });

        let request = ProcessRequest {
            job_id: job_id.clone(),
            params,
        };
        let timeout = Duration::from_secs(self.config.job_timeout_secs);
        let outcome = tokio::time::timeout(timeout, plugin.process(&request, &sink)).await;
        drop(sink);
        let _ = flusher.await;

        match outcome {
            Ok(result) => self.finish(&job_id, result),
            Err(_) => {
                // Timeout dropped the process future; tell the plugin to
                // tear down whatever child it still tracks.
                if let Err(e) = plugin.cancel(&job_id).await {
                    debug!(job = %job_id, "cancel after timeout: {}", e);
                }
                self.finish(
                    &job_id,
                    Err(Error::transcode(format!(
                        "job timed out after {}s",
                        self.config.job_timeout_secs
                    ))),
                );
            }
        }
    }

    /// Record the terminal status. The worker decides it here, at plugin
    /// return: success always wins (a cancel that raced a completed job
    /// stays completed), a failure under a requested cancel records
    /// cancelled.
    fn finish(&self, job_id: &str, result: Result<String>) {
        let info = {
            let Some(mut record) = self.jobs.get_mut(job_id) else {
                return;
            };
            let now = Utc::now();
            record.info.ended_at = Some(now);
            record.active_plugin = None;
            match result {
                Ok(output_path) => {
                    record.info.status = JobStatus::Completed;
                    record.info.progress = JobProgress {
                        percent: 100,
                        stage: "done".to_string(),
                        eta_secs: None,
                    };
                    record.info.output_path = Some(output_path);
                }
                Err(e) if record.cancel_requested => {
                    record.info.status = JobStatus::Cancelled;
                    debug!(job = %job_id, "job cancelled ({})", e);
                }
                Err(e) => {
                    record.info.status = JobStatus::Failed;
                    record.info.error = Some(format!("{}: {}", e.code(), e));
                }
            }
            record.info.clone()
        };

        match info.status {
            JobStatus::Completed => {
                info!(job = %job_id, output = ?info.output_path, "job completed");
                self.dbal.notify(Notification::job(
                    NotificationKind::JobCompleted,
                    &info,
                    json!({ "outputPath": info.output_path }),
                ));
            }
            JobStatus::Failed => {
                warn!(job = %job_id, error = ?info.error, "job failed");
                self.dbal.notify(Notification::job(
                    NotificationKind::JobFailed,
                    &info,
                    json!({ "error": info.error }),
                ));
            }
            // No notification for cancellation.
            _ => {}
        }
        let dbal = self.dbal.clone();
        tokio::spawn(async move { dbal.update_job(&info).await });
    }

    /// Apply a coalesced progress update. Percent is clamped monotonic
    /// non-decreasing; updates after a terminal status are ignored.
    fn apply_progress(&self, job_id: &str, update: JobProgress) {
        let info = {
            let Some(mut record) = self.jobs.get_mut(job_id) else {
                return;
            };
            if record.info.status != JobStatus::Processing {
                return;
            }
            let percent = update.percent.max(record.info.progress.percent);
            record.info.progress = JobProgress { percent, ..update };
            record.info.clone()
        };
        self.dbal.notify(Notification::job(
            NotificationKind::JobProgress,
            &info,
            json!({ "percent": info.progress.percent, "stage": info.progress.stage }),
        ));
    }
}
