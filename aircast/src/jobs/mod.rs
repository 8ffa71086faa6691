//! Job queue subsystem: submission, scheduling, worker pools, progress,
//! cancellation and retention.

mod progress;
mod queue;
mod sweeper;
mod types;

pub use progress::{PROGRESS_COALESCE_WINDOW, spawn_progress_flusher};
pub use queue::{JobFilter, JobQueue, QueueStats};
pub use sweeper::JobSweeper;
pub use types::{
    ImageFilter, JobInfo, JobParams, JobPriority, JobProgress, JobRequest, JobStatus, JobType,
    parse_resolution,
};
