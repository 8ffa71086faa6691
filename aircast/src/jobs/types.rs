//! Job data model: types, priorities, statuses, request parameters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The kinds of work the daemon accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    VideoTranscode,
    AudioTranscode,
    ImageProcess,
    DocumentConvert,
    Custom,
}

impl JobType {
    /// All job types, in the order worker pools are spawned.
    pub const ALL: [JobType; 5] = [
        JobType::VideoTranscode,
        JobType::AudioTranscode,
        JobType::ImageProcess,
        JobType::DocumentConvert,
        JobType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoTranscode => "video-transcode",
            Self::AudioTranscode => "audio-transcode",
            Self::ImageProcess => "image-process",
            Self::DocumentConvert => "document-convert",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job priority. Higher value, earlier dequeue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// Job lifecycle status. Transitions only move forward:
/// pending → processing → {completed|failed|cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image filters applied in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFilter {
    Resize,
    Blur,
    Sharpen,
    Grayscale,
    Normalize,
    Flip,
    Flop,
}

/// Job request parameters, tagged by job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobParams {
    VideoTranscode {
        input: String,
        output: String,
        video_codec: String,
        audio_codec: String,
        bitrate_kbps: u32,
        /// "WIDTHxHEIGHT", e.g. "1280x720". None keeps the source size.
        #[serde(default)]
        resolution: Option<String>,
        container: String,
        /// Hardware acceleration hint (e.g. "vaapi", "cuda").
        #[serde(default)]
        hwaccel: Option<String>,
    },
    AudioTranscode {
        input: String,
        output: String,
        codec: String,
        bitrate_kbps: u32,
        sample_rate: u32,
        channels: u8,
    },
    ImageProcess {
        input: String,
        output: String,
        width: u32,
        height: u32,
        #[serde(default)]
        preserve_aspect: bool,
        #[serde(default)]
        filters: Vec<ImageFilter>,
        #[serde(default = "default_quality")]
        quality: u8,
        format: String,
    },
    DocumentConvert {
        input: String,
        output: String,
        format: String,
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        variables: HashMap<String, String>,
    },
    Custom {
        #[serde(default)]
        values: HashMap<String, String>,
    },
}

fn default_quality() -> u8 {
    85
}

impl JobParams {
    /// The job type this parameter set belongs to.
    pub fn job_type(&self) -> JobType {
        match self {
            Self::VideoTranscode { .. } => JobType::VideoTranscode,
            Self::AudioTranscode { .. } => JobType::AudioTranscode,
            Self::ImageProcess { .. } => JobType::ImageProcess,
            Self::DocumentConvert { .. } => JobType::DocumentConvert,
            Self::Custom { .. } => JobType::Custom,
        }
    }

    /// Input path, where the type has one.
    pub fn input(&self) -> Option<&str> {
        match self {
            Self::VideoTranscode { input, .. }
            | Self::AudioTranscode { input, .. }
            | Self::ImageProcess { input, .. }
            | Self::DocumentConvert { input, .. } => Some(input),
            Self::Custom { .. } => None,
        }
    }

    /// Output path, where the type has one.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::VideoTranscode { output, .. }
            | Self::AudioTranscode { output, .. }
            | Self::ImageProcess { output, .. }
            | Self::DocumentConvert { output, .. } => Some(output),
            Self::Custom { .. } => None,
        }
    }

    /// Validate request shape. Called once on submit; workers trust the
    /// stored request afterwards.
    pub fn validate(&self) -> Result<()> {
        if let Some(input) = self.input()
            && input.trim().is_empty()
        {
            return Err(Error::validation("input path must not be empty"));
        }
        if let Some(output) = self.output()
            && output.trim().is_empty()
        {
            return Err(Error::validation("output path must not be empty"));
        }
        match self {
            Self::VideoTranscode {
                bitrate_kbps,
                resolution,
                ..
            } => {
                if *bitrate_kbps == 0 {
                    return Err(Error::validation("bitrate must be positive"));
                }
                if let Some(res) = resolution
                    && parse_resolution(res).is_none()
                {
                    return Err(Error::validation(format!(
                        "invalid resolution '{res}', expected WIDTHxHEIGHT"
                    )));
                }
            }
            Self::AudioTranscode {
                bitrate_kbps,
                sample_rate,
                channels,
                ..
            } => {
                if *bitrate_kbps == 0 {
                    return Err(Error::validation("bitrate must be positive"));
                }
                if *sample_rate == 0 {
                    return Err(Error::validation("sample rate must be positive"));
                }
                if *channels == 0 {
                    return Err(Error::validation("channel count must be positive"));
                }
            }
            Self::ImageProcess {
                width,
                height,
                quality,
                ..
            } => {
                if *width == 0 || *height == 0 {
                    return Err(Error::validation("image dimensions must be positive"));
                }
                if *quality > 100 {
                    return Err(Error::validation("quality must be 0-100"));
                }
            }
            Self::DocumentConvert { format, .. } => {
                if format.trim().is_empty() {
                    return Err(Error::validation("output format must not be empty"));
                }
            }
            Self::Custom { values } => {
                if values.is_empty() {
                    return Err(Error::validation("custom jobs require parameters"));
                }
            }
        }
        Ok(())
    }
}

/// Parse a "WIDTHxHEIGHT" string.
pub fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once('x')?;
    let w: u32 = w.parse().ok()?;
    let h: u32 = h.parse().ok()?;
    if w == 0 || h == 0 { None } else { Some((w, h)) }
}

/// A job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Request parameters, tagged by job type.
    pub params: JobParams,
    #[serde(default)]
    pub priority: JobPriority,
    pub tenant_id: String,
    pub user_id: String,
    /// Retry budget for `retry` chains.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

/// Progress of a processing job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    /// Percent complete, 0-100, monotonic non-decreasing.
    pub percent: u8,
    /// Human-readable stage, e.g. "transcoding".
    #[serde(default)]
    pub stage: String,
    /// Estimated seconds remaining, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
}

/// Snapshot of one job, as returned by `get`/`list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub tenant_id: String,
    pub user_id: String,
    pub params: JobParams,
    pub progress: JobProgress,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Id of the failed job this one retries, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Number of retries remaining.
    pub retries_left: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_params() -> JobParams {
        JobParams::ImageProcess {
            input: "/in/a.png".to_string(),
            output: "/out/a.jpg".to_string(),
            width: 256,
            height: 256,
            preserve_aspect: true,
            filters: vec![ImageFilter::Resize],
            quality: 85,
            format: "jpg".to_string(),
        }
    }

    #[test]
    fn params_report_their_type() {
        assert_eq!(image_params().job_type(), JobType::ImageProcess);
    }

    #[test]
    fn tagged_union_round_trips() {
        let json = serde_json::to_string(&image_params()).unwrap();
        assert!(json.contains("\"type\":\"image-process\""));
        let back: JobParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, image_params());
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let raw = r#"{ "type": "hologram-render", "input": "/a", "output": "/b" }"#;
        assert!(serde_json::from_str::<JobParams>(raw).is_err());
    }

    #[test]
    fn validation_rejects_zero_dimensions() {
        let params = JobParams::ImageProcess {
            input: "/in/a.png".to_string(),
            output: "/out/a.jpg".to_string(),
            width: 0,
            height: 256,
            preserve_aspect: false,
            filters: vec![],
            quality: 85,
            format: "jpg".to_string(),
        };
        assert_eq!(params.validate().unwrap_err().code(), "validation_error");
    }

    #[test]
    fn validation_rejects_empty_paths() {
        let params = JobParams::AudioTranscode {
            input: " ".to_string(),
            output: "/out/a.mp3".to_string(),
            codec: "mp3".to_string(),
            bitrate_kbps: 128,
            sample_rate: 44100,
            channels: 2,
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_resolution() {
        let params = JobParams::VideoTranscode {
            input: "/in/a.mkv".to_string(),
            output: "/out/a.mp4".to_string(),
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            bitrate_kbps: 2500,
            resolution: Some("widexhigh".to_string()),
            container: "mp4".to_string(),
            hwaccel: None,
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn resolution_parses() {
        assert_eq!(parse_resolution("1280x720"), Some((1280, 720)));
        assert_eq!(parse_resolution("0x720"), None);
        assert_eq!(parse_resolution("1280"), None);
    }

    #[test]
    fn priority_orders_low_to_urgent() {
        assert!(JobPriority::Urgent > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
