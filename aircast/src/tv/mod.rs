//! TV engine: scheduled channels with multi-bitrate segmented output,
//! commercial insertion, bumpers and EPG generation.

mod engine;
mod epg;
mod playlist;
mod schedule;

pub use engine::TvEngine;
pub use epg::EpgEntry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One program: a media file with a declared duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvProgram {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub media_path: String,
    pub duration_secs: f64,
}

/// One schedule entry: a program anchored at a wall-clock start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvScheduleEntry {
    pub program: TvProgram,
    pub start_time: DateTime<Utc>,
}

impl TvScheduleEntry {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time
            + chrono::Duration::milliseconds((self.program.duration_secs * 1000.0) as i64)
    }
}

/// Commercial break settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommercialConfig {
    /// Pool of commercial clips, drawn round-robin.
    pub pool: Vec<String>,
    /// Insert a break after this many programs.
    #[serde(default = "default_break_every")]
    pub break_every_programs: u32,
    /// Target break length in seconds.
    #[serde(default = "default_break_secs")]
    pub break_duration_secs: u32,
}

fn default_break_every() -> u32 {
    1
}

fn default_break_secs() -> u32 {
    120
}

/// Bumper clips played around programs and while idling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bumpers {
    #[serde(default)]
    pub intro: Option<String>,
    #[serde(default)]
    pub outro: Option<String>,
    /// Filler looped during schedule gaps.
    #[serde(default)]
    pub idle: Option<String>,
}

/// Configuration of one TV channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvChannelConfig {
    pub name: String,
    pub tenant_id: String,
    #[serde(default)]
    pub commercials: Option<CommercialConfig>,
    #[serde(default)]
    pub bumpers: Bumpers,
}

/// Externally visible channel status.
#[derive(Debug, Clone, Serialize)]
pub struct TvChannelStatus {
    pub id: String,
    pub name: String,
    pub tenant_id: String,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub viewer_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now_playing: Option<TvProgram>,
    pub schedule_len: usize,
    pub stream_url: String,
    pub hls_url: String,
}

/// Stream locations returned by `start`.
#[derive(Debug, Clone, Serialize)]
pub struct TvStreamUrls {
    pub stream_url: String,
    pub hls_url: String,
    pub variant_urls: Vec<(String, String)>,
}
