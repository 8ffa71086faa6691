//! Radio engine: per-channel playlist loops producing continuous encoded
//! audio into broadcaster mounts, with crossfade, loudness normalization
//! and auto-DJ.

mod autodj;
mod engine;
mod pipeline;

pub use engine::RadioEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Auto-DJ settings: folders scanned for audio files when the playlist
/// runs dry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoDjConfig {
    pub folders: Vec<String>,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

fn default_shuffle() -> bool {
    true
}

/// Configuration of one radio channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioChannelConfig {
    pub name: String,
    pub tenant_id: String,
    /// Output codec ("mp3", "aac", "ogg").
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// Crossfade duration in milliseconds. Zero disables crossfading;
    /// changes apply at the next track boundary.
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: u64,
    /// Integrated loudness target in LUFS for per-track normalization.
    #[serde(default = "default_target_lufs")]
    pub target_lufs: f64,
    #[serde(default)]
    pub auto_dj: Option<AutoDjConfig>,
}

fn default_codec() -> String {
    "mp3".to_string()
}

fn default_bitrate() -> u32 {
    128
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_channels() -> u8 {
    2
}

fn default_crossfade_ms() -> u64 {
    3000
}

fn default_target_lufs() -> f64 {
    -14.0
}

/// One playlist entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioTrack {
    pub id: String,
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    /// Declared duration; probed lazily when absent.
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl RadioTrack {
    /// Build a track from a file path, deriving title from the stem.
    pub fn from_path(path: &std::path::Path) -> Self {
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            id: format!("track-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            path: path.to_string_lossy().into_owned(),
            title,
            artist: None,
            duration_secs: None,
        }
    }
}

/// Externally visible channel status.
#[derive(Debug, Clone, Serialize)]
pub struct RadioChannelStatus {
    pub id: String,
    pub name: String,
    pub tenant_id: String,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub listener_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now_playing: Option<RadioTrack>,
    pub track_count: usize,
    pub codec: String,
    pub bitrate_kbps: u32,
    pub stream_url: String,
}
