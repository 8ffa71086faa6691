//! Daemon configuration.
//!
//! A single [`AppConfig`] is loaded at startup from an optional JSON file
//! plus environment overrides. Nothing in here is reloadable at runtime;
//! only plugins can be reloaded once the daemon is up.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enable permissive CORS.
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    /// Request body size limit in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_true() -> bool {
    true
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            enable_cors: true,
            body_limit: default_body_limit(),
        }
    }
}

/// Job queue configuration: worker counts per job type, timeouts and
/// retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Video transcode workers. Video is the most expensive type, so it
    /// gets the smallest pool by default.
    #[serde(default = "default_video_workers")]
    pub video_workers: usize,
    /// Audio transcode workers.
    #[serde(default = "default_audio_workers")]
    pub audio_workers: usize,
    /// Image processing workers.
    #[serde(default = "default_image_workers")]
    pub image_workers: usize,
    /// Document conversion workers.
    #[serde(default = "default_document_workers")]
    pub document_workers: usize,
    /// Workers for custom plugin jobs.
    #[serde(default = "default_custom_workers")]
    pub custom_workers: usize,
    /// Wall-clock timeout for a single job, in seconds.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Hours to retain completed/cancelled jobs after their end time.
    #[serde(default = "default_completed_retention_hours")]
    pub completed_retention_hours: u32,
    /// Hours to retain failed jobs after their end time.
    #[serde(default = "default_failed_retention_hours")]
    pub failed_retention_hours: u32,
    /// Interval between retention sweeps, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Directory for temporary files.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Directory for output artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_video_workers() -> usize {
    2
}

fn default_audio_workers() -> usize {
    4
}

fn default_image_workers() -> usize {
    8
}

fn default_document_workers() -> usize {
    4
}

fn default_custom_workers() -> usize {
    2
}

fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_completed_retention_hours() -> u32 {
    24
}

fn default_failed_retention_hours() -> u32 {
    168
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/data/temp")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/data/output")
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            video_workers: default_video_workers(),
            audio_workers: default_audio_workers(),
            image_workers: default_image_workers(),
            document_workers: default_document_workers(),
            custom_workers: default_custom_workers(),
            job_timeout_secs: default_job_timeout_secs(),
            completed_retention_hours: default_completed_retention_hours(),
            failed_retention_hours: default_failed_retention_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            temp_dir: default_temp_dir(),
            output_dir: default_output_dir(),
        }
    }
}

/// Plugin system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Directory scanned for dynamic plugin artifacts.
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,
    /// Path handed to every plugin's `initialize`.
    #[serde(default = "default_plugin_config_path")]
    pub config_path: PathBuf,
    /// Interval between background health probes, in seconds.
    #[serde(default = "default_health_probe_interval_secs")]
    pub health_probe_interval_secs: u64,
    /// Path to the ffmpeg binary used by the built-in transcode plugin
    /// and the streaming engines.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Path to the ffprobe binary used for media metadata.
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Path to the ImageMagick binary.
    #[serde(default = "default_magick_path")]
    pub magick_path: String,
    /// Path to the pandoc binary.
    #[serde(default = "default_pandoc_path")]
    pub pandoc_path: String,
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("/data/plugins")
}

fn default_plugin_config_path() -> PathBuf {
    PathBuf::from("/data/plugins/config.json")
}

fn default_health_probe_interval_secs() -> u64 {
    60
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_magick_path() -> String {
    "magick".to_string()
}

fn default_pandoc_path() -> String {
    "pandoc".to_string()
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            config_path: default_plugin_config_path(),
            health_probe_interval_secs: default_health_probe_interval_secs(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            magick_path: default_magick_path(),
            pandoc_path: default_pandoc_path(),
        }
    }
}

/// Radio engine defaults applied to channels that do not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Maximum number of radio channels.
    #[serde(default = "default_radio_max_channels")]
    pub max_channels: usize,
    /// Default audio bitrate in kbps.
    #[serde(default = "default_radio_bitrate")]
    pub default_bitrate_kbps: u32,
    /// Default sample rate in Hz.
    #[serde(default = "default_radio_sample_rate")]
    pub default_sample_rate: u32,
    /// Default channel count.
    #[serde(default = "default_radio_channels")]
    pub default_channels: u8,
    /// Default codec.
    #[serde(default = "default_radio_codec")]
    pub default_codec: String,
    /// Default crossfade duration in milliseconds. Zero disables it.
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: u64,
    /// Default integrated loudness target in LUFS.
    #[serde(default = "default_target_lufs")]
    pub target_lufs: f64,
}

fn default_radio_max_channels() -> usize {
    10
}

fn default_radio_bitrate() -> u32 {
    128
}

fn default_radio_sample_rate() -> u32 {
    44100
}

fn default_radio_channels() -> u8 {
    2
}

fn default_radio_codec() -> String {
    "mp3".to_string()
}

fn default_crossfade_ms() -> u64 {
    3000
}

fn default_target_lufs() -> f64 {
    -14.0
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            max_channels: default_radio_max_channels(),
            default_bitrate_kbps: default_radio_bitrate(),
            default_sample_rate: default_radio_sample_rate(),
            default_channels: default_radio_channels(),
            default_codec: default_radio_codec(),
            crossfade_ms: default_crossfade_ms(),
            target_lufs: default_target_lufs(),
        }
    }
}

/// One TV output variant (resolution + bitrate).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TvVariant {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
}

/// TV engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvConfig {
    /// Maximum number of TV channels.
    #[serde(default = "default_tv_max_channels")]
    pub max_channels: usize,
    /// Output variants, highest quality first. The first variant is the
    /// primary one teed to the broadcaster mount.
    #[serde(default = "default_tv_variants")]
    pub variants: Vec<TvVariant>,
    /// Video codec.
    #[serde(default = "default_tv_video_codec")]
    pub video_codec: String,
    /// Encoder preset.
    #[serde(default = "default_tv_preset")]
    pub video_preset: String,
    /// Audio codec.
    #[serde(default = "default_tv_audio_codec")]
    pub audio_codec: String,
    /// Audio bitrate in kbps.
    #[serde(default = "default_tv_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
    /// Segment duration in seconds.
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u32,
    /// Number of segments kept in each variant playlist.
    #[serde(default = "default_playlist_size")]
    pub playlist_size: usize,
    /// Root directory for segmented output.
    #[serde(default = "default_tv_output_dir")]
    pub output_dir: PathBuf,
    /// Hours of programming included in the EPG.
    #[serde(default = "default_epg_lookahead_hours")]
    pub epg_lookahead_hours: u32,
}

fn default_tv_max_channels() -> usize {
    5
}

fn default_tv_variants() -> Vec<TvVariant> {
    vec![
        TvVariant {
            name: "1080p".to_string(),
            width: 1920,
            height: 1080,
            bitrate_kbps: 5000,
        },
        TvVariant {
            name: "720p".to_string(),
            width: 1280,
            height: 720,
            bitrate_kbps: 2500,
        },
        TvVariant {
            name: "480p".to_string(),
            width: 854,
            height: 480,
            bitrate_kbps: 1000,
        },
    ]
}

fn default_tv_video_codec() -> String {
    "h264".to_string()
}

fn default_tv_preset() -> String {
    "fast".to_string()
}

fn default_tv_audio_codec() -> String {
    "aac".to_string()
}

fn default_tv_audio_bitrate() -> u32 {
    128
}

fn default_segment_secs() -> u32 {
    4
}

fn default_playlist_size() -> usize {
    10
}

fn default_tv_output_dir() -> PathBuf {
    PathBuf::from("/data/hls/tv")
}

fn default_epg_lookahead_hours() -> u32 {
    24
}

impl Default for TvConfig {
    fn default() -> Self {
        Self {
            max_channels: default_tv_max_channels(),
            variants: default_tv_variants(),
            video_codec: default_tv_video_codec(),
            video_preset: default_tv_preset(),
            audio_codec: default_tv_audio_codec(),
            audio_bitrate_kbps: default_tv_audio_bitrate(),
            segment_secs: default_segment_secs(),
            playlist_size: default_playlist_size(),
            output_dir: default_tv_output_dir(),
            epg_lookahead_hours: default_epg_lookahead_hours(),
        }
    }
}

/// Broadcaster fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    /// Chunks buffered per listener before it counts as stalled and is
    /// pruned.
    #[serde(default = "default_listener_buffer_chunks")]
    pub listener_buffer_chunks: usize,
    /// Chunk size in bytes used by the engine stream pumps.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_listener_buffer_chunks() -> usize {
    256
}

fn default_chunk_size() -> usize {
    4096
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            listener_buffer_chunks: default_listener_buffer_chunks(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// External DBAL service configuration (notifications, permissions, job
/// write-through).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbalConfig {
    /// Whether the DBAL adaptor is active at all.
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the DBAL daemon.
    #[serde(default = "default_dbal_url")]
    pub url: String,
    /// Bearer API key.
    #[serde(default)]
    pub api_key: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_dbal_timeout_ms")]
    pub timeout_ms: u64,
    /// Delivery attempts before a notification is dropped.
    #[serde(default = "default_dbal_retry_attempts")]
    pub retry_attempts: u32,
    /// Initial retry delay in milliseconds (doubles per attempt).
    #[serde(default = "default_dbal_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Require a DBAL permission check on mutating API calls.
    #[serde(default)]
    pub enforce_permissions: bool,
}

fn default_dbal_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_dbal_timeout_ms() -> u64 {
    5000
}

fn default_dbal_retry_attempts() -> u32 {
    3
}

fn default_dbal_retry_delay_ms() -> u64 {
    1000
}

impl Default for DbalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_dbal_url(),
            api_key: String::new(),
            timeout_ms: default_dbal_timeout_ms(),
            retry_attempts: default_dbal_retry_attempts(),
            retry_delay_ms: default_dbal_retry_delay_ms(),
            enforce_permissions: false,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub plugins: PluginConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub tv: TvConfig,
    #[serde(default)]
    pub broadcaster: BroadcasterConfig,
    #[serde(default)]
    pub dbal: DbalConfig,
}

impl AppConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::validation(format!("cannot read config {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::validation(format!("invalid config {}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Load configuration: `AIRCAST_CONFIG` file if set (or the given
    /// path), defaults otherwise, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(PathBuf::from)
            .or_else(|| std::env::var("AIRCAST_CONFIG").ok().map(PathBuf::from));

        let mut config = match file {
            Some(p) if p.exists() => Self::from_file(&p)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `AIRCAST_*` environment overrides for the most commonly
    /// deployment-tuned values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("AIRCAST_BIND_ADDRESS")
            && !addr.trim().is_empty()
        {
            self.server.bind_address = addr;
        }
        if let Ok(port) = std::env::var("AIRCAST_PORT")
            && let Ok(parsed) = port.parse::<u16>()
        {
            self.server.port = parsed;
        }
        if let Ok(dir) = std::env::var("AIRCAST_PLUGIN_DIR")
            && !dir.trim().is_empty()
        {
            self.plugins.plugin_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("AIRCAST_DBAL_URL")
            && !url.trim().is_empty()
        {
            self.dbal.url = url;
            self.dbal.enabled = true;
        }
        if let Ok(key) = std::env::var("AIRCAST_DBAL_API_KEY") {
            self.dbal.api_key = key;
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.queue.video_workers, 2);
        assert_eq!(config.queue.image_workers, 8);
        assert_eq!(config.radio.default_bitrate_kbps, 128);
        assert_eq!(config.tv.variants.len(), 3);
        assert_eq!(config.tv.variants[0].name, "1080p");
        assert!(!config.dbal.enabled);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let raw = r#"{ "server": { "port": 9000 }, "queue": { "video_workers": 1 } }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.queue.video_workers, 1);
        assert_eq!(config.queue.audio_workers, 4);
    }

    #[test]
    fn from_file_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = AppConfig::from_file(&path).unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
