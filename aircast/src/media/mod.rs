//! Shared media helpers: codec name mapping, content types, duration
//! probing. Used by the transcode plugin and both streaming engines.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use process_utils::{StreamingChild, command};

/// Map a request codec name onto an ffmpeg encoder name.
pub fn video_encoder_name(codec: &str) -> &str {
    match codec {
        "h264" => "libx264",
        "h265" | "hevc" => "libx265",
        "vp9" => "libvpx-vp9",
        "av1" => "libaom-av1",
        other => other,
    }
}

/// Map a request codec name onto an ffmpeg audio encoder name.
pub fn audio_encoder_name(codec: &str) -> &str {
    match codec {
        "mp3" => "libmp3lame",
        "opus" => "libopus",
        "vorbis" | "ogg" => "libvorbis",
        other => other,
    }
}

/// Muxer for audio-only output of the given codec.
pub fn audio_muxer_name(codec: &str) -> &str {
    match codec {
        "aac" => "adts",
        "opus" | "vorbis" | "ogg" => "ogg",
        "mp3" => "mp3",
        "flac" => "flac",
        "wav" => "wav",
        other => other,
    }
}

/// HTTP Content-Type for a continuous audio stream of the given codec.
pub fn audio_content_type(codec: &str) -> &'static str {
    match codec {
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        "ogg" | "vorbis" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Extensions treated as audio files by the auto-DJ scanner.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "opus", "wav", "aac", "m4a"];

/// Probe a media file's duration in seconds via ffprobe. `None` when the
/// container does not report one or the probe fails.
pub async fn probe_duration_secs(ffprobe_path: &str, input: &str) -> Option<f64> {
    let mut cmd = command(ffprobe_path);
    cmd.args([
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
        input,
    ]);
    let mut child = StreamingChild::spawn(cmd, false).ok()?;
    let stdout = child.take_stdout()?;
    let mut lines = BufReader::new(stdout).lines();
    let line = lines.next_line().await.ok().flatten();
    let _ = child
        .wait_with_deadline(Duration::from_secs(10), &CancellationToken::new())
        .await;
    line.and_then(|l| l.trim().parse::<f64>().ok())
}
