//! ffmpeg-backed transcode plugin for video and audio jobs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use process_utils::{ProcessError, StreamingChild, command};

use crate::error::{Error, Result};
use crate::jobs::{JobParams, JobType};
use crate::media::{audio_encoder_name, audio_muxer_name, probe_duration_secs, video_encoder_name};
use crate::plugin::{Plugin, PluginDescriptor, ProcessRequest, ProgressSink};

/// Transcode plugin driving the ffmpeg CLI.
pub struct FfmpegPlugin {
    descriptor: PluginDescriptor,
    ffmpeg_path: String,
    ffprobe_path: String,
    tool_timeout: Duration,
    /// Cancel tokens of active jobs, keyed by job id.
    active: DashMap<String, CancellationToken>,
    /// Channels with an active stream lifecycle.
    streams: DashMap<String, ()>,
}

impl FfmpegPlugin {
    pub fn new(ffmpeg_path: String, ffprobe_path: String, tool_timeout: Duration) -> Self {
        Self {
            descriptor: PluginDescriptor {
                id: "ffmpeg".to_string(),
                name: "FFmpeg Transcoder".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                author: "aircast".to_string(),
                job_types: vec![JobType::VideoTranscode, JobType::AudioTranscode],
                capability_tags: vec!["streaming".to_string(), "hardware-accel".to_string()],
                input_formats: vec![
                    "mp4".into(),
                    "mkv".into(),
                    "webm".into(),
                    "avi".into(),
                    "mov".into(),
                    "mp3".into(),
                    "aac".into(),
                    "flac".into(),
                    "wav".into(),
                    "ogg".into(),
                ],
                output_formats: vec![
                    "mp4".into(),
                    "mkv".into(),
                    "webm".into(),
                    "mp3".into(),
                    "aac".into(),
                    "ogg".into(),
                    "flac".into(),
                    "wav".into(),
                ],
                builtin: true,
            },
            ffmpeg_path,
            ffprobe_path,
            tool_timeout,
            active: DashMap::new(),
            streams: DashMap::new(),
        }
    }

    async fn run_transcode(
        &self,
        request: &ProcessRequest,
        sink: &ProgressSink,
        args: Vec<String>,
        input: &str,
        output: &str,
    ) -> Result<String> {
        let cancel = CancellationToken::new();
        self.active.insert(request.job_id.clone(), cancel.clone());

        let duration_ms = probe_duration_secs(&self.ffprobe_path, input)
            .await
            .map(|secs| (secs * 1000.0) as u64);
        sink.report(0, "transcoding");

        let mut cmd = command(&self.ffmpeg_path);
        cmd.args(&args);

        let result = async {
            let mut child = StreamingChild::spawn(cmd, false)?;
            if let Some(stdout) = child.take_stdout() {
                let sink = sink.clone();
                tokio::spawn(async move {
                    track_progress(stdout, duration_ms, sink).await;
                });
            }
            child.wait_with_deadline(self.tool_timeout, &cancel).await?;
            Ok::<_, ProcessError>(())
        }
        .await;

        self.active.remove(&request.job_id);

        match result {
            Ok(()) => {
                sink.report(100, "done");
                Ok(output.to_string())
            }
            Err(e) => {
                warn!(job = %request.job_id, "ffmpeg transcode failed: {}", e);
                Err(e.into())
            }
        }
    }
}

/// Follow ffmpeg `-progress pipe:1` output and translate it into percent
/// and ETA reports.
async fn track_progress(
    stdout: tokio::process::ChildStdout,
    duration_ms: Option<u64>,
    sink: ProgressSink,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut speed: f64 = 1.0;
    while let Ok(Some(line)) = lines.next_line().await {
        // ffmpeg's out_time_ms field is microseconds despite the name;
        // out_time_us is the honest spelling in newer builds.
        let out_us = line
            .strip_prefix("out_time_us=")
            .or_else(|| line.strip_prefix("out_time_ms="))
            .and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(raw) = line.strip_prefix("speed=")
            && let Ok(parsed) = raw.trim().trim_end_matches('x').parse::<f64>()
            && parsed > 0.0
        {
            speed = parsed;
        }

        if let (Some(out_us), Some(total_ms)) = (out_us, duration_ms)
            && total_ms > 0
        {
            let out_ms = out_us / 1000;
            let percent = ((out_ms as f64 / total_ms as f64) * 100.0).min(99.0) as u8;
            let remaining_ms = total_ms.saturating_sub(out_ms);
            let eta_secs = ((remaining_ms as f64 / 1000.0) / speed).ceil() as u64;
            sink.report_with_eta(percent, "transcoding", eta_secs);
        }
    }
}

/// ffmpeg argv for a video transcode request.
fn video_args(params: &JobParams) -> Option<Vec<String>> {
    let JobParams::VideoTranscode {
        input,
        output,
        video_codec,
        audio_codec,
        bitrate_kbps,
        resolution,
        container,
        hwaccel,
    } = params
    else {
        return None;
    };

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostats".into(),
        "-y".into(),
    ];
    if let Some(accel) = hwaccel {
        args.extend(["-hwaccel".into(), accel.clone()]);
    }
    args.extend(["-i".into(), input.clone()]);
    args.extend(["-c:v".into(), video_encoder_name(video_codec).to_string()]);
    args.extend(["-b:v".into(), format!("{bitrate_kbps}k")]);
    if let Some(res) = resolution {
        args.extend(["-s".into(), res.clone()]);
    }
    args.extend(["-c:a".into(), audio_encoder_name(audio_codec).to_string()]);
    args.extend(["-f".into(), container.clone()]);
    args.extend(["-progress".into(), "pipe:1".into()]);
    args.push(output.clone());
    Some(args)
}

/// ffmpeg argv for an audio transcode request.
fn audio_args(params: &JobParams) -> Option<Vec<String>> {
    let JobParams::AudioTranscode {
        input,
        output,
        codec,
        bitrate_kbps,
        sample_rate,
        channels,
    } = params
    else {
        return None;
    };

    Some(vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostats".into(),
        "-y".into(),
        "-i".into(),
        input.clone(),
        "-vn".into(),
        "-c:a".into(),
        audio_encoder_name(codec).to_string(),
        "-b:a".into(),
        format!("{bitrate_kbps}k"),
        "-ar".into(),
        sample_rate.to_string(),
        "-ac".into(),
        channels.to_string(),
        "-f".into(),
        audio_muxer_name(codec).to_string(),
        "-progress".into(),
        "pipe:1".into(),
        output.clone(),
    ])
}

#[async_trait]
impl Plugin for FfmpegPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn initialize(&self, _config_path: &Path) -> Result<()> {
        if !super::probe_tool(&self.ffmpeg_path, "-version").await {
            return Err(Error::plugin(format!(
                "ffmpeg binary '{}' is not runnable",
                self.ffmpeg_path
            )));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        self.active.clear();
        self.streams.clear();
    }

    async fn is_healthy(&self) -> bool {
        super::probe_tool(&self.ffmpeg_path, "-version").await
    }

    fn can_handle(&self, params: &JobParams) -> bool {
        matches!(
            params,
            JobParams::VideoTranscode { .. } | JobParams::AudioTranscode { .. }
        )
    }

    async fn process(&self, request: &ProcessRequest, sink: &ProgressSink) -> Result<String> {
        let (args, input, output) = match &request.params {
            p @ JobParams::VideoTranscode { input, output, .. } => {
                (video_args(p), input.as_str(), output.as_str())
            }
            p @ JobParams::AudioTranscode { input, output, .. } => {
                (audio_args(p), input.as_str(), output.as_str())
            }
            _ => {
                return Err(Error::plugin(
                    "ffmpeg plugin received a non-transcode request",
                ));
            }
        };
        let args = args.ok_or_else(|| Error::internal("argument assembly mismatch"))?;
        self.run_transcode(request, sink, args, input, output).await
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        match self.active.get(job_id) {
            Some(token) => {
                debug!(job = %job_id, "cancelling active ffmpeg job");
                token.cancel();
                Ok(())
            }
            None => Err(Error::not_found("active job", job_id)),
        }
    }

    async fn start_stream(
        &self,
        channel_id: &str,
        _source: &HashMap<String, String>,
        _output: &HashMap<String, String>,
    ) -> Result<String> {
        self.streams.insert(channel_id.to_string(), ());
        Ok(format!("/stream/{channel_id}"))
    }

    async fn stop_stream(&self, channel_id: &str) -> Result<()> {
        self.streams.remove(channel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_params() -> JobParams {
        JobParams::VideoTranscode {
            input: "/in/a.mkv".to_string(),
            output: "/out/a.mp4".to_string(),
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            bitrate_kbps: 2500,
            resolution: Some("1280x720".to_string()),
            container: "mp4".to_string(),
            hwaccel: Some("vaapi".to_string()),
        }
    }

    #[test]
    fn video_command_shape() {
        let args = video_args(&video_params()).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-hwaccel vaapi"));
        assert!(joined.contains("-i /in/a.mkv"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-b:v 2500k"));
        assert!(joined.contains("-s 1280x720"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-f mp4"));
        assert!(joined.ends_with("/out/a.mp4"));
    }

    #[test]
    fn audio_command_shape() {
        let params = JobParams::AudioTranscode {
            input: "/in/a.flac".to_string(),
            output: "/out/a.mp3".to_string(),
            codec: "mp3".to_string(),
            bitrate_kbps: 192,
            sample_rate: 48000,
            channels: 2,
        };
        let args = audio_args(&params).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-c:a libmp3lame"));
        assert!(joined.contains("-b:a 192k"));
        assert!(joined.contains("-ar 48000"));
        assert!(joined.contains("-ac 2"));
        assert!(joined.contains("-f mp3"));
    }

    #[test]
    fn encoder_mapping() {
        assert_eq!(video_encoder_name("h264"), "libx264");
        assert_eq!(video_encoder_name("hevc"), "libx265");
        assert_eq!(video_encoder_name("prores"), "prores");
        assert_eq!(audio_encoder_name("mp3"), "libmp3lame");
        assert_eq!(audio_muxer_name("aac"), "adts");
        assert_eq!(audio_muxer_name("opus"), "ogg");
    }

    #[test]
    fn declines_foreign_params() {
        let plugin = FfmpegPlugin::new(
            "ffmpeg".to_string(),
            "ffprobe".to_string(),
            Duration::from_secs(60),
        );
        let params = JobParams::Custom {
            values: HashMap::from([("k".to_string(), "v".to_string())]),
        };
        assert!(!plugin.can_handle(&params));
        assert!(plugin.can_handle(&video_params()));
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let plugin = FfmpegPlugin::new(
            "ffmpeg".to_string(),
            "ffprobe".to_string(),
            Duration::from_secs(60),
        );
        assert_eq!(
            plugin.cancel("ghost").await.unwrap_err().code(),
            "not_found"
        );
    }
}
