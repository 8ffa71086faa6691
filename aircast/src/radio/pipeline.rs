//! Radio audio pipeline: PCM decode, sample-granularity crossfade mixing,
//! and the persistent channel encoder.
//!
//! Every track is decoded to interleaved s16le PCM (through a loudness
//! normalization filter targeting the channel's LUFS value). The loop mixes
//! PCM in software during crossfades and feeds one long-lived encoder
//! process whose output is the channel's byte stream.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::process::ChildStdout;

use process_utils::{ChunkReader, StreamingChild, command};

use super::RadioTrack;
use crate::error::{Error, Result};
use crate::media::{audio_encoder_name, audio_muxer_name, probe_duration_secs};

/// PCM stream parameters of a channel.
#[derive(Debug, Clone, Copy)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u8,
}

impl AudioSpec {
    /// Bytes per second of s16le PCM.
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * 2
    }

    /// Bytes in a frame of the given duration.
    pub fn frame_bytes(&self, ms: u64) -> usize {
        (self.bytes_per_second() * ms / 1000) as usize
    }

    /// Sample frames (one per channel group) in a byte count.
    pub fn sample_frames(&self, bytes: usize) -> usize {
        bytes / (self.channels as usize * 2)
    }
}

/// Decoder child for one track: file → loudnorm → s16le PCM on stdout.
pub struct Decoder {
    pub track: RadioTrack,
    child: StreamingChild,
    reader: ChunkReader<ChildStdout>,
    /// Total PCM bytes expected, when the track duration is known.
    pub total_bytes: Option<u64>,
    pub consumed_bytes: u64,
}

impl Decoder {
    /// Spawn a decoder for `track`. The duration is probed first (when the
    /// track does not declare one) so the loop can time the crossfade.
    pub async fn spawn(
        ffmpeg_path: &str,
        ffprobe_path: &str,
        track: RadioTrack,
        spec: AudioSpec,
        target_lufs: f64,
    ) -> Result<Self> {
        let duration_secs = match track.duration_secs {
            Some(d) => Some(d),
            None => probe_duration_secs(ffprobe_path, &track.path).await,
        };
        let total_bytes = duration_secs.map(|d| (d * spec.bytes_per_second() as f64) as u64);

        let mut cmd = command(ffmpeg_path);
        cmd.args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostats",
            "-i",
            &track.path,
            "-af",
            &format!("loudnorm=I={target_lufs}:TP=-1.5:LRA=11"),
            "-f",
            "s16le",
            "-ar",
            &spec.sample_rate.to_string(),
            "-ac",
            &spec.channels.to_string(),
            "pipe:1",
        ]);

        let mut child = StreamingChild::spawn(cmd, false)?;
        let reader = child
            .take_stdout_chunks(8192)
            .ok_or_else(|| Error::transcode("decoder has no stdout"))?;

        Ok(Self {
            track,
            child,
            reader,
            total_bytes,
            consumed_bytes: 0,
        })
    }

    /// Read up to `len` bytes of PCM. An empty buffer means the track
    /// ended.
    pub async fn read_frame(&mut self, len: usize) -> std::io::Result<Bytes> {
        let frame = self.reader.read_up_to(len).await?;
        self.consumed_bytes += frame.len() as u64;
        Ok(frame)
    }

    /// PCM bytes left before the track ends, when the duration is known.
    pub fn remaining_bytes(&self) -> Option<u64> {
        self.total_bytes
            .map(|total| total.saturating_sub(self.consumed_bytes))
    }

    pub async fn kill(mut self) {
        self.child.kill().await;
    }
}

/// The persistent channel encoder: s16le PCM on stdin → encoded stream on
/// stdout.
pub fn spawn_encoder(
    ffmpeg_path: &str,
    spec: AudioSpec,
    codec: &str,
    bitrate_kbps: u32,
) -> Result<StreamingChild> {
    let mut cmd = command(ffmpeg_path);
    cmd.args([
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-f",
        "s16le",
        "-ar",
        &spec.sample_rate.to_string(),
        "-ac",
        &spec.channels.to_string(),
        "-i",
        "pipe:0",
        "-c:a",
        audio_encoder_name(codec),
        "-b:a",
        &format!("{bitrate_kbps}k"),
        "-f",
        audio_muxer_name(codec),
        "pipe:1",
    ]);
    Ok(StreamingChild::spawn(cmd, true)?)
}

fn sample_at(buf: &[u8], index: usize) -> i16 {
    let offset = index * 2;
    if offset + 1 < buf.len() {
        i16::from_le_bytes([buf[offset], buf[offset + 1]])
    } else {
        0
    }
}

/// Mix the tail of the current track with the head of the next at sample
/// granularity with linear equal-gain ramps.
///
/// `fade_pos` is the sample-frame offset already faded, `fade_total` the
/// whole fade length in sample frames. Buffers shorter than the frame (EOF
/// tails) read as silence.
pub fn mix_crossfade(
    current: &[u8],
    incoming: &[u8],
    fade_pos: usize,
    fade_total: usize,
    channels: usize,
) -> Bytes {
    let len = current.len().max(incoming.len());
    let samples = len / 2;
    let channels = channels.max(1);
    let fade_total = fade_total.max(1);
    let mut out = BytesMut::with_capacity(samples * 2);

    for i in 0..samples {
        let frame_index = fade_pos + i / channels;
        let gain_in = (frame_index as f32 / fade_total as f32).clamp(0.0, 1.0);
        let gain_out = 1.0 - gain_in;
        let mixed = sample_at(current, i) as f32 * gain_out + sample_at(incoming, i) as f32 * gain_in;
        out.put_i16_le(mixed.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
    }
    out.freeze()
}
