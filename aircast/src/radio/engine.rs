//! Radio engine: channel lifecycle and the per-channel stream loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pipeline::{AudioSpec, Decoder, mix_crossfade, spawn_encoder};
use super::{AutoDjConfig, RadioChannelConfig, RadioChannelStatus, RadioTrack, autodj};
use crate::broadcast::StreamBroadcaster;
use crate::config::{BroadcasterConfig, PluginConfig, RadioConfig};
use crate::dbal::{DbalClient, Notification, NotificationKind};
use crate::error::{Error, Result};
use crate::jobs::JobType;
use crate::plugin::PluginRegistry;

/// PCM frame duration fed to the encoder per tick.
const FRAME_MS: u64 = 100;

/// Consecutive item failures before a channel is taken down.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Minimum interval between auto-DJ rescans while idling.
const IDLE_RESCAN_INTERVAL: Duration = Duration::from_secs(1);

struct RadioChannel {
    id: String,
    config: RwLock<RadioChannelConfig>,
    playlist: Mutex<Vec<RadioTrack>>,
    /// Index of the next playlist entry to play.
    position: Mutex<usize>,
    live: AtomicBool,
    skip_requested: AtomicBool,
    listener_count: AtomicI64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    now_playing: Mutex<Option<RadioTrack>>,
    cancel: Mutex<Option<CancellationToken>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl RadioChannel {
    fn status(&self) -> RadioChannelStatus {
        let config = self.config.read();
        RadioChannelStatus {
            id: self.id.clone(),
            name: config.name.clone(),
            tenant_id: config.tenant_id.clone(),
            live: self.live.load(Ordering::SeqCst),
            started_at: *self.started_at.lock(),
            listener_count: self.listener_count.load(Ordering::SeqCst),
            now_playing: self.now_playing.lock().clone(),
            track_count: self.playlist.lock().len(),
            codec: config.codec.clone(),
            bitrate_kbps: config.bitrate_kbps,
            stream_url: format!("/stream/{}", self.id),
        }
    }

    /// Take the next track, wrapping cyclically.
    fn advance_track(&self) -> Option<RadioTrack> {
        let playlist = self.playlist.lock();
        if playlist.is_empty() {
            return None;
        }
        let mut position = self.position.lock();
        let track = playlist[*position % playlist.len()].clone();
        *position = (*position + 1) % playlist.len();
        Some(track)
    }

    fn take_skip(&self) -> bool {
        self.skip_requested.swap(false, Ordering::SeqCst)
    }
}

/// The radio engine: channel registry plus stream-loop supervision.
pub struct RadioEngine {
    config: RadioConfig,
    tools: PluginConfig,
    broadcaster_config: BroadcasterConfig,
    channels: DashMap<String, Arc<RadioChannel>>,
    broadcaster: Arc<StreamBroadcaster>,
    registry: Arc<PluginRegistry>,
    dbal: DbalClient,
}

impl RadioEngine {
    pub fn new(
        config: RadioConfig,
        tools: PluginConfig,
        broadcaster_config: BroadcasterConfig,
        broadcaster: Arc<StreamBroadcaster>,
        registry: Arc<PluginRegistry>,
        dbal: DbalClient,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tools,
            broadcaster_config,
            channels: DashMap::new(),
            broadcaster,
            registry,
            dbal,
        })
    }

    // ========================================================================
    // Channel management
    // ========================================================================

    /// Create a channel. Returns its id; the channel starts out not live.
    pub fn create_channel(&self, mut config: RadioChannelConfig) -> Result<String> {
        if config.name.trim().is_empty() {
            return Err(Error::validation("channel name must not be empty"));
        }
        if config.tenant_id.trim().is_empty() {
            return Err(Error::validation("tenant id is required"));
        }
        if self.channels.len() >= self.config.max_channels {
            return Err(Error::conflict(format!(
                "channel limit reached ({})",
                self.config.max_channels
            )));
        }
        if config.bitrate_kbps == 0 {
            config.bitrate_kbps = self.config.default_bitrate_kbps;
        }
        if config.sample_rate == 0 {
            config.sample_rate = self.config.default_sample_rate;
        }
        if config.channels == 0 {
            config.channels = self.config.default_channels;
        }

        let id = format!(
            "radio-{}",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        self.channels.insert(
            id.clone(),
            Arc::new(RadioChannel {
                id: id.clone(),
                config: RwLock::new(config),
                playlist: Mutex::new(Vec::new()),
                position: Mutex::new(0),
                live: AtomicBool::new(false),
                skip_requested: AtomicBool::new(false),
                listener_count: AtomicI64::new(0),
                started_at: Mutex::new(None),
                now_playing: Mutex::new(None),
                cancel: Mutex::new(None),
                loop_task: Mutex::new(None),
            }),
        );
        info!(channel = %id, "radio channel created");
        Ok(id)
    }

    /// Delete a stopped channel. Live channels must be stopped first.
    pub fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        if channel.live.load(Ordering::SeqCst) {
            return Err(Error::conflict(format!(
                "channel {channel_id} is live; stop it before deleting"
            )));
        }
        self.channels.remove(channel_id);
        info!(channel = %channel_id, "radio channel deleted");
        Ok(())
    }

    /// Update channel configuration. Encoding changes take effect on the
    /// next item boundary (the loop re-reads config per encoder session).
    pub fn update_channel(&self, channel_id: &str, config: RadioChannelConfig) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        if config.name.trim().is_empty() {
            return Err(Error::validation("channel name must not be empty"));
        }
        *channel.config.write() = config;
        Ok(())
    }

    pub fn channel_status(&self, channel_id: &str) -> Result<RadioChannelStatus> {
        Ok(self.get_channel(channel_id)?.status())
    }

    pub fn list_channels(&self, tenant_id: Option<&str>) -> Vec<RadioChannelStatus> {
        let mut statuses: Vec<RadioChannelStatus> = self
            .channels
            .iter()
            .map(|c| c.status())
            .filter(|s| tenant_id.is_none_or(|t| s.tenant_id == t))
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    // ========================================================================
    // Streaming control
    // ========================================================================

    /// Start streaming a channel; returns the stream URL.
    ///
    /// Idempotent: a second start on a live channel is a no-op that returns
    /// the URL. A channel started with an empty playlist enters live and
    /// idles (rescanning via auto-DJ when configured) until tracks exist.
    pub async fn start_channel(self: &Arc<Self>, channel_id: &str) -> Result<String> {
        let channel = self.get_channel(channel_id)?;
        let stream_url = format!("/stream/{channel_id}");

        if channel.live.swap(true, Ordering::SeqCst) {
            return Ok(stream_url);
        }

        self.broadcaster.create_mount(channel_id);
        *channel.started_at.lock() = Some(Utc::now());

        let cancel = CancellationToken::new();
        *channel.cancel.lock() = Some(cancel.clone());

        // Streaming-capable plugins get the lifecycle hook.
        if let Some(plugin) = self.registry.find_streaming(JobType::AudioTranscode) {
            let source = std::collections::HashMap::new();
            let output = std::collections::HashMap::new();
            if let Err(e) = plugin.start_stream(channel_id, &source, &output).await {
                debug!(channel = %channel_id, "stream plugin hook: {}", e);
            }
        }

        let engine = self.clone();
        let loop_channel = channel.clone();
        let task = tokio::spawn(async move {
            engine.run_loop(loop_channel, cancel).await;
        });
        *channel.loop_task.lock() = Some(task);

        let tenant_id = channel.config.read().tenant_id.clone();
        self.dbal.notify(Notification::channel(
            NotificationKind::StreamStarted,
            tenant_id,
            channel_id,
            json!({ "url": stream_url }),
        ));
        info!(channel = %channel_id, "radio channel started");
        Ok(stream_url)
    }

    /// Stop streaming a channel. Idempotent.
    pub async fn stop_channel(&self, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        if !channel.live.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(cancel) = channel.cancel.lock().take() {
            cancel.cancel();
        }
        let task = channel.loop_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!(channel = %channel_id, "stream loop did not exit in time");
            }
        }

        self.broadcaster.remove_mount(channel_id);
        *channel.now_playing.lock() = None;

        if let Some(plugin) = self.registry.find_streaming(JobType::AudioTranscode) {
            if let Err(e) = plugin.stop_stream(channel_id).await {
                debug!(channel = %channel_id, "stream plugin hook: {}", e);
            }
        }

        let tenant_id = channel.config.read().tenant_id.clone();
        self.dbal.notify(Notification::channel(
            NotificationKind::StreamStopped,
            tenant_id,
            channel_id,
            serde_json::Value::Null,
        ));
        info!(channel = %channel_id, "radio channel stopped");
        Ok(())
    }

    /// Stop every live channel. Daemon shutdown path.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.channels.iter().map(|c| c.id.clone()).collect();
        for id in ids {
            if let Err(e) = self.stop_channel(&id).await {
                warn!(channel = %id, "shutdown stop failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Playlist management
    // ========================================================================

    pub fn set_playlist(&self, channel_id: &str, tracks: Vec<RadioTrack>) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        *channel.playlist.lock() = tracks;
        *channel.position.lock() = 0;
        Ok(())
    }

    /// Insert a track; `position` past the end (or `None`) appends.
    pub fn add_track(
        &self,
        channel_id: &str,
        track: RadioTrack,
        position: Option<usize>,
    ) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let mut playlist = channel.playlist.lock();
        let index = position.unwrap_or(playlist.len()).min(playlist.len());
        playlist.insert(index, track);
        Ok(())
    }

    pub fn remove_track(&self, channel_id: &str, track_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let mut playlist = channel.playlist.lock();
        let before = playlist.len();
        playlist.retain(|t| t.id != track_id);
        if playlist.len() == before {
            return Err(Error::not_found("track", track_id));
        }
        Ok(())
    }

    /// Skip the current track at the next frame boundary.
    pub fn skip_track(&self, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        if !channel.live.load(Ordering::SeqCst) {
            return Err(Error::conflict(format!(
                "channel {channel_id} is not live"
            )));
        }
        channel.skip_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_playlist(&self, channel_id: &str) -> Result<Vec<RadioTrack>> {
        Ok(self.get_channel(channel_id)?.playlist.lock().clone())
    }

    pub fn now_playing(&self, channel_id: &str) -> Result<Option<RadioTrack>> {
        Ok(self.get_channel(channel_id)?.now_playing.lock().clone())
    }

    /// Enable or disable auto-DJ. Enabling with an empty playlist scans
    /// immediately so `start` has something to play.
    pub fn set_auto_dj(
        &self,
        channel_id: &str,
        enabled: bool,
        folders: Vec<String>,
        shuffle: bool,
    ) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let auto_dj = enabled.then(|| AutoDjConfig { folders, shuffle });
        channel.config.write().auto_dj = auto_dj.clone();
        if let Some(auto_dj) = auto_dj {
            let mut playlist = channel.playlist.lock();
            if playlist.is_empty() {
                *playlist = autodj::scan(&auto_dj);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Listener bookkeeping from the HTTP adaptor. Never drops below zero.
    pub fn update_listener_count(&self, channel_id: &str, delta: i64) {
        if let Some(channel) = self.channels.get(channel_id) {
            let count = &channel.listener_count;
            let mut current = count.load(Ordering::SeqCst);
            loop {
                let next = (current + delta).max(0);
                match count.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    pub fn total_listeners(&self) -> i64 {
        self.channels
            .iter()
            .map(|c| c.listener_count.load(Ordering::SeqCst))
            .sum()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Codec of a channel, for the stream endpoint's Content-Type.
    pub fn channel_codec(&self, channel_id: &str) -> Option<String> {
        self.channels
            .get(channel_id)
            .map(|c| c.config.read().codec.clone())
    }

    fn get_channel(&self, channel_id: &str) -> Result<Arc<RadioChannel>> {
        self.channels
            .get(channel_id)
            .map(|c| c.clone())
            .ok_or_else(|| Error::not_found("radio channel", channel_id))
    }

    // ========================================================================
    // Stream loop
    // ========================================================================

    async fn run_loop(self: Arc<Self>, channel: Arc<RadioChannel>, cancel: CancellationToken) {
        let mut consecutive_failures = 0u32;

        while !cancel.is_cancelled() && channel.live.load(Ordering::SeqCst) {
            let (spec, codec, bitrate, lufs, crossfade_ms) = {
                let config = channel.config.read();
                (
                    AudioSpec {
                        sample_rate: config.sample_rate,
                        channels: config.channels,
                    },
                    config.codec.clone(),
                    config.bitrate_kbps,
                    config.target_lufs,
                    config.crossfade_ms,
                )
            };

            let mut encoder = match spawn_encoder(&self.tools.ffmpeg_path, spec, &codec, bitrate) {
                Ok(encoder) => encoder,
                Err(e) => {
                    warn!(channel = %channel.id, "encoder spawn failed: {}", e);
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        self.take_down(&channel, "encoder failed repeatedly").await;
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let Some(mut encoder_stdin) = encoder.take_stdin() else {
                self.take_down(&channel, "encoder has no stdin").await;
                return;
            };

            // Pump encoded output into the broadcaster mount. A removed
            // mount ends the pump, which in turn stops the session.
            let pump = {
                let Some(mut chunks) =
                    encoder.take_stdout_chunks(self.broadcaster_config.chunk_size)
                else {
                    self.take_down(&channel, "encoder has no stdout").await;
                    return;
                };
                let broadcaster = self.broadcaster.clone();
                let mount = channel.id.clone();
                let pump_cancel = cancel.clone();
                tokio::spawn(async move {
                    while let Ok(Some(chunk)) = chunks.next_chunk().await {
                        if !broadcaster.write(&mount, chunk) {
                            pump_cancel.cancel();
                            break;
                        }
                    }
                })
            };

            let session = self
                .feed_session(
                    &channel,
                    &cancel,
                    &mut encoder_stdin,
                    spec,
                    &codec,
                    bitrate,
                    lufs,
                    crossfade_ms,
                    &mut consecutive_failures,
                )
                .await;

            drop(encoder_stdin);
            let _ = tokio::time::timeout(Duration::from_secs(2), encoder.wait()).await;
            encoder.kill().await;
            let _ = pump.await;

            match session {
                SessionEnd::Stopped => return,
                SessionEnd::EncoderDied => {
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        self.take_down(&channel, "encoder failed repeatedly").await;
                        return;
                    }
                    // Respawn the encoder and carry on.
                }
                // Encoding config changed at an item boundary: rebuild the
                // encoder with the new settings.
                SessionEnd::Reconfigure => {}
                SessionEnd::Down(reason) => {
                    self.take_down(&channel, &reason).await;
                    return;
                }
            }
        }
    }

    /// Feed PCM into one encoder session: track iteration, crossfade
    /// mixing, real-time pacing, skip and idle handling.
    #[allow(clippy::too_many_arguments)]
    async fn feed_session(
        &self,
        channel: &Arc<RadioChannel>,
        cancel: &CancellationToken,
        encoder_stdin: &mut tokio::process::ChildStdin,
        spec: AudioSpec,
        codec: &str,
        bitrate: u32,
        lufs: f64,
        crossfade_ms: u64,
        consecutive_failures: &mut u32,
    ) -> SessionEnd {
        let frame_bytes = spec.frame_bytes(FRAME_MS);
        let fade_total_frames = (crossfade_ms * spec.sample_rate as u64 / 1000) as usize;
        let fade_trigger_bytes = spec.frame_bytes(crossfade_ms);

        let mut current: Option<Decoder> = None;
        let mut next: Option<Decoder> = None;
        let mut fade_pos = 0usize;
        let mut last_scan: Option<Instant> = None;

        let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(d) = current.take() { d.kill().await; }
                    if let Some(d) = next.take() { d.kill().await; }
                    return SessionEnd::Stopped;
                }
                _ = ticker.tick() => {}
            }

            if channel.take_skip() {
                if let Some(d) = current.take() {
                    d.kill().await;
                }
                if let Some(d) = next.take() {
                    d.kill().await;
                }
                fade_pos = 0;
            }

            if current.is_none() {
                // Item boundary: encoding changes take effect here.
                if self.encoding_changed(channel, spec, codec, bitrate, lufs, crossfade_ms) {
                    return SessionEnd::Reconfigure;
                }
                let Some(track) = self.pick_track(channel, &mut last_scan) else {
                    // Empty playlist: stay live, produce nothing, rescan.
                    continue;
                };
                match Decoder::spawn(
                    &self.tools.ffmpeg_path,
                    &self.tools.ffprobe_path,
                    track,
                    spec,
                    lufs,
                )
                .await
                {
                    Ok(decoder) => {
                        *consecutive_failures = 0;
                        self.set_now_playing(channel, decoder.track.clone());
                        current = Some(decoder);
                    }
                    Err(e) => {
                        warn!(channel = %channel.id, "decoder spawn failed: {}", e);
                        *consecutive_failures += 1;
                        if *consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            return SessionEnd::Down(format!(
                                "{MAX_CONSECUTIVE_FAILURES} consecutive track failures"
                            ));
                        }
                        continue;
                    }
                }
            }

            let Some(cur) = current.as_mut() else { continue };
            let cur_frame = match cur.read_frame(frame_bytes).await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(channel = %channel.id, "decoder read failed: {}", e);
                    if let Some(d) = current.take() {
                        d.kill().await;
                    }
                    *consecutive_failures += 1;
                    if *consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return SessionEnd::Down(format!(
                            "{MAX_CONSECUTIVE_FAILURES} consecutive track failures"
                        ));
                    }
                    continue;
                }
            };

            // Arm the crossfade when the tail of the current track is near.
            if fade_total_frames > 0
                && next.is_none()
                && let Some(remaining) = cur.remaining_bytes()
                && remaining <= fade_trigger_bytes as u64
                && let Some(track) = self.pick_track(channel, &mut last_scan)
            {
                match Decoder::spawn(
                    &self.tools.ffmpeg_path,
                    &self.tools.ffprobe_path,
                    track,
                    spec,
                    lufs,
                )
                .await
                {
                    Ok(decoder) => {
                        next = Some(decoder);
                        fade_pos = 0;
                    }
                    Err(e) => {
                        warn!(channel = %channel.id, "next-track decoder failed: {}", e);
                        *consecutive_failures += 1;
                    }
                }
            }

            let out;
            let mut promote = false;
            if let Some(nx) = next.as_mut() {
                let next_frame = nx.read_frame(frame_bytes).await.unwrap_or_default();
                out = mix_crossfade(
                    &cur_frame,
                    &next_frame,
                    fade_pos,
                    fade_total_frames,
                    spec.channels as usize,
                );
                fade_pos += spec.sample_frames(frame_bytes);
                if cur_frame.len() < frame_bytes || fade_pos >= fade_total_frames {
                    promote = true;
                }
            } else if cur_frame.is_empty() {
                // Track ended with no crossfade partner.
                if let Some(d) = current.take() {
                    d.kill().await;
                }
                continue;
            } else {
                if cur_frame.len() < frame_bytes
                    && let Some(d) = current.take()
                {
                    d.kill().await;
                }
                out = cur_frame;
            }

            if promote {
                if let Some(d) = current.take() {
                    d.kill().await;
                }
                current = next.take();
                fade_pos = 0;
                if let Some(cur) = &current {
                    self.set_now_playing(channel, cur.track.clone());
                }
            }

            if !out.is_empty() && encoder_stdin.write_all(&out).await.is_err() {
                warn!(channel = %channel.id, "encoder rejected PCM frame");
                if let Some(d) = current.take() {
                    d.kill().await;
                }
                if let Some(d) = next.take() {
                    d.kill().await;
                }
                *consecutive_failures += 1;
                return SessionEnd::EncoderDied;
            }
        }
    }

    /// Whether the channel's encoding settings diverged from the running
    /// session's.
    fn encoding_changed(
        &self,
        channel: &Arc<RadioChannel>,
        spec: AudioSpec,
        codec: &str,
        bitrate: u32,
        lufs: f64,
        crossfade_ms: u64,
    ) -> bool {
        let config = channel.config.read();
        config.codec != codec
            || config.bitrate_kbps != bitrate
            || config.sample_rate != spec.sample_rate
            || config.channels != spec.channels
            || config.target_lufs != lufs
            || config.crossfade_ms != crossfade_ms
    }

    /// Next track, rescanning via auto-DJ (rate-limited) when the playlist
    /// is empty.
    fn pick_track(
        &self,
        channel: &Arc<RadioChannel>,
        last_scan: &mut Option<Instant>,
    ) -> Option<RadioTrack> {
        if let Some(track) = channel.advance_track() {
            return Some(track);
        }
        let auto_dj = channel.config.read().auto_dj.clone()?;
        if last_scan.is_some_and(|t| t.elapsed() < IDLE_RESCAN_INTERVAL) {
            return None;
        }
        *last_scan = Some(Instant::now());
        let tracks = autodj::scan(&auto_dj);
        if tracks.is_empty() {
            return None;
        }
        *channel.playlist.lock() = tracks;
        *channel.position.lock() = 0;
        channel.advance_track()
    }

    fn set_now_playing(&self, channel: &Arc<RadioChannel>, track: RadioTrack) {
        debug!(channel = %channel.id, track = %track.title, "now playing");
        *channel.now_playing.lock() = Some(track.clone());
        let tenant_id = channel.config.read().tenant_id.clone();
        self.dbal.notify(Notification::channel(
            NotificationKind::TrackChanged,
            tenant_id,
            channel.id.clone(),
            json!({ "trackId": track.id, "title": track.title, "artist": track.artist }),
        ));
    }

    /// Failure path: the loop takes the channel down itself.
    async fn take_down(&self, channel: &Arc<RadioChannel>, reason: &str) {
        warn!(channel = %channel.id, reason = %reason, "taking radio channel down");
        channel.live.store(false, Ordering::SeqCst);
        *channel.now_playing.lock() = None;
        self.broadcaster.remove_mount(&channel.id);
        let tenant_id = channel.config.read().tenant_id.clone();
        self.dbal.notify(Notification::channel(
            NotificationKind::StreamStopped,
            tenant_id,
            channel.id.clone(),
            json!({ "reason": reason }),
        ));
    }
}

enum SessionEnd {
    /// Stop requested; the loop exits cleanly.
    Stopped,
    /// The encoder process died; the session loop respawns it.
    EncoderDied,
    /// Encoding config changed at an item boundary; respawn the encoder.
    Reconfigure,
    /// Too many consecutive failures; channel goes down.
    Down(String),
}
