//! TV engine: channel lifecycle and the scheduled stream loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::epg::{self, EpgEntry};
use super::playlist::{VariantPlaylist, write_master};
use super::schedule::{current_entry, next_entry_after, offset_secs, sort_schedule};
use super::{
    Bumpers, CommercialConfig, TvChannelConfig, TvChannelStatus, TvProgram, TvScheduleEntry,
    TvStreamUrls,
};
use crate::broadcast::StreamBroadcaster;
use crate::config::{BroadcasterConfig, PluginConfig, TvConfig, TvVariant};
use crate::dbal::{DbalClient, Notification, NotificationKind};
use crate::error::{Error, Result};
use crate::jobs::JobType;
use crate::media::{audio_encoder_name, probe_duration_secs, video_encoder_name};
use crate::plugin::PluginRegistry;

use process_utils::{StreamingChild, command};

/// Consecutive item failures before a channel is taken down.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Fallback duration for clips whose container reports none.
const FALLBACK_CLIP_SECS: f64 = 30.0;

struct TvChannel {
    id: String,
    config: RwLock<TvChannelConfig>,
    schedule: Mutex<Vec<TvScheduleEntry>>,
    live: AtomicBool,
    viewer_count: AtomicI64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    now_playing: Mutex<Option<TvProgram>>,
    commercial_index: AtomicUsize,
    cancel: Mutex<Option<CancellationToken>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl TvChannel {
    fn status(&self, hls_root: &str) -> TvChannelStatus {
        let config = self.config.read();
        TvChannelStatus {
            id: self.id.clone(),
            name: config.name.clone(),
            tenant_id: config.tenant_id.clone(),
            live: self.live.load(Ordering::SeqCst),
            started_at: *self.started_at.lock(),
            viewer_count: self.viewer_count.load(Ordering::SeqCst),
            now_playing: self.now_playing.lock().clone(),
            schedule_len: self.schedule.lock().len(),
            stream_url: format!("/stream/{}", self.id),
            hls_url: format!("{}/{}/master.m3u8", hls_root, self.id),
        }
    }
}

/// What the loop plays next.
#[derive(Debug, Clone)]
enum PlayItem {
    Program {
        program: TvProgram,
        offset_secs: f64,
        remaining_secs: f64,
    },
    Interstitial {
        path: String,
        max_secs: Option<f64>,
    },
}

/// The TV engine.
pub struct TvEngine {
    config: TvConfig,
    tools: PluginConfig,
    broadcaster_config: BroadcasterConfig,
    channels: DashMap<String, Arc<TvChannel>>,
    broadcaster: Arc<StreamBroadcaster>,
    registry: Arc<PluginRegistry>,
    dbal: DbalClient,
}

impl TvEngine {
    pub fn new(
        config: TvConfig,
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

    pub fn create_channel(&self, config: TvChannelConfig) -> Result<String> {
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

        let id = format!("tv-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        self.channels.insert(
            id.clone(),
            Arc::new(TvChannel {
                id: id.clone(),
                config: RwLock::new(config),
                schedule: Mutex::new(Vec::new()),
                live: AtomicBool::new(false),
                viewer_count: AtomicI64::new(0),
                started_at: Mutex::new(None),
                now_playing: Mutex::new(None),
                commercial_index: AtomicUsize::new(0),
                cancel: Mutex::new(None),
                loop_task: Mutex::new(None),
            }),
        );
        info!(channel = %id, "tv channel created");
        Ok(id)
    }

    pub fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        if channel.live.load(Ordering::SeqCst) {
            return Err(Error::conflict(format!(
                "channel {channel_id} is live; stop it before deleting"
            )));
        }
        self.channels.remove(channel_id);
        info!(channel = %channel_id, "tv channel deleted");
        Ok(())
    }

    pub fn update_channel(&self, channel_id: &str, config: TvChannelConfig) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        if config.name.trim().is_empty() {
            return Err(Error::validation("channel name must not be empty"));
        }
        *channel.config.write() = config;
        Ok(())
    }

    pub fn channel_status(&self, channel_id: &str) -> Result<TvChannelStatus> {
        Ok(self
            .get_channel(channel_id)?
            .status(&self.hls_root()))
    }

    pub fn list_channels(&self, tenant_id: Option<&str>) -> Vec<TvChannelStatus> {
        let root = self.hls_root();
        let mut statuses: Vec<TvChannelStatus> = self
            .channels
            .iter()
            .map(|c| c.status(&root))
            .filter(|s| tenant_id.is_none_or(|t| s.tenant_id == t))
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    // ========================================================================
    // Streaming control
    // ========================================================================

    /// Start a channel. Idempotent; a second start returns the same URLs.
    pub async fn start_channel(self: &Arc<Self>, channel_id: &str) -> Result<TvStreamUrls> {
        let channel = self.get_channel(channel_id)?;
        let urls = self.stream_urls(channel_id);

        if channel.live.swap(true, Ordering::SeqCst) {
            return Ok(urls);
        }

        self.broadcaster.create_mount(channel_id);
        *channel.started_at.lock() = Some(Utc::now());

        let cancel = CancellationToken::new();
        *channel.cancel.lock() = Some(cancel.clone());

        if let Some(plugin) = self.registry.find_streaming(JobType::VideoTranscode) {
            let source = HashMap::new();
            let output = HashMap::new();
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
            json!({ "hlsUrl": urls.hls_url, "streamUrl": urls.stream_url }),
        ));
        info!(channel = %channel_id, "tv channel started");
        Ok(urls)
    }

    /// Stop a channel. Idempotent.
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
            if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
                warn!(channel = %channel_id, "tv loop did not exit in time");
            }
        }

        self.broadcaster.remove_mount(channel_id);
        *channel.now_playing.lock() = None;

        if let Some(plugin) = self.registry.find_streaming(JobType::VideoTranscode) {
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
        info!(channel = %channel_id, "tv channel stopped");
        Ok(())
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.channels.iter().map(|c| c.id.clone()).collect();
        for id in ids {
            if let Err(e) = self.stop_channel(&id).await {
                warn!(channel = %id, "shutdown stop failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Schedule management
    // ========================================================================

    pub fn set_schedule(&self, channel_id: &str, mut entries: Vec<TvScheduleEntry>) -> Result<()> {
        for entry in &entries {
            if entry.program.duration_secs <= 0.0 {
                return Err(Error::validation(format!(
                    "program '{}' needs a positive duration",
                    entry.program.id
                )));
            }
        }
        sort_schedule(&mut entries);
        let channel = self.get_channel(channel_id)?;
        *channel.schedule.lock() = entries;
        Ok(())
    }

    pub fn add_program(&self, channel_id: &str, entry: TvScheduleEntry) -> Result<()> {
        if entry.program.duration_secs <= 0.0 {
            return Err(Error::validation("program needs a positive duration"));
        }
        let channel = self.get_channel(channel_id)?;
        let mut schedule = channel.schedule.lock();
        if schedule.iter().any(|e| e.program.id == entry.program.id) {
            return Err(Error::conflict(format!(
                "program '{}' already scheduled",
                entry.program.id
            )));
        }
        schedule.push(entry);
        sort_schedule(&mut schedule);
        Ok(())
    }

    pub fn remove_program(&self, channel_id: &str, program_id: &str) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        let mut schedule = channel.schedule.lock();
        let before = schedule.len();
        schedule.retain(|e| e.program.id != program_id);
        if schedule.len() == before {
            return Err(Error::not_found("program", program_id));
        }
        Ok(())
    }

    pub fn get_schedule(
        &self,
        channel_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TvScheduleEntry>> {
        let channel = self.get_channel(channel_id)?;
        let schedule = channel.schedule.lock();
        Ok(schedule
            .iter()
            .filter(|e| {
                start.is_none_or(|s| e.end_time() > s) && end.is_none_or(|t| e.start_time < t)
            })
            .cloned()
            .collect())
    }

    // ========================================================================
    // Interstitials
    // ========================================================================

    pub fn set_bumpers(&self, channel_id: &str, bumpers: Bumpers) -> Result<()> {
        let channel = self.get_channel(channel_id)?;
        channel.config.write().bumpers = bumpers;
        Ok(())
    }

    pub fn set_commercials(&self, channel_id: &str, commercials: CommercialConfig) -> Result<()> {
        if commercials.pool.is_empty() {
            return Err(Error::validation("commercial pool must not be empty"));
        }
        if commercials.break_every_programs == 0 {
            return Err(Error::validation("break cadence must be positive"));
        }
        let channel = self.get_channel(channel_id)?;
        channel.config.write().commercials = Some(commercials);
        Ok(())
    }

    // ========================================================================
    // Now playing / EPG
    // ========================================================================

    pub fn now_playing(&self, channel_id: &str) -> Result<Option<TvProgram>> {
        Ok(self.get_channel(channel_id)?.now_playing.lock().clone())
    }

    /// The next scheduled program after now.
    pub fn next_program(&self, channel_id: &str) -> Result<Option<TvProgram>> {
        let channel = self.get_channel(channel_id)?;
        let schedule = channel.schedule.lock();
        Ok(next_entry_after(&schedule, Utc::now()).map(|e| e.program.clone()))
    }

    pub fn generate_channel_epg(&self, channel_id: &str, hours_ahead: u32) -> Result<Vec<EpgEntry>> {
        let channel = self.get_channel(channel_id)?;
        let name = channel.config.read().name.clone();
        let schedule = channel.schedule.lock();
        Ok(epg::project_channel(
            channel_id,
            &name,
            &schedule,
            Utc::now(),
            hours_ahead,
        ))
    }

    pub fn generate_epg(&self, hours_ahead: u32) -> Vec<EpgEntry> {
        let mut entries = Vec::new();
        for channel in self.channels.iter() {
            let name = channel.config.read().name.clone();
            let schedule = channel.schedule.lock();
            entries.extend(epg::project_channel(
                &channel.id,
                &name,
                &schedule,
                Utc::now(),
                hours_ahead,
            ));
        }
        entries.sort_by_key(|e| (e.channel_id.clone(), e.start_time));
        entries
    }

    pub fn export_xmltv(&self, hours_ahead: u32) -> String {
        epg::export_xmltv(&self.generate_epg(hours_ahead))
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn update_viewer_count(&self, channel_id: &str, delta: i64) {
        if let Some(channel) = self.channels.get(channel_id) {
            let count = &channel.viewer_count;
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

    pub fn total_viewers(&self) -> i64 {
        self.channels
            .iter()
            .map(|c| c.viewer_count.load(Ordering::SeqCst))
            .sum()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_channel(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    fn get_channel(&self, channel_id: &str) -> Result<Arc<TvChannel>> {
        self.channels
            .get(channel_id)
            .map(|c| c.clone())
            .ok_or_else(|| Error::not_found("tv channel", channel_id))
    }

    fn hls_root(&self) -> String {
        self.config.output_dir.to_string_lossy().into_owned()
    }

    fn stream_urls(&self, channel_id: &str) -> TvStreamUrls {
        TvStreamUrls {
            stream_url: format!("/stream/{channel_id}"),
            hls_url: format!("{}/{}/master.m3u8", self.hls_root(), channel_id),
            variant_urls: self
                .config
                .variants
                .iter()
                .map(|v| {
                    (
                        v.name.clone(),
                        format!("{}/{}/{}/playlist.m3u8", self.hls_root(), channel_id, v.name),
                    )
                })
                .collect(),
        }
    }

    // ========================================================================
    // Stream loop
    // ========================================================================

    async fn run_loop(self: Arc<Self>, channel: Arc<TvChannel>, cancel: CancellationToken) {
        let channel_dir = self.config.output_dir.join(&channel.id);
        if let Err(e) = write_master(&channel_dir, &self.config.variants) {
            self.take_down(&channel, &format!("cannot write master playlist: {e}"))
                .await;
            return;
        }

        let mut playlists: HashMap<String, VariantPlaylist> = self
            .config
            .variants
            .iter()
            .map(|v| {
                (
                    v.name.clone(),
                    VariantPlaylist::new(
                        channel_dir.join(&v.name),
                        self.config.segment_secs as u64,
                        self.config.playlist_size,
                    ),
                )
            })
            .collect();
        let mut next_segment: HashMap<String, u64> =
            self.config.variants.iter().map(|v| (v.name.clone(), 0)).collect();

        let mut consecutive_failures = 0u32;
        let mut programs_since_break = 0u32;
        let mut pending: VecDeque<PlayItem> = VecDeque::new();
        let mut last_program_id: Option<String> = None;

        while !cancel.is_cancelled() && channel.live.load(Ordering::SeqCst) {
            let Some(item) = self
                .next_item(&channel, &mut pending, &mut last_program_id)
                .await
            else {
                // Nothing scheduled and no idle filler: wait for schedule.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            };

            let finished_program = match &item {
                PlayItem::Program { program, .. } => {
                    self.set_now_playing(&channel, program.clone());
                    Some(program.id.clone())
                }
                PlayItem::Interstitial { .. } => None,
            };

            match self
                .encode_item(&channel, &item, &mut playlists, &mut next_segment, &cancel)
                .await
            {
                Ok(()) => {
                    consecutive_failures = 0;
                    if finished_program.is_some() {
                        programs_since_break += 1;
                        self.queue_break(&channel, &mut pending, &mut programs_since_break)
                            .await;
                    }
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    warn!(channel = %channel.id, "item encode failed: {}", e);
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        self.take_down(
                            &channel,
                            &format!("{MAX_CONSECUTIVE_FAILURES} consecutive item failures"),
                        )
                        .await;
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Decide what plays next: pending interstitials first, then the
    /// scheduled program (with an intro bumper at its head), then the idle
    /// filler for gaps.
    async fn next_item(
        &self,
        channel: &Arc<TvChannel>,
        pending: &mut VecDeque<PlayItem>,
        last_program_id: &mut Option<String>,
    ) -> Option<PlayItem> {
        if let Some(item) = pending.pop_front() {
            return Some(item);
        }

        let now = Utc::now();
        let (entry, gap_secs, bumpers) = {
            let schedule = channel.schedule.lock();
            let config = channel.config.read();
            let entry = current_entry(&schedule, now).cloned();
            let gap = next_entry_after(&schedule, now)
                .map(|e| (e.start_time - now).num_milliseconds().max(0) as f64 / 1000.0);
            (entry, gap, config.bumpers.clone())
        };

        if let Some(entry) = entry {
            let offset = offset_secs(&entry, now);
            let remaining = (entry.program.duration_secs - offset).max(0.0);
            if remaining < 1.0 {
                return None;
            }
            // Fresh program start gets the intro bumper first.
            if offset < 1.0
                && last_program_id.as_deref() != Some(entry.program.id.as_str())
                && let Some(intro) = bumpers.intro
            {
                *last_program_id = Some(entry.program.id.clone());
                pending.push_back(PlayItem::Program {
                    program: entry.program.clone(),
                    offset_secs: offset,
                    remaining_secs: remaining,
                });
                return Some(PlayItem::Interstitial {
                    path: intro,
                    max_secs: None,
                });
            }
            *last_program_id = Some(entry.program.id.clone());
            return Some(PlayItem::Program {
                program: entry.program,
                offset_secs: offset,
                remaining_secs: remaining,
            });
        }

        // Gap or empty schedule: idle filler when configured.
        let idle = bumpers.idle?;
        let max_secs = gap_secs.filter(|g| *g > 1.0);
        Some(PlayItem::Interstitial {
            path: idle,
            max_secs,
        })
    }

    /// After a finished program: at the configured cadence, queue the
    /// outro bumper and a commercial break drawn round-robin from the pool
    /// until the target break duration is covered. Breaks only ever run
    /// between programs.
    async fn queue_break(
        &self,
        channel: &Arc<TvChannel>,
        pending: &mut VecDeque<PlayItem>,
        programs_since_break: &mut u32,
    ) {
        let (commercials, outro) = {
            let config = channel.config.read();
            (config.commercials.clone(), config.bumpers.outro.clone())
        };
        let Some(commercials) = commercials else {
            return;
        };
        if commercials.pool.is_empty()
            || *programs_since_break < commercials.break_every_programs
        {
            return;
        }
        *programs_since_break = 0;

        if let Some(outro) = outro {
            pending.push_back(PlayItem::Interstitial {
                path: outro,
                max_secs: None,
            });
        }

        let mut covered = 0.0f64;
        let target = commercials.break_duration_secs as f64;
        while covered < target {
            let index =
                channel.commercial_index.fetch_add(1, Ordering::SeqCst) % commercials.pool.len();
            let clip = commercials.pool[index].clone();
            let duration = probe_duration_secs(&self.tools.ffprobe_path, &clip)
                .await
                .unwrap_or(FALLBACK_CLIP_SECS);
            covered += duration;
            pending.push_back(PlayItem::Interstitial {
                path: clip,
                max_secs: None,
            });
        }
        debug!(
            channel = %channel.id,
            clips = pending.len(),
            covered_secs = covered,
            "commercial break queued"
        );
    }

    /// Encode one item across all variants: numbered segments per variant,
    /// rolling playlists, and the primary variant teed as MPEG-TS into the
    /// broadcaster mount.
    async fn encode_item(
        &self,
        channel: &Arc<TvChannel>,
        item: &PlayItem,
        playlists: &mut HashMap<String, VariantPlaylist>,
        next_segment: &mut HashMap<String, u64>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (path, offset, max_secs) = match item {
            PlayItem::Program {
                program,
                offset_secs,
                remaining_secs,
            } => (program.media_path.clone(), *offset_secs, Some(*remaining_secs)),
            PlayItem::Interstitial { path, max_secs } => (path.clone(), 0.0, *max_secs),
        };

        let channel_dir = self.config.output_dir.join(&channel.id);
        let item_cancel = cancel.child_token();
        let mut children = Vec::new();

        for (index, variant) in self.config.variants.iter().enumerate() {
            let variant_dir = channel_dir.join(&variant.name);
            std::fs::create_dir_all(&variant_dir).map_err(|e| {
                Error::storage(format!("cannot create {}: {}", variant_dir.display(), e))
            })?;
            let start_number = *next_segment.get(&variant.name).unwrap_or(&0);
            let args = self.variant_args(
                &path,
                offset,
                max_secs,
                variant,
                &variant_dir,
                start_number,
                index == 0,
            );
            let mut cmd = command(&self.tools.ffmpeg_path);
            cmd.args(&args);
            let mut child = StreamingChild::spawn(cmd, false)?;

            if index == 0 {
                // Primary variant: pump the live TS feed to the mount.
                if let Some(mut chunks) =
                    child.take_stdout_chunks(self.broadcaster_config.chunk_size)
                {
                    let broadcaster = self.broadcaster.clone();
                    let mount = channel.id.clone();
                    let pump_cancel = item_cancel.clone();
                    tokio::spawn(async move {
                        while let Ok(Some(chunk)) = chunks.next_chunk().await {
                            if !broadcaster.write(&mount, chunk) {
                                pump_cancel.cancel();
                                break;
                            }
                        }
                    });
                }
            }
            children.push(child);
        }

        // Follow the encoders, refreshing playlists as segments land.
        let deadline = Duration::from_secs_f64(max_secs.unwrap_or(3600.0) + 30.0);
        let result = self
            .supervise_children(&mut children, playlists, deadline, &item_cancel)
            .await;

        for mut child in children {
            child.kill().await;
        }

        // Segment numbering stays monotonic across items: the next item
        // starts after the highest number written so far.
        for variant in &self.config.variants {
            if let Some(playlist) = playlists.get(&variant.name)
                && let Some(max) = playlist.dir_segment_numbers().last().copied()
            {
                next_segment.insert(variant.name.clone(), max + 1);
            }
        }
        result
    }

    async fn supervise_children(
        &self,
        children: &mut [StreamingChild],
        playlists: &mut HashMap<String, VariantPlaylist>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::transcode("item cancelled"));
                }
                _ = ticker.tick() => {}
            }

            self.refresh_playlists(playlists, false);

            let mut all_done = true;
            for child in children.iter_mut() {
                match child.try_wait() {
                    Ok(Some(status)) if !status.success() => {
                        return Err(Error::transcode(format!(
                            "'{}' exited with {}: {}",
                            child.program(),
                            status,
                            child.stderr_tail()
                        )));
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => all_done = false,
                    Err(e) => return Err(Error::storage(e.to_string())),
                }
            }
            if all_done {
                self.refresh_playlists(playlists, true);
                return Ok(());
            }
            if started.elapsed() > deadline {
                return Err(Error::transcode("item encode exceeded its deadline"));
            }
        }
    }

    /// Scan variant directories for freshly written segments and roll the
    /// playlists forward. While the encoder runs, a segment is only listed
    /// once a later one exists (half-written files stay out); after it
    /// exits (`include_tail`) everything on disk is final.
    fn refresh_playlists(&self, playlists: &mut HashMap<String, VariantPlaylist>, include_tail: bool) {
        for variant in &self.config.variants {
            let Some(playlist) = playlists.get_mut(&variant.name) else {
                continue;
            };
            let produced = playlist.dir_segment_numbers();
            for &number in &produced {
                let fresh = playlist.last_segment_number().is_none_or(|last| number > last);
                let complete = include_tail || produced.iter().any(|n| *n > number);
                if fresh && complete {
                    if let Err(e) = playlist.push_segment(number, self.config.segment_secs as f32) {
                        warn!("playlist update failed: {}", e);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn variant_args(
        &self,
        input: &str,
        offset_secs: f64,
        max_secs: Option<f64>,
        variant: &TvVariant,
        variant_dir: &std::path::Path,
        start_number: u64,
        primary: bool,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostats".into(),
            "-re".into(),
        ];
        if offset_secs > 0.0 {
            args.extend(["-ss".into(), format!("{offset_secs:.3}")]);
        }
        args.extend(["-i".into(), input.to_string()]);
        if let Some(max) = max_secs {
            args.extend(["-t".into(), format!("{max:.3}")]);
        }
        args.extend([
            "-c:v".into(),
            video_encoder_name(&self.config.video_codec).to_string(),
            "-preset".into(),
            self.config.video_preset.clone(),
            "-vf".into(),
            format!("scale={}:{}", variant.width, variant.height),
            "-b:v".into(),
            format!("{}k", variant.bitrate_kbps),
            "-c:a".into(),
            audio_encoder_name(&self.config.audio_codec).to_string(),
            "-b:a".into(),
            format!("{}k", self.config.audio_bitrate_kbps),
        ]);

        let segment_target = format!(
            "{}/{}",
            variant_dir.display(),
            "seg%05d.ts"
        );
        if primary {
            args.extend([
                "-f".into(),
                "tee".into(),
                "-map".into(),
                "0:v".into(),
                "-map".into(),
                "0:a?".into(),
                format!(
                    "[f=segment:segment_time={}:segment_start_number={}:segment_format=mpegts]{}|[f=mpegts]pipe:1",
                    self.config.segment_secs, start_number, segment_target
                ),
            ]);
        } else {
            args.extend([
                "-f".into(),
                "segment".into(),
                "-segment_time".into(),
                self.config.segment_secs.to_string(),
                "-segment_start_number".into(),
                start_number.to_string(),
                "-segment_format".into(),
                "mpegts".into(),
                segment_target,
            ]);
        }
        args
    }

    fn set_now_playing(&self, channel: &Arc<TvChannel>, program: TvProgram) {
        let changed = {
            let mut now_playing = channel.now_playing.lock();
            let changed = now_playing.as_ref().map(|p| p.id.as_str()) != Some(program.id.as_str());
            *now_playing = Some(program.clone());
            changed
        };
        if changed {
            debug!(channel = %channel.id, program = %program.title, "program on air");
            let tenant_id = channel.config.read().tenant_id.clone();
            self.dbal.notify(Notification::channel(
                NotificationKind::ProgramChanged,
                tenant_id,
                channel.id.clone(),
                json!({ "programId": program.id, "title": program.title }),
            ));
        }
    }

    async fn take_down(&self, channel: &Arc<TvChannel>, reason: &str) {
        warn!(channel = %channel.id, reason = %reason, "taking tv channel down");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbalConfig;

    fn engine() -> Arc<TvEngine> {
        engine_with(TvConfig {
            output_dir: std::env::temp_dir().join("aircast-tv-tests"),
            ..TvConfig::default()
        })
    }

    fn engine_with(config: TvConfig) -> Arc<TvEngine> {
        let broadcaster = Arc::new(StreamBroadcaster::new(8));
        let registry = Arc::new(PluginRegistry::new(PluginConfig::default()));
        TvEngine::new(
            config,
            PluginConfig::default(),
            BroadcasterConfig::default(),
            broadcaster,
            registry,
            DbalClient::new(DbalConfig::default()).unwrap(),
        )
    }

    fn channel_config(name: &str) -> TvChannelConfig {
        TvChannelConfig {
            name: name.to_string(),
            tenant_id: "t1".to_string(),
            commercials: None,
            bumpers: Bumpers::default(),
        }
    }

    fn entry(id: &str, start: DateTime<Utc>, duration_secs: f64) -> TvScheduleEntry {
        TvScheduleEntry {
            program: TvProgram {
                id: id.to_string(),
                title: format!("Show {id}"),
                description: None,
                media_path: format!("/video/{id}.mp4"),
                duration_secs,
            },
            start_time: start,
        }
    }

    #[tokio::test]
    async fn schedule_is_kept_sorted_and_unique() {
        let engine = engine();
        let id = engine.create_channel(channel_config("one")).unwrap();
        let now = Utc::now();

        engine
            .add_program(&id, entry("b", now + chrono::Duration::hours(2), 60.0))
            .unwrap();
        engine
            .add_program(&id, entry("a", now + chrono::Duration::hours(1), 60.0))
            .unwrap();
        let schedule = engine.get_schedule(&id, None, None).unwrap();
        assert_eq!(schedule[0].program.id, "a");
        assert_eq!(schedule[1].program.id, "b");

        let dup = engine
            .add_program(&id, entry("a", now + chrono::Duration::hours(3), 60.0))
            .unwrap_err();
        assert_eq!(dup.code(), "conflict");
    }

    #[tokio::test]
    async fn schedule_range_filter() {
        let engine = engine();
        let id = engine.create_channel(channel_config("one")).unwrap();
        let now = Utc::now();
        engine
            .set_schedule(
                &id,
                vec![
                    entry("a", now + chrono::Duration::hours(1), 3600.0),
                    entry("b", now + chrono::Duration::hours(5), 3600.0),
                ],
            )
            .unwrap();
        let window = engine
            .get_schedule(
                &id,
                Some(now),
                Some(now + chrono::Duration::hours(3)),
            )
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].program.id, "a");
    }

    #[tokio::test]
    async fn zero_duration_program_is_rejected() {
        let engine = engine();
        let id = engine.create_channel(channel_config("one")).unwrap();
        let err = engine
            .add_program(&id, entry("bad", Utc::now(), 0.0))
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn next_program_reads_the_schedule() {
        let engine = engine();
        let id = engine.create_channel(channel_config("one")).unwrap();
        let now = Utc::now();
        engine
            .set_schedule(&id, vec![entry("soon", now + chrono::Duration::minutes(5), 60.0)])
            .unwrap();
        assert_eq!(engine.next_program(&id).unwrap().unwrap().id, "soon");
        assert!(engine.now_playing(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn commercials_require_pool_and_cadence() {
        let engine = engine();
        let id = engine.create_channel(channel_config("one")).unwrap();
        let err = engine
            .set_commercials(
                &id,
                CommercialConfig {
                    pool: vec![],
                    break_every_programs: 1,
                    break_duration_secs: 60,
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");

        engine
            .set_commercials(
                &id,
                CommercialConfig {
                    pool: vec!["/ads/a.mp4".to_string()],
                    break_every_programs: 2,
                    break_duration_secs: 60,
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn epg_covers_all_channels() {
        let engine = engine();
        let one = engine.create_channel(channel_config("one")).unwrap();
        let two = engine.create_channel(channel_config("two")).unwrap();
        let now = Utc::now();
        engine
            .set_schedule(&one, vec![entry("a", now + chrono::Duration::hours(1), 60.0)])
            .unwrap();
        engine
            .set_schedule(&two, vec![entry("b", now + chrono::Duration::hours(2), 60.0)])
            .unwrap();

        let epg = engine.generate_epg(24);
        assert_eq!(epg.len(), 2);
        let xml = engine.export_xmltv(24);
        assert!(xml.contains("Show a"));
        assert!(xml.contains("Show b"));
    }

    #[tokio::test]
    async fn viewer_count_never_negative() {
        let engine = engine();
        let id = engine.create_channel(channel_config("one")).unwrap();
        engine.update_viewer_count(&id, -3);
        assert_eq!(engine.channel_status(&id).unwrap().viewer_count, 0);
        engine.update_viewer_count(&id, 2);
        assert_eq!(engine.total_viewers(), 2);
    }

    #[tokio::test]
    async fn delete_refuses_live_channel() {
        let engine = engine();
        let id = engine.create_channel(channel_config("one")).unwrap();
        engine.start_channel(&id).await.unwrap();
        assert_eq!(engine.delete_channel(&id).unwrap_err().code(), "conflict");
        engine.stop_channel(&id).await.unwrap();
        engine.delete_channel(&id).unwrap();
    }

    #[tokio::test]
    async fn start_returns_urls_and_is_idempotent() {
        let engine = engine();
        let id = engine.create_channel(channel_config("one")).unwrap();
        let urls1 = engine.start_channel(&id).await.unwrap();
        let urls2 = engine.start_channel(&id).await.unwrap();
        assert_eq!(urls1.hls_url, urls2.hls_url);
        assert!(urls1.hls_url.ends_with("master.m3u8"));
        assert_eq!(urls1.variant_urls.len(), 3);
        assert!(engine.broadcaster.is_active(&id));
        engine.stop_channel(&id).await.unwrap();
    }
}
