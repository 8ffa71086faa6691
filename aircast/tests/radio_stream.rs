//! End-to-end radio streaming against stub encoder/decoder tools.
//!
//! The stub "ffmpeg" script copies the input file (decoder invocation) or
//! stdin (encoder invocation) to stdout, so the bytes reaching listeners
//! are exactly the track bytes and fan-out can be asserted precisely.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aircast::broadcast::{ListenerHandle, StreamBroadcaster};
use aircast::config::{BroadcasterConfig, DbalConfig, PluginConfig, RadioConfig};
use aircast::dbal::DbalClient;
use aircast::plugin::PluginRegistry;
use aircast::radio::{RadioChannelConfig, RadioEngine, RadioTrack};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Stub ffmpeg: `-i pipe:0` means "encoder" (copy stdin), anything else
/// means "decoder" (copy the input file).
const FAKE_FFMPEG: &str = r#"#!/bin/sh
input=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-i" ]; then input="$a"; fi
  prev="$a"
done
if [ "$input" = "pipe:0" ]; then
  exec cat
else
  exec cat "$input"
fi
"#;

const FAKE_FFPROBE: &str = r#"#!/bin/sh
echo 2.0
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    engine: Arc<RadioEngine>,
    broadcaster: Arc<StreamBroadcaster>,
    track_bytes: Vec<u8>,
    channel_id: String,
}

fn fixture(listener_buffer: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = write_script(dir.path(), "fake_ffmpeg.sh", FAKE_FFMPEG);
    let ffprobe = write_script(dir.path(), "fake_ffprobe.sh", FAKE_FFPROBE);

    // ~2 seconds of deterministic "PCM" at 44100 Hz stereo s16le.
    let track_bytes: Vec<u8> = (0..352_800usize).map(|i| (i % 251) as u8).collect();
    let track_path = dir.path().join("track.mp3");
    std::fs::write(&track_path, &track_bytes).unwrap();

    let tools = PluginConfig {
        ffmpeg_path: ffmpeg.to_string_lossy().into_owned(),
        ffprobe_path: ffprobe.to_string_lossy().into_owned(),
        plugin_dir: dir.path().join("no-plugins"),
        ..PluginConfig::default()
    };
    let broadcaster = Arc::new(StreamBroadcaster::new(listener_buffer));
    let registry = Arc::new(PluginRegistry::new(tools.clone()));
    let engine = RadioEngine::new(
        RadioConfig::default(),
        tools,
        BroadcasterConfig::default(),
        broadcaster.clone(),
        registry,
        DbalClient::new(DbalConfig::default()).unwrap(),
    );

    let channel_id = engine
        .create_channel(RadioChannelConfig {
            name: "fanout".to_string(),
            tenant_id: "t1".to_string(),
            codec: "mp3".to_string(),
            bitrate_kbps: 128,
            sample_rate: 44100,
            channels: 2,
            crossfade_ms: 0,
            target_lufs: -14.0,
            auto_dj: None,
        })
        .unwrap();
    engine
        .set_playlist(
            &channel_id,
            vec![RadioTrack {
                id: "track-1".to_string(),
                path: track_path.to_string_lossy().into_owned(),
                title: "track".to_string(),
                artist: None,
                duration_secs: Some(2.0),
            }],
        )
        .unwrap();

    Fixture {
        _dir: dir,
        engine,
        broadcaster,
        track_bytes,
        channel_id,
    }
}

/// Drain a listener into a buffer for roughly `window`.
async fn collect(mut handle: ListenerHandle, window: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, handle.rx.recv()).await {
            Ok(Some(chunk)) => out.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(_) => break,
        }
    }
    out
}

#[tokio::test]
async fn two_listeners_receive_an_identical_byte_prefix() {
    let fx = fixture(1024);
    // Pre-create the mount and attach both listeners before the loop
    // starts so they observe the stream from its very first byte.
    fx.broadcaster.create_mount(&fx.channel_id);
    let l1 = fx.broadcaster.attach_listener(&fx.channel_id).unwrap();
    let l2 = fx.broadcaster.attach_listener(&fx.channel_id).unwrap();
    fx.engine.start_channel(&fx.channel_id).await.unwrap();

    let (b1, b2) = tokio::join!(
        collect(l1, Duration::from_millis(800)),
        collect(l2, Duration::from_millis(800)),
    );

    assert!(!b1.is_empty(), "listener 1 received nothing");
    assert!(!b2.is_empty(), "listener 2 received nothing");

    let common = b1.len().min(b2.len());
    assert_eq!(&b1[..common], &b2[..common], "fan-out bytes diverged");

    // The stub pipeline is an identity, so the stream is the track bytes.
    assert_eq!(&b1[..common.min(fx.track_bytes.len())],
               &fx.track_bytes[..common.min(fx.track_bytes.len())]);

    fx.engine.stop_channel(&fx.channel_id).await.unwrap();
    assert!(!fx.broadcaster.is_active(&fx.channel_id));
}

#[tokio::test]
async fn pacing_produces_roughly_realtime_byte_rate() {
    let fx = fixture(1024);
    fx.engine.start_channel(&fx.channel_id).await.unwrap();
    let listener = fx.broadcaster.attach_listener(&fx.channel_id).unwrap();

    // 44100 Hz * 2 ch * 2 B = 176 400 B/s through the identity encoder.
    let bytes = collect(listener, Duration::from_millis(1000)).await;
    let rate = bytes.len() as f64;
    assert!(
        (70_000.0..400_000.0).contains(&rate),
        "unexpected byte rate: {rate}"
    );

    fx.engine.stop_channel(&fx.channel_id).await.unwrap();
}

#[tokio::test]
async fn slow_listener_is_pruned_while_fast_one_continues() {
    let fx = fixture(8);
    fx.broadcaster.create_mount(&fx.channel_id);
    let fast = fx.broadcaster.attach_listener(&fx.channel_id).unwrap();
    let slow = fx.broadcaster.attach_listener(&fx.channel_id).unwrap();
    fx.engine.start_channel(&fx.channel_id).await.unwrap();
    assert_eq!(fx.broadcaster.listener_count(&fx.channel_id), 2);

    // Drain only the fast listener; the slow one's 8-chunk buffer fills
    // within the first few frames and it gets pruned.
    let fast_bytes = collect(fast, Duration::from_millis(600)).await;
    assert!(!fast_bytes.is_empty());
    assert_eq!(fx.broadcaster.listener_count(&fx.channel_id), 1);

    drop(slow);
    fx.engine.stop_channel(&fx.channel_id).await.unwrap();
}

#[tokio::test]
async fn empty_playlist_enters_live_and_idles() {
    let fx = fixture(16);
    fx.engine.set_playlist(&fx.channel_id, vec![]).unwrap();
    fx.engine.start_channel(&fx.channel_id).await.unwrap();

    let status = fx.engine.channel_status(&fx.channel_id).unwrap();
    assert!(status.live, "empty playlist still enters live");

    // No bytes flow while idle.
    let listener = fx.broadcaster.attach_listener(&fx.channel_id).unwrap();
    let bytes = collect(listener, Duration::from_millis(400)).await;
    assert!(bytes.is_empty(), "idle channel must not produce bytes");
    assert!(fx.engine.channel_status(&fx.channel_id).unwrap().live);

    fx.engine.stop_channel(&fx.channel_id).await.unwrap();
}

#[tokio::test]
async fn now_playing_tracks_the_current_track() {
    let fx = fixture(64);
    fx.engine.start_channel(&fx.channel_id).await.unwrap();

    // Give the loop a moment to spawn the first decoder.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let playing = fx.engine.now_playing(&fx.channel_id).unwrap();
    assert_eq!(playing.unwrap().id, "track-1");

    fx.engine.stop_channel(&fx.channel_id).await.unwrap();
    assert!(fx.engine.now_playing(&fx.channel_id).unwrap().is_none());
}
