//! Auto-DJ playlist population: scan folders for audio files.

use std::path::Path;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use super::{AutoDjConfig, RadioTrack};
use crate::media::AUDIO_EXTENSIONS;

/// Scan the configured folders for audio files and build a playlist.
/// Missing folders are logged and skipped. Entries are sorted by path for
/// a stable base order, then shuffled when requested.
pub fn scan(config: &AutoDjConfig) -> Vec<RadioTrack> {
    let mut paths = Vec::new();
    for folder in &config.folders {
        collect_audio_files(Path::new(folder), &mut paths);
    }
    paths.sort();

    let mut tracks: Vec<RadioTrack> = paths.iter().map(|p| RadioTrack::from_path(p)).collect();
    if config.shuffle {
        tracks.shuffle(&mut rand::rng());
    }
    debug!(tracks = tracks.len(), folders = config.folders.len(), "auto-dj scan complete");
    tracks
}

fn collect_audio_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "auto-dj cannot read folder: {}", e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_audio_files(&path, out);
        } else if is_audio_file(&path) {
            out.push(path);
        }
    }
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
