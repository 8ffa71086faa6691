//! HLS playlist maintenance: rolling variant playlists and the master
//! playlist listing all variants.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use m3u8_rs::{MasterPlaylist, MediaPlaylist, MediaSegment, Resolution, VariantStream};

use crate::config::TvVariant;
use crate::error::{Error, Result};

/// Rolling playlist for one variant: keeps the last N segments, advancing
/// the media sequence as old ones roll off.
pub struct VariantPlaylist {
    dir: PathBuf,
    target_duration: u64,
    max_segments: usize,
    /// (segment number, duration) pairs currently listed.
    segments: VecDeque<(u64, f32)>,
    media_sequence: u64,
}

impl VariantPlaylist {
    pub fn new(dir: PathBuf, target_duration: u64, max_segments: usize) -> Self {
        Self {
            dir,
            target_duration,
            max_segments: max_segments.max(1),
            segments: VecDeque::new(),
            media_sequence: 0,
        }
    }

    /// Highest segment number listed, if any.
    pub fn last_segment_number(&self) -> Option<u64> {
        self.segments.back().map(|(n, _)| *n)
    }

    /// Segment numbers currently present on disk in the variant directory.
    pub fn dir_segment_numbers(&self) -> Vec<u64> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut numbers: Vec<u64> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix("seg")?
                    .strip_suffix(".ts")?
                    .parse::<u64>()
                    .ok()
            })
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Append a segment and rewrite the playlist file.
    pub fn push_segment(&mut self, number: u64, duration: f32) -> Result<()> {
        self.segments.push_back((number, duration));
        while self.segments.len() > self.max_segments {
            self.segments.pop_front();
            self.media_sequence += 1;
        }
        self.write()
    }

    /// Rewrite `playlist.m3u8` in the variant directory.
    pub fn write(&self) -> Result<()> {
        let playlist = MediaPlaylist {
            version: Some(3),
            target_duration: self.target_duration,
            media_sequence: self.media_sequence,
            segments: self
                .segments
                .iter()
                .map(|(number, duration)| MediaSegment {
                    uri: segment_file_name(*number),
                    duration: *duration,
                    ..Default::default()
                })
                .collect(),
            end_list: false,
            ..Default::default()
        };

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::storage(format!("cannot create {}: {}", self.dir.display(), e)))?;
        let path = self.dir.join("playlist.m3u8");
        let mut file = std::fs::File::create(&path)
            .map_err(|e| Error::storage(format!("cannot write {}: {}", path.display(), e)))?;
        playlist
            .write_to(&mut file)
            .map_err(|e| Error::storage(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(())
    }
}

/// Monotonically numbered segment file name.
pub fn segment_file_name(number: u64) -> String {
    format!("seg{number:05}.ts")
}

/// Write the master playlist listing every variant.
pub fn write_master(channel_dir: &Path, variants: &[TvVariant]) -> Result<()> {
    let master = MasterPlaylist {
        version: Some(3),
        variants: variants
            .iter()
            .map(|v| VariantStream {
                uri: format!("{}/playlist.m3u8", v.name),
                bandwidth: v.bitrate_kbps as u64 * 1000,
                resolution: Some(Resolution {
                    width: v.width as u64,
                    height: v.height as u64,
                }),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    std::fs::create_dir_all(channel_dir)
        .map_err(|e| Error::storage(format!("cannot create {}: {}", channel_dir.display(), e)))?;
    let path = channel_dir.join("master.m3u8");
    let mut file = std::fs::File::create(&path)
        .map_err(|e| Error::storage(format!("cannot write {}: {}", path.display(), e)))?;
    master
        .write_to(&mut file)
        .map_err(|e| Error::storage(format!("cannot write {}: {}", path.display(), e)))?;
    Ok(())
}
