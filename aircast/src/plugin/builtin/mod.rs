//! Built-in plugins compiled into the daemon.
//!
//! Each one drives an external tool: ffmpeg for video/audio transcodes,
//! ImageMagick for image processing, pandoc for document conversion.

mod ffmpeg;
mod imagemagick;
mod pandoc;

pub use ffmpeg::FfmpegPlugin;
pub use imagemagick::ImageMagickPlugin;
pub use pandoc::PandocPlugin;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{PluginConfig, QueueConfig};
use crate::plugin::Plugin;

/// Construct all built-in plugins from the daemon configuration.
pub fn all(plugins: &PluginConfig, queue: &QueueConfig) -> Vec<Arc<dyn Plugin>> {
    let timeout = Duration::from_secs(queue.job_timeout_secs);
    vec![
        Arc::new(FfmpegPlugin::new(
            plugins.ffmpeg_path.clone(),
            plugins.ffprobe_path.clone(),
            timeout,
        )),
        Arc::new(ImageMagickPlugin::new(plugins.magick_path.clone(), timeout)),
        Arc::new(PandocPlugin::new(plugins.pandoc_path.clone(), timeout)),
    ]
}

/// Probe a tool by running its version flag with a short deadline.
pub(crate) async fn probe_tool(path: &str, version_flag: &str) -> bool {
    let mut cmd = process_utils::command(path);
    cmd.arg(version_flag);
    process_utils::run_with_timeout(cmd, Duration::from_secs(5), &CancellationToken::new())
        .await
        .is_ok()
}
