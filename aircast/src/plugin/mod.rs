//! Media-processing plugin contract.
//!
//! Plugins are the daemon's extensibility mechanism: each one declares the
//! job types it handles and drives an external tool to do the work. Built-in
//! plugins are compiled into the binary; dynamic plugins are shared
//! libraries discovered in the plugin directory at startup.
//!
//! A dynamic plugin artifact must export:
//!
//! ```text
//! #[unsafe(no_mangle)] extern "C" fn aircast_plugin_api_version() -> *const c_char;
//! #[unsafe(no_mangle)] extern "C" fn aircast_plugin_create() -> *mut Box<dyn Plugin>;
//! ```
//!
//! The version string must equal [`PLUGIN_API_VERSION`] exactly; anything
//! else is rejected at load time and the artifact is never instantiated.

mod loader;
mod registry;

pub mod builtin;

pub use loader::load_plugin_artifact;
pub use registry::{PluginHandle, PluginRegistry, PluginState};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::jobs::{JobParams, JobProgress, JobType};

/// Plugin API version expected from dynamic artifacts. Strict equality;
/// there are no compatibility ranges.
pub const PLUGIN_API_VERSION: &str = "1.0.0";

/// Exported symbol returning the artifact's API version.
pub const PLUGIN_VERSION_SYMBOL: &[u8] = b"aircast_plugin_api_version";

/// Exported symbol constructing the plugin instance.
pub const PLUGIN_CREATE_SYMBOL: &[u8] = b"aircast_plugin_create";

/// Factory signature exported by dynamic plugin artifacts.
pub type PluginCreateFn = unsafe extern "C" fn() -> *mut Box<dyn Plugin>;

/// Version signature exported by dynamic plugin artifacts.
pub type PluginApiVersionFn = unsafe extern "C" fn() -> *const std::os::raw::c_char;

/// Static description of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Globally unique plugin id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Plugin version (not the API version).
    pub version: String,
    pub author: String,
    /// Job types this plugin handles.
    pub job_types: Vec<JobType>,
    /// Opaque capability tags, e.g. "hardware-accel", "streaming".
    #[serde(default)]
    pub capability_tags: Vec<String>,
    /// Input formats (extensions) the plugin accepts.
    #[serde(default)]
    pub input_formats: Vec<String>,
    /// Output formats the plugin produces.
    #[serde(default)]
    pub output_formats: Vec<String>,
    /// Whether the plugin is compiled in.
    pub builtin: bool,
}

impl PluginDescriptor {
    pub fn handles(&self, job_type: JobType) -> bool {
        self.job_types.contains(&job_type)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.capability_tags.iter().any(|t| t == tag)
    }
}

/// Progress callback handle given to a plugin's `process`.
///
/// Plugins must report monotonically increasing percent values; the job
/// queue clamps regressions anyway, but a well-behaved plugin never relies
/// on that.
#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<dyn Fn(JobProgress) + Send + Sync>,
}

impl ProgressSink {
    pub fn new(f: impl Fn(JobProgress) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// A sink that discards everything. Test and probe paths.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, percent: u8, stage: impl Into<String>) {
        (self.inner)(JobProgress {
            percent: percent.min(100),
            stage: stage.into(),
            eta_secs: None,
        });
    }

    pub fn report_with_eta(&self, percent: u8, stage: impl Into<String>, eta_secs: u64) {
        (self.inner)(JobProgress {
            percent: percent.min(100),
            stage: stage.into(),
            eta_secs: Some(eta_secs),
        });
    }
}

/// The work handed to a plugin's `process`.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Owning job id; `cancel` refers to it.
    pub job_id: String,
    pub params: JobParams,
}

/// The plugin contract.
///
/// The registry exclusively owns every instance. `initialize` is called
/// once before the plugin is routed to; it must be safe to call again on
/// reload. `shutdown` must cancel any in-flight work the plugin started.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Static descriptor.
    fn descriptor(&self) -> &PluginDescriptor;

    /// One-time initialization with the shared plugin config path.
    async fn initialize(&self, config_path: &Path) -> Result<()>;

    /// Tear down; cancel any in-flight work.
    async fn shutdown(&self);

    /// Cheap health probe.
    async fn is_healthy(&self) -> bool;

    /// Whether this plugin can run this particular request. The registry
    /// only asks plugins that declare the request's job type.
    fn can_handle(&self, params: &JobParams) -> bool;

    /// Run the work. Returns the output artifact location.
    async fn process(&self, request: &ProcessRequest, sink: &ProgressSink) -> Result<String>;

    /// Best-effort cancellation of one active job; expected to terminate
    /// the external process it spawned.
    async fn cancel(&self, job_id: &str) -> Result<()>;

    /// Start continuous output for a channel. Only streaming-capable
    /// plugins override this.
    async fn start_stream(
        &self,
        channel_id: &str,
        _source: &HashMap<String, String>,
        _output: &HashMap<String, String>,
    ) -> Result<String> {
        Err(Error::plugin(format!(
            "plugin '{}' does not support streaming (channel {})",
            self.descriptor().id,
            channel_id
        )))
    }

    /// Stop continuous output for a channel.
    async fn stop_stream(&self, channel_id: &str) -> Result<()> {
        Err(Error::plugin(format!(
            "plugin '{}' does not support streaming (channel {})",
            self.descriptor().id,
            channel_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    #[test]
    fn sink_clamps_percent() {
        let last = Arc::new(AtomicU8::new(0));
        let seen = last.clone();
        let sink = ProgressSink::new(move |p| seen.store(p.percent, Ordering::SeqCst));
        sink.report(250, "over");
        assert_eq!(last.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn descriptor_tag_lookup() {
        let descriptor = PluginDescriptor {
            id: "x".to_string(),
            name: "X".to_string(),
            version: "0.1.0".to_string(),
            author: "tests".to_string(),
            job_types: vec![JobType::AudioTranscode],
            capability_tags: vec!["streaming".to_string()],
            input_formats: vec![],
            output_formats: vec![],
            builtin: true,
        };
        assert!(descriptor.handles(JobType::AudioTranscode));
        assert!(!descriptor.handles(JobType::ImageProcess));
        assert!(descriptor.has_tag("streaming"));
        assert!(!descriptor.has_tag("hardware-accel"));
    }
}
