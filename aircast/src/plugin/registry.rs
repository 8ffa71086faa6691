//! Central plugin registry: ownership, discovery and routing.

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use libloading::Library;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::loader::{self, LoadedArtifact};
use super::{Plugin, PluginDescriptor};
use crate::config::PluginConfig;
use crate::error::{Error, Result};
use crate::jobs::{JobParams, JobType};

/// A routable reference to a plugin instance.
///
/// For dynamic plugins the library handle rides along so the code backing
/// the instance cannot be unmapped while any job still holds the handle —
/// retiring a plugin from the registry only drops the registry's reference.
#[derive(Clone)]
pub struct PluginHandle {
    instance: Arc<dyn Plugin>,
    _library: Option<Arc<Library>>,
}

impl PluginHandle {
    fn builtin(instance: Arc<dyn Plugin>) -> Self {
        Self {
            instance,
            _library: None,
        }
    }

    fn dynamic(artifact: &LoadedArtifact) -> Self {
        Self {
            instance: artifact.instance.clone(),
            _library: Some(artifact.library.clone()),
        }
    }
}

impl Deref for PluginHandle {
    type Target = dyn Plugin;

    fn deref(&self) -> &Self::Target {
        self.instance.as_ref()
    }
}

struct RegisteredPlugin {
    descriptor: PluginDescriptor,
    handle: PluginHandle,
    /// Artifact path for dynamic plugins; reload re-reads it.
    artifact: Option<PathBuf>,
}

/// Externally visible plugin state, as served by `GET /plugins`.
#[derive(Debug, Clone, Serialize)]
pub struct PluginState {
    #[serde(flatten)]
    pub descriptor: PluginDescriptor,
    pub healthy: bool,
}

/// The plugin registry. Owns every plugin instance exclusively; routing
/// order is stable for the whole process lifetime: built-ins first, then
/// dynamic plugins, lexicographic by id within each group.
pub struct PluginRegistry {
    config: PluginConfig,
    plugins: RwLock<Vec<RegisteredPlugin>>,
    health: DashMap<String, bool>,
}

impl PluginRegistry {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config,
            plugins: RwLock::new(Vec::new()),
            health: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Register a built-in plugin. Must happen before `initialize` so the
    /// built-ins precede any scanned artifact in routing order.
    pub fn register_builtin(&self, instance: Arc<dyn Plugin>) -> Result<()> {
        let descriptor = instance.descriptor().clone();
        let mut plugins = self.plugins.write();
        if plugins.iter().any(|p| p.descriptor.id == descriptor.id) {
            return Err(Error::conflict(format!(
                "plugin id '{}' already registered",
                descriptor.id
            )));
        }
        debug!(id = %descriptor.id, "registered built-in plugin");
        self.health.insert(descriptor.id.clone(), true);
        plugins.push(RegisteredPlugin {
            descriptor,
            handle: PluginHandle::builtin(instance),
            artifact: None,
        });
        Self::sort_routing_order(&mut plugins);
        Ok(())
    }

    /// Initialize all built-ins and scan the plugin directory for dynamic
    /// artifacts. Individual load failures are logged and skipped; the
    /// registry comes up with whatever loaded. Returns the number of
    /// dynamic plugins loaded.
    pub async fn initialize(&self) -> Result<usize> {
        let builtins: Vec<PluginHandle> = {
            let plugins = self.plugins.read();
            plugins.iter().map(|p| p.handle.clone()).collect()
        };
        for handle in builtins {
            let id = handle.descriptor().id.clone();
            if let Err(e) = handle.initialize(&self.config.config_path).await {
                warn!(id = %id, "built-in plugin failed to initialize: {}", e);
                self.health.insert(id, false);
            }
        }

        let mut loaded = 0;
        if self.config.plugin_dir.is_dir() {
            let mut artifacts: Vec<PathBuf> = std::fs::read_dir(&self.config.plugin_dir)
                .map_err(|e| {
                    Error::storage(format!(
                        "cannot scan plugin dir {}: {}",
                        self.config.plugin_dir.display(),
                        e
                    ))
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| loader::is_plugin_artifact(path))
                .collect();
            artifacts.sort();

            for path in artifacts {
                match self.load_dynamic(&path).await {
                    Ok(id) => {
                        loaded += 1;
                        info!(id = %id, path = %path.display(), "dynamic plugin ready");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "skipping plugin artifact: {}", e);
                    }
                }
            }
        } else {
            debug!(
                dir = %self.config.plugin_dir.display(),
                "plugin directory does not exist, skipping scan"
            );
        }

        info!(
            builtins = self.plugins.read().iter().filter(|p| p.descriptor.builtin).count(),
            dynamic = loaded,
            "plugin registry initialized"
        );
        Ok(loaded)
    }

    /// Load, version-check and initialize one dynamic artifact.
    async fn load_dynamic(&self, path: &std::path::Path) -> Result<String> {
        let artifact = loader::load_plugin_artifact(path)?;
        let descriptor = artifact.instance.descriptor().clone();

        if self
            .plugins
            .read()
            .iter()
            .any(|p| p.descriptor.id == descriptor.id)
        {
            return Err(Error::conflict(format!(
                "plugin id '{}' already registered",
                descriptor.id
            )));
        }

        artifact
            .instance
            .initialize(&self.config.config_path)
            .await
            .map_err(|e| Error::plugin(format!("plugin '{}' init failed: {}", descriptor.id, e)))?;

        let id = descriptor.id.clone();
        self.health.insert(id.clone(), true);
        let mut plugins = self.plugins.write();
        plugins.push(RegisteredPlugin {
            descriptor,
            handle: PluginHandle::dynamic(&artifact),
            artifact: Some(path.to_path_buf()),
        });
        Self::sort_routing_order(&mut plugins);
        Ok(id)
    }

    /// Reload a plugin.
    ///
    /// Dynamic: load-new-then-retire-old on success, leave-old-in-place on
    /// failure. The old instance is retired without `shutdown` so in-flight
    /// jobs holding its handle run to completion; its resources release
    /// with the last handle. Built-in: re-run `initialize`.
    pub async fn reload(&self, id: &str) -> Result<PluginDescriptor> {
        let (artifact_path, is_builtin, handle) = {
            let plugins = self.plugins.read();
            let entry = plugins
                .iter()
                .find(|p| p.descriptor.id == id)
                .ok_or_else(|| Error::not_found("plugin", id))?;
            (
                entry.artifact.clone(),
                entry.descriptor.builtin,
                entry.handle.clone(),
            )
        };

        if is_builtin {
            handle.initialize(&self.config.config_path).await?;
            self.health.insert(id.to_string(), true);
            return Ok(handle.descriptor().clone());
        }

        let path = artifact_path
            .ok_or_else(|| Error::internal(format!("dynamic plugin '{}' has no artifact path", id)))?;

        let artifact = loader::load_plugin_artifact(&path)?;
        let descriptor = artifact.instance.descriptor().clone();
        artifact
            .instance
            .initialize(&self.config.config_path)
            .await
            .map_err(|e| Error::plugin(format!("plugin '{}' re-init failed: {}", id, e)))?;

        {
            let mut plugins = self.plugins.write();
            if let Some(entry) = plugins.iter_mut().find(|p| p.descriptor.id == id) {
                entry.descriptor = descriptor.clone();
                entry.handle = PluginHandle::dynamic(&artifact);
                entry.artifact = Some(path);
            }
            Self::sort_routing_order(&mut plugins);
        }
        self.health.insert(id.to_string(), true);
        info!(id = %id, "plugin reloaded");
        Ok(descriptor)
    }

    /// Unload a dynamic plugin: shut it down and drop the registry entry.
    /// Built-ins cannot be unloaded.
    pub async fn unload(&self, id: &str) -> Result<()> {
        let handle = {
            let mut plugins = self.plugins.write();
            let idx = plugins
                .iter()
                .position(|p| p.descriptor.id == id)
                .ok_or_else(|| Error::not_found("plugin", id))?;
            if plugins[idx].descriptor.builtin {
                return Err(Error::conflict(format!(
                    "built-in plugin '{}' cannot be unloaded",
                    id
                )));
            }
            plugins.remove(idx).handle
        };
        handle.shutdown().await;
        self.health.remove(id);
        info!(id = %id, "plugin unloaded");
        Ok(())
    }

    /// Get a plugin by id.
    pub fn get(&self, id: &str) -> Option<PluginHandle> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.descriptor.id == id)
            .map(|p| p.handle.clone())
    }

    /// Route a request to the first capable plugin in stable order.
    ///
    /// The registry lock is only held to snapshot the candidates; the
    /// `can_handle` probes run without it.
    pub fn find_for(&self, params: &JobParams) -> Option<PluginHandle> {
        let job_type = params.job_type();
        let candidates: Vec<PluginHandle> = {
            let plugins = self.plugins.read();
            plugins
                .iter()
                .filter(|p| p.descriptor.handles(job_type))
                .map(|p| p.handle.clone())
                .collect()
        };
        candidates.into_iter().find(|h| h.can_handle(params))
    }

    /// First plugin carrying the "streaming" capability tag for a type.
    pub fn find_streaming(&self, job_type: JobType) -> Option<PluginHandle> {
        let plugins = self.plugins.read();
        plugins
            .iter()
            .find(|p| p.descriptor.handles(job_type) && p.descriptor.has_tag("streaming"))
            .map(|p| p.handle.clone())
    }

    /// All plugins with their last-known health.
    pub fn list(&self) -> Vec<PluginState> {
        self.plugins
            .read()
            .iter()
            .map(|p| PluginState {
                descriptor: p.descriptor.clone(),
                healthy: self
                    .health
                    .get(&p.descriptor.id)
                    .map(|h| *h)
                    .unwrap_or(false),
            })
            .collect()
    }

    /// Last-known health per plugin id.
    pub fn health_snapshot(&self) -> Vec<(String, bool)> {
        self.list()
            .into_iter()
            .map(|p| (p.descriptor.id, p.healthy))
            .collect()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.read().len()
    }

    /// Probe every plugin once and record the results. Probe failures only
    /// update the health map; routing is unaffected.
    pub async fn health_check(&self) {
        let handles: Vec<PluginHandle> = {
            let plugins = self.plugins.read();
            plugins.iter().map(|p| p.handle.clone()).collect()
        };
        for handle in handles {
            let id = handle.descriptor().id.clone();
            let healthy = handle.is_healthy().await;
            self.health.insert(id, healthy);
        }
    }

    /// Background health probe loop.
    pub fn spawn_health_probe(self: &Arc<Self>, cancel: CancellationToken) {
        let registry = self.clone();
        let interval = Duration::from_secs(self.config.health_probe_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.health_check().await,
                }
            }
        });
    }

    /// Shut down every plugin. Daemon-stop path.
    pub async fn shutdown_all(&self) {
        let handles: Vec<PluginHandle> = {
            let mut plugins = self.plugins.write();
            plugins.drain(..).map(|p| p.handle).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
        self.health.clear();
        info!("all plugins shut down");
    }

    /// Built-ins before dynamic, lexicographic id within each group.
    fn sort_routing_order(plugins: &mut [RegisteredPlugin]) {
        plugins.sort_by(|a, b| {
            b.descriptor
                .builtin
                .cmp(&a.descriptor.builtin)
                .then_with(|| a.descriptor.id.cmp(&b.descriptor.id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ProcessRequest, ProgressSink};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakePlugin {
        descriptor: PluginDescriptor,
        accepts: bool,
        initialized: AtomicUsize,
        healthy: AtomicBool,
    }

    impl FakePlugin {
        fn new(id: &str, job_types: Vec<JobType>, accepts: bool) -> Arc<Self> {
            Arc::new(Self {
                descriptor: PluginDescriptor {
                    id: id.to_string(),
                    name: id.to_string(),
                    version: "0.0.1".to_string(),
                    author: "tests".to_string(),
                    job_types,
                    capability_tags: vec![],
                    input_formats: vec![],
                    output_formats: vec![],
                    builtin: true,
                },
                accepts,
                initialized: AtomicUsize::new(0),
                healthy: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl Plugin for FakePlugin {
        fn descriptor(&self) -> &PluginDescriptor {
            &self.descriptor
        }

        async fn initialize(&self, _config_path: &Path) -> crate::error::Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) {}

        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn can_handle(&self, _params: &JobParams) -> bool {
            self.accepts
        }

        async fn process(
            &self,
            request: &ProcessRequest,
            _sink: &ProgressSink,
        ) -> crate::error::Result<String> {
            Ok(format!("/out/{}", request.job_id))
        }

        async fn cancel(&self, _job_id: &str) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::new(PluginConfig {
            plugin_dir: PathBuf::from("/nonexistent-plugins"),
            ..PluginConfig::default()
        })
    }

    fn image_params() -> JobParams {
        JobParams::ImageProcess {
            input: "/in/a.png".to_string(),
            output: "/out/a.jpg".to_string(),
            width: 10,
            height: 10,
            preserve_aspect: false,
            filters: vec![],
            quality: 85,
            format: "jpg".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_ids_conflict() {
        let reg = registry();
        reg.register_builtin(FakePlugin::new("dup", vec![JobType::ImageProcess], true))
            .unwrap();
        let err = reg
            .register_builtin(FakePlugin::new("dup", vec![JobType::ImageProcess], true))
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn routing_prefers_lexicographic_id() {
        let reg = registry();
        reg.register_builtin(FakePlugin::new("zeta", vec![JobType::ImageProcess], true))
            .unwrap();
        reg.register_builtin(FakePlugin::new("alpha", vec![JobType::ImageProcess], true))
            .unwrap();
        let handle = reg.find_for(&image_params()).unwrap();
        assert_eq!(handle.descriptor().id, "alpha");
    }

    #[tokio::test]
    async fn routing_skips_plugins_that_decline() {
        let reg = registry();
        reg.register_builtin(FakePlugin::new("alpha", vec![JobType::ImageProcess], false))
            .unwrap();
        reg.register_builtin(FakePlugin::new("beta", vec![JobType::ImageProcess], true))
            .unwrap();
        let handle = reg.find_for(&image_params()).unwrap();
        assert_eq!(handle.descriptor().id, "beta");
    }

    #[tokio::test]
    async fn routing_respects_declared_types() {
        let reg = registry();
        reg.register_builtin(FakePlugin::new("audio", vec![JobType::AudioTranscode], true))
            .unwrap();
        assert!(reg.find_for(&image_params()).is_none());
    }

    #[tokio::test]
    async fn initialize_runs_builtin_init_once() {
        let reg = registry();
        let plugin = FakePlugin::new("p", vec![JobType::ImageProcess], true);
        reg.register_builtin(plugin.clone()).unwrap();
        reg.initialize().await.unwrap();
        assert_eq!(plugin.initialized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reload_builtin_reruns_initialize() {
        let reg = registry();
        let plugin = FakePlugin::new("p", vec![JobType::ImageProcess], true);
        reg.register_builtin(plugin.clone()).unwrap();
        reg.initialize().await.unwrap();
        reg.reload("p").await.unwrap();
        assert_eq!(plugin.initialized.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn health_probe_records_unhealthy() {
        let reg = registry();
        let plugin = FakePlugin::new("p", vec![JobType::ImageProcess], true);
        reg.register_builtin(plugin.clone()).unwrap();
        plugin.healthy.store(false, Ordering::SeqCst);
        reg.health_check().await;
        let state = reg.list();
        assert_eq!(state.len(), 1);
        assert!(!state[0].healthy);
        // Unhealthy plugins still route.
        assert!(reg.find_for(&image_params()).is_some());
    }

    #[tokio::test]
    async fn unload_refuses_builtin_and_unknown() {
        let reg = registry();
        reg.register_builtin(FakePlugin::new("p", vec![JobType::ImageProcess], true))
            .unwrap();
        assert_eq!(reg.unload("p").await.unwrap_err().code(), "conflict");
        assert_eq!(reg.unload("ghost").await.unwrap_err().code(), "not_found");
    }
}
