//! Dynamic plugin artifact loading.

use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use tracing::info;

use super::{
    PLUGIN_API_VERSION, PLUGIN_CREATE_SYMBOL, PLUGIN_VERSION_SYMBOL, Plugin, PluginApiVersionFn,
    PluginCreateFn,
};
use crate::error::{Error, Result};

/// A successfully loaded dynamic plugin. The library handle must outlive
/// the instance; the registry keeps both paired for exactly that reason.
pub struct LoadedArtifact {
    pub library: Arc<Library>,
    pub instance: Arc<dyn Plugin>,
}

impl std::fmt::Debug for LoadedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedArtifact").finish_non_exhaustive()
    }
}

/// Load a plugin shared library, verify its API version, and construct the
/// instance.
///
/// Failure reasons are explicit: file not found, unloadable library,
/// missing symbol, version mismatch, null factory result. On any failure
/// nothing is retained.
pub fn load_plugin_artifact(path: &Path) -> Result<LoadedArtifact> {
    if !path.exists() {
        return Err(Error::plugin(format!(
            "plugin artifact not found: {}",
            path.display()
        )));
    }

    // SAFETY: loading and calling into a plugin library is inherently
    // unsafe; the API-version gate below is the contract that makes the
    // symbol signatures trustworthy.
    unsafe {
        let library = Library::new(path).map_err(|e| {
            Error::plugin(format!("failed to load {}: {}", path.display(), e))
        })?;

        let version_fn: libloading::Symbol<PluginApiVersionFn> = library
            .get(PLUGIN_VERSION_SYMBOL)
            .map_err(|e| Error::plugin(format!("{}: missing version symbol: {}", path.display(), e)))?;

        let version_ptr = version_fn();
        if version_ptr.is_null() {
            return Err(Error::plugin(format!(
                "{}: version symbol returned null",
                path.display()
            )));
        }
        let version = CStr::from_ptr(version_ptr).to_string_lossy();
        if version != PLUGIN_API_VERSION {
            return Err(Error::plugin(format!(
                "{}: plugin API version mismatch: artifact declares '{}', host expects '{}'",
                path.display(),
                version,
                PLUGIN_API_VERSION
            )));
        }

        let create_fn: libloading::Symbol<PluginCreateFn> = library
            .get(PLUGIN_CREATE_SYMBOL)
            .map_err(|e| Error::plugin(format!("{}: missing create symbol: {}", path.display(), e)))?;

        let raw = create_fn();
        if raw.is_null() {
            return Err(Error::plugin(format!(
                "{}: plugin factory returned null",
                path.display()
            )));
        }
        let boxed: Box<Box<dyn Plugin>> = Box::from_raw(raw);
        let instance: Arc<dyn Plugin> = Arc::from(*boxed);

        info!(
            path = %path.display(),
            id = %instance.descriptor().id,
            "loaded dynamic plugin"
        );

        Ok(LoadedArtifact {
            library: Arc::new(library),
            instance,
        })
    }
}

/// Whether a directory entry looks like a plugin artifact.
pub(super) fn is_plugin_artifact(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("so") | Some("dylib") | Some("dll")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifact_is_a_plugin_error() {
        let err = load_plugin_artifact(Path::new("/nonexistent/libplugin.so")).unwrap_err();
        assert_eq!(err.code(), "plugin_error");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn artifact_extension_filter() {
        assert!(is_plugin_artifact(Path::new("/p/libx.so")));
        assert!(is_plugin_artifact(Path::new("/p/x.dylib")));
        assert!(is_plugin_artifact(Path::new("/p/x.dll")));
        assert!(!is_plugin_artifact(Path::new("/p/readme.md")));
        assert!(!is_plugin_artifact(Path::new("/p/noext")));
    }

    #[test]
    fn non_library_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.so");
        std::fs::write(&path, b"not a shared object").unwrap();
        let err = load_plugin_artifact(&path).unwrap_err();
        assert_eq!(err.code(), "plugin_error");
    }
}
