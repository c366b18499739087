use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::ScriptedBackend;
use crate::error::ModelError;

/// Builds a detector backend from a located model artifact.
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn DetectorBackend>>;
}

impl<F> ModelLoader for F
where
    F: Fn(&Path) -> Result<Box<dyn DetectorBackend>> + Send + Sync,
{
    fn load(&self, path: &Path) -> Result<Box<dyn DetectorBackend>> {
        self(path)
    }
}

/// Loaders keyed by artifact file extension.
pub struct LoaderRegistry {
    loaders: HashMap<String, Arc<dyn ModelLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// Registry with the built-in loaders: `json` scripts, plus `onnx` with backend-tract.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("json", |path: &Path| -> Result<Box<dyn DetectorBackend>> {
            Ok(Box::new(ScriptedBackend::from_path(path)?))
        });
        #[cfg(feature = "backend-tract")]
        registry.register("onnx", |path: &Path| -> Result<Box<dyn DetectorBackend>> {
            Ok(Box::new(super::backends::TractBackend::new(path)?))
        });
        registry
    }

    /// Register a loader. Replaces any loader already bound to the extension.
    pub fn register<L: ModelLoader + 'static>(&mut self, extension: &str, loader: L) {
        self.loaders
            .insert(extension.to_ascii_lowercase(), Arc::new(loader));
    }

    pub fn get(&self, extension: &str) -> Option<Arc<dyn ModelLoader>> {
        self.loaders.get(&extension.to_ascii_lowercase()).cloned()
    }

    /// Registered extensions, sorted.
    pub fn extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self.loaders.keys().cloned().collect();
        extensions.sort();
        extensions
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Application resource directory holding model artifacts.
#[derive(Clone, Debug)]
pub struct ResourceBundle {
    root: PathBuf,
}

impl ResourceBundle {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the named resource, if it exists as a file.
    pub fn locate(&self, handle: &ResourceHandle) -> Option<PathBuf> {
        let path = self.root.join(handle.file_name());
        path.is_file().then_some(path)
    }
}

/// Name of a model artifact inside a `ResourceBundle`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceHandle {
    pub name: String,
    pub extension: String,
}

impl ResourceHandle {
    pub fn new(name: &str, extension: &str) -> Self {
        Self {
            name: name.to_string(),
            extension: extension.to_string(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.extension)
    }
}

/// A loaded detector, shareable with the inference worker.
#[derive(Clone)]
pub struct ModelHandle {
    name: String,
    path: PathBuf,
    backend_name: &'static str,
    backend: Arc<Mutex<Box<dyn DetectorBackend>>>,
}

impl ModelHandle {
    /// Wrap a backend that did not come from a resource bundle.
    pub fn from_backend(name: &str, backend: Box<dyn DetectorBackend>) -> Self {
        Self {
            name: name.to_string(),
            path: PathBuf::new(),
            backend_name: backend.name(),
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub(crate) fn backend(&self) -> Arc<Mutex<Box<dyn DetectorBackend>>> {
        self.backend.clone()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("backend", &self.backend_name)
            .finish()
    }
}

/// Resource bundle plus the loaders that understand its artifacts.
pub struct ModelCatalog {
    bundle: ResourceBundle,
    loaders: LoaderRegistry,
}

impl ModelCatalog {
    pub fn new(bundle: ResourceBundle, loaders: LoaderRegistry) -> Self {
        Self { bundle, loaders }
    }

    pub fn bundle(&self) -> &ResourceBundle {
        &self.bundle
    }

    /// Locate and load a model artifact.
    pub fn load_model(&self, handle: &ResourceHandle) -> Result<ModelHandle, ModelError> {
        let path = self
            .bundle
            .locate(handle)
            .ok_or_else(|| ModelError::ModelMissing {
                name: handle.name.clone(),
                extension: handle.extension.clone(),
            })?;
        let loader = self.loaders.get(&handle.extension).ok_or_else(|| {
            ModelError::load_failed(
                &handle.name,
                anyhow!(
                    "no loader for .{} (registered: {})",
                    handle.extension,
                    self.loaders.extensions().join(", ")
                ),
            )
        })?;
        let mut backend = loader
            .load(&path)
            .map_err(|err| ModelError::load_failed(&handle.name, err))?;
        backend
            .warm_up()
            .map_err(|err| ModelError::load_failed(&handle.name, err))?;

        let backend_name = backend.name();
        log::info!(
            "ModelCatalog: loaded {} with {} backend",
            path.display(),
            backend_name
        );
        Ok(ModelHandle {
            name: handle.name.clone(),
            path,
            backend_name,
            backend: Arc::new(Mutex::new(backend)),
        })
    }
}
