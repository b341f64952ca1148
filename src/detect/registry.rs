use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::StubBackend;
use super::handle::DetectorHandle;
use crate::config::DetectorSettings;

/// Registry of detector backends, keyed by backend name.
pub struct BackendRegistry {
    backends: HashMap<String, DetectorHandle>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Build the registry described by the detector settings and select the
    /// configured backend as default.
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(StubBackend::with_labels(settings.stub_labels.clone()));

        #[cfg(feature = "backend-tract")]
        if settings.backend == "tract" {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("detector.model_path is required for the tract backend"))?;
            let mut backend = super::backends::TractBackend::new(model_path, settings.input_size)?
                .with_threshold(settings.confidence_threshold);
            if let Some(class_names) = &settings.class_names {
                backend = backend.with_class_names(class_names.clone());
            }
            registry.register(backend);
        }

        registry.set_default(&settings.backend)?;
        Ok(registry)
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, DetectorHandle::new(backend));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!(
                "detector backend '{}' not available (registered: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<DetectorHandle> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<DetectorHandle> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
