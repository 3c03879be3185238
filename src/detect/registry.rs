use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use image::RgbImage;

use super::backend::DetectorBackend;
use super::result::Detection;

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<Mutex<dyn DetectorBackend>>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<Arc<Mutex<dyn DetectorBackend>>> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<Arc<Mutex<dyn DetectorBackend>>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Warm up the default backend.
    pub fn warm_up(&self) -> Result<()> {
        let backend = self
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        guard.warm_up()
    }

    /// Run detection with the default backend. Concurrent callers take turns
    /// on the backend's lock.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let backend = self
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        guard.detect(image)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.list())
            .field("default", &self.default_name)
            .finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;

    struct Fixed(&'static str, usize);

    impl DetectorBackend for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
            Ok((0..self.1)
                .map(|i| Detection::new([0.0, i as f32, 1.0, i as f32 + 1.0], 0.9, ObjectClass::Person))
                .collect())
        }
    }

    #[test]
    fn first_registered_backend_is_default() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(Fixed("one", 1));
        registry.register(Fixed("two", 2));
        assert_eq!(registry.default_name(), Some("one"));
        assert_eq!(registry.detect(&RgbImage::new(2, 2))?.len(), 1);

        registry.set_default("two")?;
        assert_eq!(registry.detect(&RgbImage::new(2, 2))?.len(), 2);
        assert_eq!(registry.list(), vec!["one", "two"]);
        Ok(())
    }

    #[test]
    fn unknown_default_is_rejected() {
        let mut registry = BackendRegistry::new();
        registry.register(Fixed("one", 0));
        assert!(registry.set_default("missing").is_err());
    }

    #[test]
    fn debug_lists_backend_names() {
        let mut registry = BackendRegistry::new();
        registry.register(Fixed("two", 0));
        registry.register(Fixed("one", 0));
        let text = format!("{:?}", registry);
        assert!(text.contains(r#"backends: ["one", "two"]"#), "{}", text);
        assert!(text.contains(r#"default: Some("two")"#), "{}", text);
    }

    #[test]
    fn empty_registry_cannot_detect() {
        assert!(BackendRegistry::new().detect(&RgbImage::new(1, 1)).is_err());
    }
}
