//! Detector capability: image in, bounding boxes out.

mod backend;
mod backends;
mod registry;
mod result;

use anyhow::{anyhow, Result};
use std::path::Path;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::BackendRegistry;
pub use result::{non_max_suppression, Detection, ObjectClass};

/// Build a registry whose default backend is `name`.
///
/// The stub backend is always registered. `tract` needs the `backend-tract`
/// feature and a model path.
pub fn build_registry(name: &str, model_path: Option<&Path>) -> Result<BackendRegistry> {
    #[cfg(not(feature = "backend-tract"))]
    let _ = model_path;

    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::new());

    match name {
        "stub" => {}
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let path = model_path.ok_or_else(|| anyhow!("detector 'tract' requires model_path"))?;
            registry.register(TractBackend::new(path, 640, 640)?);
        }
        other => {
            return Err(anyhow!(
                "unknown detector '{}' (available: {})",
                other,
                registry.list().join(", ")
            ));
        }
    }
    registry.set_default(name)?;
    Ok(registry)
}
