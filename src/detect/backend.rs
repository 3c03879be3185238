use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// One call per composite image. Boxes are returned in the pixel coordinates
/// of the image passed in. Implementations must treat the image as read-only
/// and must not keep it beyond the call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on an image.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
