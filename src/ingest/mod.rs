//! Frame ingestion.
//!
//! One [`CameraSource`] per configured camera, each driven by its own worker
//! thread. Capture backends:
//! - `stub://<name>` synthetic scene (tests, demos)
//! - a still image or a directory of images, played as a loop
//! - local video files (feature: ingest-file-ffmpeg)
//! - V4L2 devices addressed by index (feature: ingest-v4l2)
//!
//! Capture failures never leave the camera: end of file rewinds the source,
//! device errors are retried after a short delay.

mod camera;
#[cfg(feature = "ingest-file-ffmpeg")]
mod file_ffmpeg;
mod images;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::path::PathBuf;
use thiserror::Error;

pub use camera::{run_camera, CameraSource, CameraStats, CameraWorkerSettings};
pub use images::ImageLoopSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Capture failure kinds. The camera worker branches on these.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A finite source ran out of frames.
    #[error("end of stream")]
    EndOfStream,
    /// The device or file could not be opened or read.
    #[error("device error: {0}")]
    Device(String),
    /// Data was read but could not be decoded into an image.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Where a camera's frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocator {
    File(PathBuf),
    Device(u32),
    Synthetic(String),
}

impl SourceLocator {
    /// `stub://...` is synthetic, an all-digit string is a device index,
    /// anything else is a local path.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("empty video source"));
        }
        if raw.starts_with("stub://") {
            return Ok(Self::Synthetic(raw.to_string()));
        }
        if raw.chars().all(|c| c.is_ascii_digit()) {
            let index = raw
                .parse()
                .map_err(|_| anyhow!("device index out of range: {}", raw))?;
            return Ok(Self::Device(index));
        }
        if raw.contains("://") {
            return Err(anyhow!(
                "unsupported video source '{}': only local files, device indexes and stub:// are accepted",
                raw
            ));
        }
        Ok(Self::File(PathBuf::from(raw)))
    }

    /// Default camera id for a source given without one: file stem, `device<n>`,
    /// or the synthetic name.
    pub fn default_camera_id(&self) -> String {
        match self {
            Self::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Device(index) => format!("device{}", index),
            Self::Synthetic(raw) => {
                let name = raw.trim_start_matches("stub://");
                let name = name.split('?').next().unwrap_or(name);
                if name.is_empty() {
                    "stub".to_string()
                } else {
                    name.to_string()
                }
            }
        }
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Device(index) => write!(f, "device {}", index),
            Self::Synthetic(raw) => f.write_str(raw),
        }
    }
}

/// A capture backend owned by exactly one camera worker.
pub trait CaptureBackend: Send {
    /// Open the underlying handle. Called again after device errors.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Next frame as RGB.
    fn grab(&mut self) -> Result<RgbImage, CaptureError>;

    /// Return to the first frame of a finite source.
    fn rewind(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::Device("source cannot be rewound".to_string()))
    }

    /// Release the handle. The worker calls this before exiting.
    fn close(&mut self) {}
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

fn is_image_path(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Pick the backend for a locator. Fails for sources this build cannot read.
pub fn open_backend(locator: &SourceLocator) -> Result<Box<dyn CaptureBackend>> {
    match locator {
        SourceLocator::Synthetic(raw) => Ok(Box::new(SyntheticSource::new(SyntheticConfig::parse(raw)?))),
        SourceLocator::File(path) if path.is_dir() || is_image_path(path) => {
            Ok(Box::new(ImageLoopSource::new(path)?))
        }
        SourceLocator::File(path) => {
            if !path.exists() {
                return Err(anyhow!("video file {} does not exist", path.display()));
            }
            #[cfg(feature = "ingest-file-ffmpeg")]
            {
                Ok(Box::new(file_ffmpeg::FfmpegFileSource::new(path.clone())))
            }
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            {
                Err(anyhow!(
                    "video file {} requires the ingest-file-ffmpeg feature",
                    path.display()
                ))
            }
        }
        SourceLocator::Device(index) => {
            #[cfg(feature = "ingest-v4l2")]
            {
                Ok(Box::new(v4l2::V4l2Source::new(*index)))
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                Err(anyhow!("device {} requires the ingest-v4l2 feature", index))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_kinds() -> Result<()> {
        assert_eq!(SourceLocator::parse("0")?, SourceLocator::Device(0));
        assert_eq!(SourceLocator::parse(" 12 ")?, SourceLocator::Device(12));
        assert_eq!(
            SourceLocator::parse("videos/lobby.mp4")?,
            SourceLocator::File(PathBuf::from("videos/lobby.mp4"))
        );
        assert!(matches!(SourceLocator::parse("stub://a")?, SourceLocator::Synthetic(_)));
        assert!(SourceLocator::parse("rtsp://cam/stream").is_err());
        assert!(SourceLocator::parse("").is_err());
        Ok(())
    }

    #[test]
    fn default_camera_ids() -> Result<()> {
        assert_eq!(SourceLocator::parse("videos/lobby.mp4")?.default_camera_id(), "lobby");
        assert_eq!(SourceLocator::parse("2")?.default_camera_id(), "device2");
        assert_eq!(
            SourceLocator::parse("stub://hall?people=3")?.default_camera_id(),
            "hall"
        );
        Ok(())
    }

    #[test]
    fn missing_video_file_is_rejected() {
        let locator = SourceLocator::File(PathBuf::from("/nonexistent/clip.mp4"));
        assert!(open_backend(&locator).is_err());
    }
}
