use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

use super::{is_image_path, CaptureBackend, CaptureError};

/// Plays a still image, or every image of a directory in name order, as a
/// finite stream.
pub struct ImageLoopSource {
    root: PathBuf,
    files: Vec<PathBuf>,
    position: usize,
}

impl ImageLoopSource {
    pub fn new(path: &Path) -> Result<Self> {
        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("failed to list {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image_path(p))
                .collect();
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };
        if files.is_empty() {
            return Err(anyhow!("no images found in {}", path.display()));
        }
        Ok(Self {
            root: path.to_path_buf(),
            files,
            position: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl CaptureBackend for ImageLoopSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        if !self.root.exists() {
            return Err(CaptureError::Device(format!(
                "{} does not exist",
                self.root.display()
            )));
        }
        log::info!(
            "ImageLoopSource: opened {} ({} images)",
            self.root.display(),
            self.files.len()
        );
        Ok(())
    }

    fn grab(&mut self) -> Result<RgbImage, CaptureError> {
        let path = self.files.get(self.position).ok_or(CaptureError::EndOfStream)?;
        self.position += 1;
        let image = image::open(path)
            .map_err(|err| CaptureError::Decode(format!("{}: {}", path.display(), err)))?;
        Ok(image.to_rgb8())
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        self.position = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plays_directory_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        RgbImage::new(4, 2).save(dir.path().join("b.png"))?;
        RgbImage::new(2, 2).save(dir.path().join("a.png"))?;
        std::fs::write(dir.path().join("notes.txt"), "ignored")?;

        let mut source = ImageLoopSource::new(dir.path())?;
        assert_eq!(source.len(), 2);
        source.open()?;
        assert_eq!(source.grab()?.width(), 2);
        assert_eq!(source.grab()?.width(), 4);
        assert!(matches!(source.grab(), Err(CaptureError::EndOfStream)));
        source.rewind()?;
        assert_eq!(source.grab()?.width(), 2);
        Ok(())
    }

    #[test]
    fn corrupt_image_is_a_decode_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not a jpeg")?;
        let mut source = ImageLoopSource::new(&path)?;
        assert!(matches!(source.grab(), Err(CaptureError::Decode(_))));
        Ok(())
    }

    #[test]
    fn empty_directory_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(ImageLoopSource::new(dir.path()).is_err());
        Ok(())
    }
}
