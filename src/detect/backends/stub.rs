use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, ObjectClass};

const BRIGHTNESS_THRESHOLD: u8 = 200;
const MIN_BLOB_PIXELS: usize = 4;

/// Stub backend for testing and synthetic sources.
///
/// Every 4-connected blob of bright pixels is reported as one person. The
/// `stub://` camera draws people as bright blocks on a dark floor, so counts
/// are deterministic without a model.
pub struct StubBackend {
    threshold: u8,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            threshold: BRIGHTNESS_THRESHOLD,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn luma(pixel: &image::Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (width, height) = image.dimensions();
        let (w, h) = (width as usize, height as usize);
        let mut visited = vec![false; w * h];
        let mut detections = Vec::new();
        let mut stack = Vec::new();

        for start in 0..w * h {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let (sx, sy) = ((start % w) as u32, (start / w) as u32);
            if luma(image.get_pixel(sx, sy)) < self.threshold {
                continue;
            }

            let (mut x0, mut y0, mut x1, mut y1) = (sx, sy, sx, sy);
            let mut pixels = 0usize;
            stack.push(start);
            while let Some(idx) = stack.pop() {
                let (x, y) = ((idx % w) as u32, (idx / w) as u32);
                pixels += 1;
                x0 = x0.min(x);
                y0 = y0.min(y);
                x1 = x1.max(x);
                y1 = y1.max(y);

                let neighbours = [
                    (x > 0).then(|| idx - 1),
                    (x + 1 < width).then(|| idx + 1),
                    (y > 0).then(|| idx - w),
                    (y + 1 < height).then(|| idx + w),
                ];
                for next in neighbours.into_iter().flatten() {
                    if visited[next] {
                        continue;
                    }
                    let (nx, ny) = ((next % w) as u32, (next / w) as u32);
                    if luma(image.get_pixel(nx, ny)) >= self.threshold {
                        visited[next] = true;
                        stack.push(next);
                    }
                }
            }

            if pixels >= MIN_BLOB_PIXELS {
                detections.push(Detection::new(
                    [x0 as f32, y0 as f32, (x1 + 1) as f32, (y1 + 1) as f32],
                    0.9,
                    ObjectClass::Person,
                ));
            }
        }
        Ok(detections)
    }
}
