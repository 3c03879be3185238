//! ROI aggregation: crop every zone of a frame and stack the crops into one
//! composite image so a camera needs a single detector call per frame.
//!
//! Crops are stacked top to bottom in zone order. A crop narrower than the
//! widest one is centred on a zero (black) background. Each crop is described
//! by a [`Segment`] so detections can be mapped back to their zone.

use chrono::{DateTime, Utc};
use image::{imageops, RgbImage};

use crate::frame::Frame;
use crate::zones::ZoneDefinition;

/// Placement of one zone crop inside a composite image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Position within the composite (0-based, top to bottom).
    pub index: usize,
    /// Index of the originating zone in the camera's zone list.
    pub zone_index: usize,
    /// Zone display name.
    pub zone: String,
    pub capacity: u32,
    /// First composite row of this segment.
    pub y_offset: u32,
    pub height: u32,
    /// Width of the crop itself, excluding padding.
    pub width: u32,
    /// Left padding applied to centre the crop.
    pub x_offset: u32,
}

impl Segment {
    /// One past the last composite row of this segment.
    pub fn y_end(&self) -> u32 {
        self.y_offset + self.height
    }

    /// True when composite row `y` lies in `[y_offset, y_end)`.
    pub fn contains_row(&self, y: f32) -> bool {
        y >= self.y_offset as f32 && y < self.y_end() as f32
    }
}

/// One camera's stacked zone crops.
#[derive(Clone, Debug)]
pub struct CompositeImage {
    pub camera_id: String,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub image: RgbImage,
    pub segments: Vec<Segment>,
}

/// Build the composite for `frame`. Returns `None` when no zone yields a usable crop.
pub fn aggregate(frame: &Frame, zones: &[ZoneDefinition]) -> Option<CompositeImage> {
    let source = frame.image();
    let mut crops = Vec::with_capacity(zones.len());
    for zone in zones {
        match zone.clip_to(source.width(), source.height()) {
            Some(rect) => {
                let crop = imageops::crop_imm(source, rect.x, rect.y, rect.width, rect.height)
                    .to_image();
                crops.push((zone, crop));
            }
            None => log::warn!(
                "camera {}: zone {} is outside the {}x{} frame, skipped",
                frame.camera_id(),
                zone.label(),
                source.width(),
                source.height()
            ),
        }
    }

    if crops.is_empty() {
        log::warn!(
            "camera {}: no usable zones for frame #{}",
            frame.camera_id(),
            frame.sequence()
        );
        return None;
    }

    let width = crops.iter().map(|(_, c)| c.width()).max().unwrap_or(0);
    let height: u32 = crops.iter().map(|(_, c)| c.height()).sum();
    let mut image = RgbImage::new(width, height);
    let mut segments = Vec::with_capacity(crops.len());
    let mut y_offset = 0u32;

    for (index, (zone, crop)) in crops.into_iter().enumerate() {
        let x_offset = (width - crop.width()) / 2;
        imageops::replace(&mut image, &crop, x_offset as i64, y_offset as i64);
        segments.push(Segment {
            index,
            zone_index: zone.index,
            zone: zone.label(),
            capacity: zone.capacity,
            y_offset,
            height: crop.height(),
            width: crop.width(),
            x_offset,
        });
        y_offset += crop.height();
    }

    Some(CompositeImage {
        camera_id: frame.camera_id().to_string(),
        sequence: frame.sequence(),
        captured_at: frame.captured_at(),
        image,
        segments,
    })
}
