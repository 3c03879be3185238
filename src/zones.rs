//! Zone (ROI) definitions and the per-camera zone map.
//!
//! The zone map is loaded once at startup from a JSON file keyed by camera id:
//!
//! ```json
//! { "lobby": { "boxes": [ { "tl": [10, 20], "tr": [200, 25], "bl": [12, 180],
//!                           "br": [205, 190], "capacity": 6, "name": "Bench" } ] } }
//! ```
//!
//! Every zone is a quadrilateral (not necessarily axis-aligned) with a positive
//! capacity. A camera owns an ordered, non-empty list of zones; that order is the
//! stacking order used by the ROI aggregator.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A corner point in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(from = "[f64; 2]")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl From<[f64; 2]> for Point {
    fn from(raw: [f64; 2]) -> Self {
        Self {
            x: raw[0],
            y: raw[1],
        }
    }
}

/// Axis-aligned rectangle, clipped to an image, in whole pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One configured zone of a camera.
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneDefinition {
    /// Position of this zone in the camera's configured list.
    pub index: usize,
    /// Corners in tl, tr, br, bl order.
    pub corners: [Point; 4],
    /// Always >= 1.
    pub capacity: u32,
    pub name: Option<String>,
}

impl ZoneDefinition {
    pub fn new(
        index: usize,
        corners: [Point; 4],
        capacity: u32,
        name: Option<String>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("zone {} capacity must be at least 1", index + 1));
        }
        if corners.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
            return Err(anyhow!("zone {} has a non-finite corner", index + 1));
        }
        Ok(Self {
            index,
            corners,
            capacity,
            name: name.filter(|n| !n.trim().is_empty()),
        })
    }

    /// Axis-aligned rectangular zone spanning `(x0, y0)` to `(x1, y1)`.
    pub fn rectangle(
        index: usize,
        (x0, y0): (f64, f64),
        (x1, y1): (f64, f64),
        capacity: u32,
        name: Option<String>,
    ) -> Result<Self> {
        Self::new(
            index,
            [
                Point { x: x0, y: y0 },
                Point { x: x1, y: y0 },
                Point { x: x1, y: y1 },
                Point { x: x0, y: y1 },
            ],
            capacity,
            name,
        )
    }

    /// Display name; unnamed zones are called `ROI-<n>` (1-based).
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("ROI-{}", self.index + 1),
        }
    }

    /// Bounding rectangle of the quadrilateral as `(x_min, y_min, x_max, y_max)`.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let xs = self.corners.iter().map(|c| c.x);
        let ys = self.corners.iter().map(|c| c.y);
        (
            xs.clone().fold(f64::INFINITY, f64::min),
            ys.clone().fold(f64::INFINITY, f64::min),
            xs.fold(f64::NEG_INFINITY, f64::max),
            ys.fold(f64::NEG_INFINITY, f64::max),
        )
    }

    /// Bounding rectangle clipped to a `width` x `height` image.
    ///
    /// Returns `None` when the clipped rectangle has zero width or height.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<PixelRect> {
        let (x_min, y_min, x_max, y_max) = self.bounds();
        let clamp = |v: f64, limit: u32| v.round().clamp(0.0, limit as f64) as u32;
        let (x0, x1) = (clamp(x_min, width), clamp(x_max, width));
        let (y0, y1) = (clamp(y_min, height), clamp(y_max, height));
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(PixelRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ZoneFileCamera {
    #[serde(default)]
    boxes: Vec<ZoneFileBox>,
}

#[derive(Debug, Deserialize)]
struct ZoneFileBox {
    tl: Option<Point>,
    tr: Option<Point>,
    bl: Option<Point>,
    br: Option<Point>,
    capacity: Option<i64>,
    #[serde(default)]
    name: Option<String>,
}

/// Immutable mapping of camera id to its ordered zones.
#[derive(Clone, Debug, Default)]
pub struct ZoneMap {
    cameras: BTreeMap<String, Vec<ZoneDefinition>>,
}

impl ZoneMap {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read zone file {}", path.display()))?;
        let map = Self::from_json_str(&raw)
            .with_context(|| format!("invalid zone file {}", path.display()))?;
        log::info!(
            "loaded zones for {} cameras from {}",
            map.cameras.len(),
            path.display()
        );
        Ok(map)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: BTreeMap<String, ZoneFileCamera> =
            serde_json::from_str(raw).map_err(|e| anyhow!("parse error: {}", e))?;
        let mut cameras = BTreeMap::new();
        for (camera, entry) in file {
            let zones = parse_camera_zones(&camera, entry)?;
            cameras.insert(camera, zones);
        }
        Ok(Self { cameras })
    }

    /// Build a map directly, validating the same invariants as the file loader.
    pub fn from_zones(
        cameras: impl IntoIterator<Item = (String, Vec<ZoneDefinition>)>,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (camera, zones) in cameras {
            if zones.is_empty() {
                return Err(anyhow!("camera '{}' has no zones", camera));
            }
            map.insert(camera, zones);
        }
        Ok(Self { cameras: map })
    }

    pub fn zones_for(&self, camera: &str) -> Option<&[ZoneDefinition]> {
        self.cameras.get(camera).map(Vec::as_slice)
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = &str> {
        self.cameras.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

fn parse_camera_zones(camera: &str, entry: ZoneFileCamera) -> Result<Vec<ZoneDefinition>> {
    if entry.boxes.is_empty() {
        return Err(anyhow!("camera '{}' has no zones", camera));
    }
    entry
        .boxes
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let corner = |p: Option<Point>, key: &str| {
                p.ok_or_else(|| {
                    anyhow!(
                        "camera '{}' zone {} is missing the '{}' corner (tl, tr, bl, br required)",
                        camera,
                        index + 1,
                        key
                    )
                })
            };
            let corners = [
                corner(raw.tl, "tl")?,
                corner(raw.tr, "tr")?,
                corner(raw.br, "br")?,
                corner(raw.bl, "bl")?,
            ];
            let capacity = raw.capacity.unwrap_or(0);
            if capacity < 1 || capacity > u32::MAX as i64 {
                return Err(anyhow!(
                    "camera '{}' zone {} capacity must be a positive integer (got {})",
                    camera,
                    index + 1,
                    capacity
                ));
            }
            ZoneDefinition::new(index, corners, capacity as u32, raw.name)
                .with_context(|| format!("camera '{}'", camera))
        })
        .collect()
}
