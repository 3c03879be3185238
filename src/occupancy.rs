//! Occupancy evaluation.
//!
//! One detector call per composite image. Each person detection is attributed
//! to the segment whose vertical span contains the detection's centre; centres
//! outside every span are discarded. Per-zone counts then become
//! [`ZoneOccupancy`] records and one camera [`Summary`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::detect::{BackendRegistry, Detection};
use crate::roi::{CompositeImage, Segment};

/// Occupancy of one zone for one frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ZoneOccupancy {
    pub index: usize,
    pub zone: String,
    pub capacity: u32,
    /// Detected people; may exceed capacity.
    pub count: u32,
    /// `min(count / capacity, 1) * 100`.
    pub occupancy_percent: f64,
    /// `max(capacity - count, 0)`.
    pub free_slots: u32,
}

impl ZoneOccupancy {
    pub fn new(segment: &Segment, count: u32) -> Self {
        let capacity = segment.capacity.max(1);
        let ratio = (count as f64 / capacity as f64).min(1.0);
        Self {
            index: segment.index,
            zone: segment.zone.clone(),
            capacity: segment.capacity,
            count,
            occupancy_percent: (ratio * 100.0).clamp(0.0, 100.0),
            free_slots: segment.capacity.saturating_sub(count),
        }
    }

    /// A zone is occupied when at least one person was counted in it.
    pub fn is_occupied(&self) -> bool {
        self.count > 0
    }

    pub fn status(&self) -> &'static str {
        if self.is_occupied() {
            "occupied"
        } else {
            "free"
        }
    }
}

/// Per-camera summary of one evaluated frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    #[serde(skip)]
    pub camera_id: String,
    #[serde(skip)]
    pub captured_at: DateTime<Utc>,
    pub total_people: u32,
    pub free: Vec<String>,
    pub occupied: Vec<String>,
}

impl Summary {
    pub fn from_zones(camera_id: &str, captured_at: DateTime<Utc>, zones: &[ZoneOccupancy]) -> Self {
        let (occupied, free): (Vec<_>, Vec<_>) = zones.iter().partition(|z| z.is_occupied());
        Self {
            camera_id: camera_id.to_string(),
            captured_at,
            total_people: zones.iter().map(|z| z.count).sum(),
            free: free.into_iter().map(|z| z.zone.clone()).collect(),
            occupied: occupied.into_iter().map(|z| z.zone.clone()).collect(),
        }
    }
}

/// Result of evaluating one composite image.
#[derive(Debug)]
pub struct Evaluation {
    pub composite: CompositeImage,
    /// Person detections that were attributed to a zone.
    pub counted: Vec<Detection>,
    pub zones: Vec<ZoneOccupancy>,
    pub summary: Summary,
}

/// Count person detections per segment.
///
/// Returns the per-segment counts (same order as `segments`) and the
/// detections that were counted.
pub fn attribute(
    segments: &[Segment],
    detections: &[Detection],
    confidence_threshold: f32,
) -> (Vec<u32>, Vec<Detection>) {
    let mut counts = vec![0u32; segments.len()];
    let mut counted = Vec::new();
    for detection in detections {
        if !detection.class.is_person() || detection.confidence < confidence_threshold {
            continue;
        }
        let (_, cy) = detection.center();
        if let Some(pos) = segments.iter().position(|s| s.contains_row(cy)) {
            counts[pos] += 1;
            counted.push(detection.clone());
        }
    }
    (counts, counted)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvaluatorStats {
    pub evaluated: u64,
    pub skipped: u64,
}

/// Runs the detector on composites and turns the result into occupancy.
pub struct OccupancyEvaluator {
    registry: Arc<BackendRegistry>,
    confidence_threshold: f32,
    evaluated: AtomicU64,
    skipped: AtomicU64,
}

impl OccupancyEvaluator {
    pub fn new(registry: Arc<BackendRegistry>, confidence_threshold: f32) -> Self {
        Self {
            registry,
            confidence_threshold,
            evaluated: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Evaluate a composite, propagating detector errors.
    pub fn evaluate(&self, composite: CompositeImage) -> Result<Evaluation> {
        let detections = self.registry.detect(&composite.image).with_context(|| {
            format!(
                "detector failed for camera {} frame #{}",
                composite.camera_id, composite.sequence
            )
        })?;
        let (counts, counted) =
            attribute(&composite.segments, &detections, self.confidence_threshold);
        let zones: Vec<ZoneOccupancy> = composite
            .segments
            .iter()
            .zip(counts)
            .map(|(segment, count)| ZoneOccupancy::new(segment, count))
            .collect();
        let summary = Summary::from_zones(&composite.camera_id, composite.captured_at, &zones);
        Ok(Evaluation {
            composite,
            counted,
            zones,
            summary,
        })
    }

    /// Evaluate a composite; a detector failure is logged and the frame skipped.
    pub fn process(&self, composite: CompositeImage) -> Option<Evaluation> {
        match self.evaluate(composite) {
            Ok(evaluation) => {
                self.evaluated.fetch_add(1, Ordering::Relaxed);
                Some(evaluation)
            }
            Err(err) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                log::warn!("{:#}; frame skipped", err);
                None
            }
        }
    }

    pub fn stats(&self) -> EvaluatorStats {
        EvaluatorStats {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorBackend, ObjectClass};
    use anyhow::anyhow;
    use image::RgbImage;

    fn segment(index: usize, y_offset: u32, height: u32, capacity: u32) -> Segment {
        Segment {
            index,
            zone_index: index,
            zone: format!("ROI-{}", index + 1),
            capacity,
            y_offset,
            height,
            width: 100,
            x_offset: 0,
        }
    }

    fn person_at(cy: f32) -> Detection {
        Detection::new([10.0, cy - 2.0, 20.0, cy + 2.0], 0.8, ObjectClass::Person)
    }

    fn composite(camera: &str, segments: Vec<Segment>) -> CompositeImage {
        let height = segments.iter().map(|s| s.height).sum();
        CompositeImage {
            camera_id: camera.to_string(),
            sequence: 1,
            captured_at: Utc::now(),
            image: RgbImage::new(100, height),
            segments,
        }
    }

    /// Returns a fixed list of detections, or fails on every call when `fail` is set.
    struct Scripted {
        detections: Vec<Detection>,
        fail: bool,
    }

    impl DetectorBackend for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
            if self.fail {
                return Err(anyhow!("malformed input"));
            }
            Ok(self.detections.clone())
        }
    }

    fn evaluator(detections: Vec<Detection>, fail: bool) -> OccupancyEvaluator {
        let mut registry = BackendRegistry::new();
        registry.register(Scripted { detections, fail });
        OccupancyEvaluator::new(Arc::new(registry), 0.25)
    }

    #[test]
    fn three_people_in_capacity_ten_is_thirty_percent() -> Result<()> {
        let eval = evaluator(vec![person_at(5.0), person_at(10.0), person_at(15.0)], false);
        let result = eval.evaluate(composite("A", vec![segment(0, 0, 40, 10)]))?;
        assert_eq!(result.zones[0].count, 3);
        assert_eq!(result.zones[0].occupancy_percent, 30.0);
        assert_eq!(result.zones[0].free_slots, 7);
        assert_eq!(result.summary.occupied, vec!["ROI-1"]);
        assert!(result.summary.free.is_empty());
        assert_eq!(result.summary.total_people, 3);
        Ok(())
    }

    #[test]
    fn empty_zone_is_free_at_zero_percent() -> Result<()> {
        let eval = evaluator(Vec::new(), false);
        let result = eval.evaluate(composite("B", vec![segment(0, 0, 40, 10)]))?;
        assert_eq!(result.zones[0].occupancy_percent, 0.0);
        assert_eq!(result.summary.free, vec!["ROI-1"]);
        assert!(result.summary.occupied.is_empty());
        Ok(())
    }

    #[test]
    fn over_capacity_is_clamped() {
        let z = ZoneOccupancy::new(&segment(0, 0, 10, 2), 5);
        assert_eq!(z.occupancy_percent, 100.0);
        assert_eq!(z.free_slots, 0);
        assert_eq!(z.count, 5);
    }

    #[test]
    fn detections_attributed_by_centre_row() {
        let segments = vec![segment(0, 0, 20, 4), segment(1, 20, 30, 4)];
        let detections = vec![
            person_at(0.0),
            person_at(19.9),
            person_at(20.0),
            person_at(49.0),
            person_at(50.0),
            Detection::new([0.0, 5.0, 4.0, 9.0], 0.9, ObjectClass::Vehicle),
            Detection::new([0.0, 5.0, 4.0, 9.0], 0.1, ObjectClass::Person),
        ];
        let (counts, counted) = attribute(&segments, &detections, 0.25);
        assert_eq!(counts, vec![2, 2]);
        assert_eq!(counted.len(), 4);
    }

    #[test]
    fn free_and_occupied_partition_all_zones() -> Result<()> {
        let segments: Vec<_> = (0..6).map(|i| segment(i, i as u32 * 10, 10, 3)).collect();
        let eval = evaluator(vec![person_at(5.0), person_at(25.0), person_at(26.0)], false);
        let result = eval.evaluate(composite("C", segments))?;
        let mut all: Vec<String> = result.summary.free.clone();
        all.extend(result.summary.occupied.clone());
        all.sort();
        let mut expected: Vec<String> = (1..=6).map(|i| format!("ROI-{}", i)).collect();
        expected.sort();
        assert_eq!(all, expected);
        assert_eq!(result.summary.occupied, vec!["ROI-1", "ROI-3"]);
        for z in &result.zones {
            assert!((0.0..=100.0).contains(&z.occupancy_percent));
        }
        Ok(())
    }

    #[test]
    fn detector_error_skips_frame() {
        let eval = evaluator(Vec::new(), true);
        assert!(eval.process(composite("A", vec![segment(0, 0, 10, 1)])).is_none());
        assert_eq!(eval.stats(), EvaluatorStats { evaluated: 0, skipped: 1 });
    }
}
