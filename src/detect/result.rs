/// One detected object in image pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub confidence: f32,
    pub class: ObjectClass,
}

impl Detection {
    pub fn new(bbox: [f32; 4], confidence: f32, class: ObjectClass) -> Self {
        Self {
            x0: bbox[0].min(bbox[2]),
            y0: bbox[1].min(bbox[3]),
            x1: bbox[0].max(bbox[2]),
            y1: bbox[1].max(bbox[3]),
            confidence,
            class,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn area(&self) -> f32 {
        (self.x1 - self.x0).max(0.0) * (self.y1 - self.y0).max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Detection) -> f32 {
        let w = (self.x1.min(other.x1) - self.x0.max(other.x0)).max(0.0);
        let h = (self.y1.min(other.y1) - self.y0.max(other.y0)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Unknown,
}

impl ObjectClass {
    /// Map a COCO class id to a coarse class.
    pub fn from_coco_id(id: usize) -> Self {
        match id {
            0 => ObjectClass::Person,
            1..=8 => ObjectClass::Vehicle,
            14..=23 => ObjectClass::Animal,
            _ => ObjectClass::Unknown,
        }
    }

    pub fn is_person(self) -> bool {
        self == ObjectClass::Person
    }
}

/// Greedy per-class non-maximum suppression. Keeps the highest-confidence box
/// of every cluster whose IoU exceeds `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class == candidate.class && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_is_normalised_on_construction() {
        let d = Detection::new([10.0, 40.0, 0.0, 20.0], 0.9, ObjectClass::Person);
        assert_eq!((d.x0, d.y0, d.x1, d.y1), (0.0, 20.0, 10.0, 40.0));
        assert_eq!(d.center(), (5.0, 30.0));
    }

    #[test]
    fn nms_keeps_best_of_overlapping_boxes() {
        let boxes = vec![
            Detection::new([0.0, 0.0, 10.0, 10.0], 0.6, ObjectClass::Person),
            Detection::new([1.0, 1.0, 11.0, 11.0], 0.9, ObjectClass::Person),
            Detection::new([50.0, 50.0, 60.0, 60.0], 0.7, ObjectClass::Person),
            Detection::new([1.0, 1.0, 11.0, 11.0], 0.8, ObjectClass::Vehicle),
        ];
        let kept = non_max_suppression(boxes, 0.45);
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.8, 0.7]);
    }

    #[test]
    fn coco_ids_map_to_classes() {
        assert_eq!(ObjectClass::from_coco_id(0), ObjectClass::Person);
        assert_eq!(ObjectClass::from_coco_id(2), ObjectClass::Vehicle);
        assert_eq!(ObjectClass::from_coco_id(16), ObjectClass::Animal);
        assert_eq!(ObjectClass::from_coco_id(60), ObjectClass::Unknown);
        assert!(ObjectClass::from_coco_id(0).is_person());
    }
}
