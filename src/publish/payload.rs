use anyhow::{Context, Result};
use serde::Serialize;

use crate::occupancy::{Evaluation, Summary, ZoneOccupancy};

/// Structured record handed to the publisher, one per evaluated frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutgoingPayload {
    pub event: &'static str,
    pub camera: String,
    /// Capture time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub summary: Summary,
    pub segments: Vec<SegmentRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SegmentRecord {
    pub index: usize,
    pub zone: String,
    pub height: u32,
    pub width: u32,
    pub y_offset: u32,
    pub capacity: u32,
    pub count: u32,
    pub occupancy_percent: f64,
    pub free_slots: u32,
    pub status: &'static str,
}

impl OutgoingPayload {
    pub const EVENT: &'static str = "frame_result";

    pub fn from_evaluation(evaluation: &Evaluation) -> Self {
        let composite = &evaluation.composite;
        let segments = composite
            .segments
            .iter()
            .zip(&evaluation.zones)
            .map(|(segment, zone): (_, &ZoneOccupancy)| SegmentRecord {
                index: segment.index,
                zone: segment.zone.clone(),
                height: segment.height,
                width: segment.width,
                y_offset: segment.y_offset,
                capacity: zone.capacity,
                count: zone.count,
                occupancy_percent: zone.occupancy_percent,
                free_slots: zone.free_slots,
                status: zone.status(),
            })
            .collect();
        Self {
            event: Self::EVENT,
            camera: composite.camera_id.clone(),
            timestamp: composite.captured_at.timestamp_micros() as f64 / 1_000_000.0,
            summary: evaluation.summary.clone(),
            segments,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to serialize payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roi::{CompositeImage, Segment};
    use chrono::{TimeZone, Utc};
    use image::RgbImage;

    #[test]
    fn payload_carries_summary_and_segments() -> Result<()> {
        let segment = Segment {
            index: 0,
            zone_index: 0,
            zone: "Bench".to_string(),
            capacity: 4,
            y_offset: 0,
            height: 30,
            width: 50,
            x_offset: 0,
        };
        let zone = ZoneOccupancy::new(&segment, 1);
        let captured_at = Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap();
        let evaluation = Evaluation {
            summary: Summary::from_zones("lobby", captured_at, std::slice::from_ref(&zone)),
            composite: CompositeImage {
                camera_id: "lobby".to_string(),
                sequence: 3,
                captured_at,
                image: RgbImage::new(50, 30),
                segments: vec![segment],
            },
            counted: Vec::new(),
            zones: vec![zone],
        };

        let payload = OutgoingPayload::from_evaluation(&evaluation);
        let json: serde_json::Value = serde_json::from_slice(&payload.to_json_bytes()?)?;
        assert_eq!(json["event"], "frame_result");
        assert_eq!(json["camera"], "lobby");
        assert_eq!(json["timestamp"], 1_700_000_000.5);
        assert_eq!(json["summary"]["total_people"], 1);
        assert_eq!(json["summary"]["occupied"][0], "Bench");
        assert_eq!(json["summary"]["free"].as_array().map(Vec::len), Some(0));
        assert_eq!(json["segments"][0]["y_offset"], 0);
        assert_eq!(json["segments"][0]["occupancy_percent"], 25.0);
        assert_eq!(json["segments"][0]["status"], "occupied");
        assert!(json["summary"].get("camera_id").is_none());
        Ok(())
    }
}
