//! Result sink: annotated frame on disk, one log line, payload to the outbox.
//!
//! Nothing here waits on I/O. Frames are written by a dedicated writer thread
//! fed through a small bounded channel; when the writer falls behind the
//! frame is skipped. Payloads are offered to the publisher's outbox, which
//! never blocks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::occupancy::{Evaluation, Summary};
use crate::publish::{OfferOutcome, Outbox, OutgoingPayload};

const WRITE_QUEUE: usize = 4;
const JPEG_QUALITY: u8 = 85;
const FREE_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const OCCUPIED_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const MARKER_COLOR: Rgb<u8> = Rgb([255, 210, 0]);

/// `[<iso>] camera=<id> | free: <names> | occupied: <names> | people: <n>`
pub fn format_summary_line(summary: &Summary) -> String {
    let names = |list: &[String]| {
        if list.is_empty() {
            "None".to_string()
        } else {
            list.join(", ")
        }
    };
    format!(
        "[{}] camera={} | free: {} | occupied: {} | people: {}",
        summary.captured_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        summary.camera_id,
        names(summary.free.as_slice()),
        names(summary.occupied.as_slice()),
        summary.total_people
    )
}

/// `<camera>_<YYYYmmdd_HHMMSS_ffffff>.jpg`, with path separators in the camera id replaced.
pub fn frame_file_name(camera_id: &str, captured_at: DateTime<Utc>) -> String {
    let camera: String = camera_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}_{}.jpg", camera, captured_at.format("%Y%m%d_%H%M%S_%6f"))
}

/// Composite image with a frame around every segment (green free, red
/// occupied) and a marker at each counted detection centre.
pub fn annotate(evaluation: &Evaluation) -> RgbImage {
    let composite = &evaluation.composite;
    let mut image = composite.image.clone();
    for (segment, zone) in composite.segments.iter().zip(&evaluation.zones) {
        let color = if zone.is_occupied() { OCCUPIED_COLOR } else { FREE_COLOR };
        draw_rectangle(
            &mut image,
            segment.x_offset as i64,
            segment.y_offset as i64,
            (segment.x_offset + segment.width) as i64 - 1,
            segment.y_end() as i64 - 1,
            color,
        );
    }
    for detection in &evaluation.counted {
        let (cx, cy) = detection.center();
        let (cx, cy) = (cx.round() as i64, cy.round() as i64);
        fill_rect(&mut image, cx - 3, cy - 3, cx + 3, cy + 3, MARKER_COLOR);
    }
    image
}

fn draw_rectangle(image: &mut RgbImage, left: i64, top: i64, right: i64, bottom: i64, color: Rgb<u8>) {
    fill_rect(image, left, top, right, top + 1, color);
    fill_rect(image, left, bottom - 1, right, bottom, color);
    fill_rect(image, left, top, left + 1, bottom, color);
    fill_rect(image, right - 1, top, right, bottom, color);
}

/// Fill the inclusive rectangle, clipped to the image.
fn fill_rect(image: &mut RgbImage, left: i64, top: i64, right: i64, bottom: i64, color: Rgb<u8>) {
    let (width, height) = (image.width() as i64, image.height() as i64);
    if width == 0 || height == 0 {
        return;
    }
    let (x0, x1) = (left.clamp(0, width - 1), right.clamp(0, width - 1));
    let (y0, y1) = (top.clamp(0, height - 1), bottom.clamp(0, height - 1));
    for y in y0..=y1 {
        for x in x0..=x1 {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn write_jpeg(path: &Path, image: &RgbImage) -> Result<()> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    std::fs::write(path, buffer).with_context(|| format!("failed to write {}", path.display()))
}

struct WriteJob {
    path: PathBuf,
    image: RgbImage,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    write_failures: AtomicU64,
    write_skipped: AtomicU64,
    published: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub written: u64,
    pub write_failures: u64,
    /// Frames not written because the writer was busy.
    pub write_skipped: u64,
    pub published: u64,
    /// Payloads that pushed an older payload out of the outbox.
    pub evicted: u64,
}

/// Fan-out point for evaluated frames. Shared by all evaluation workers.
pub struct ResultSink {
    output_dir: Option<PathBuf>,
    writer_tx: Option<Sender<WriteJob>>,
    writer: Option<JoinHandle<()>>,
    outbox: Outbox,
    counters: Arc<Counters>,
}

impl ResultSink {
    /// `output_dir = None` disables frame writing.
    pub fn new(output_dir: Option<PathBuf>, outbox: Outbox) -> Result<Self> {
        let counters = Arc::new(Counters::default());
        let (writer_tx, writer) = match &output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create output dir {}", dir.display()))?;
                let (tx, rx) = bounded::<WriteJob>(WRITE_QUEUE);
                let counters = counters.clone();
                let handle = std::thread::Builder::new()
                    .name("frame-writer".to_string())
                    .spawn(move || {
                        for job in rx.iter() {
                            match write_jpeg(&job.path, &job.image) {
                                Ok(()) => {
                                    counters.written.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(err) => {
                                    counters.write_failures.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("{:#}", err);
                                }
                            }
                        }
                    })
                    .context("failed to spawn frame writer")?;
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };
        Ok(Self {
            output_dir,
            writer_tx,
            writer,
            outbox,
            counters,
        })
    }

    pub fn handle(&self, evaluation: &Evaluation) {
        self.write_frame(evaluation);
        log::info!("{}", format_summary_line(&evaluation.summary));

        let payload = OutgoingPayload::from_evaluation(evaluation);
        match self.outbox.offer(payload) {
            OfferOutcome::Queued => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            OfferOutcome::EvictedOldest => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                log::debug!("outbox full, oldest payload evicted");
            }
        }
    }

    fn write_frame(&self, evaluation: &Evaluation) {
        let (Some(dir), Some(tx)) = (&self.output_dir, &self.writer_tx) else {
            return;
        };
        let composite = &evaluation.composite;
        let job = WriteJob {
            path: dir.join(frame_file_name(&composite.camera_id, composite.captured_at)),
            image: annotate(evaluation),
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                self.counters.write_skipped.fetch_add(1, Ordering::Relaxed);
                log::debug!("frame writer busy, skipped {}", job.path.display());
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("frame writer has stopped");
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        let c = &self.counters;
        SinkStats {
            written: c.written.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            write_skipped: c.write_skipped.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
        }
    }

    /// Finish pending writes and stop the writer thread.
    pub fn shutdown(mut self) -> SinkStats {
        self.writer_tx.take();
        if let Some(handle) = self.writer.take() {
            if handle.join().is_err() {
                log::warn!("frame writer panicked");
            }
        }
        self.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, ObjectClass};
    use crate::occupancy::ZoneOccupancy;
    use crate::roi::{CompositeImage, Segment};
    use chrono::TimeZone;

    fn evaluation(count: u32) -> Evaluation {
        let segment = Segment {
            index: 0,
            zone_index: 0,
            zone: "Bench".to_string(),
            capacity: 4,
            y_offset: 0,
            height: 20,
            width: 30,
            x_offset: 0,
        };
        let zone = ZoneOccupancy::new(&segment, count);
        let captured_at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let counted = (0..count)
            .map(|_| Detection::new([10.0, 6.0, 20.0, 14.0], 0.9, ObjectClass::Person))
            .collect();
        Evaluation {
            summary: Summary::from_zones("lobby", captured_at, std::slice::from_ref(&zone)),
            composite: CompositeImage {
                camera_id: "lobby".to_string(),
                sequence: 1,
                captured_at,
                image: RgbImage::new(30, 20),
                segments: vec![segment],
            },
            counted,
            zones: vec![zone],
        }
    }

    #[test]
    fn summary_line_lists_zones() {
        let line = format_summary_line(&evaluation(2).summary);
        assert_eq!(
            line,
            "[2024-03-09T14:05:07.000000Z] camera=lobby | free: None | occupied: Bench | people: 2"
        );
    }

    #[test]
    fn file_name_is_camera_and_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(frame_file_name("lobby", ts), "lobby_20240309_140507_000000.jpg");
        assert_eq!(frame_file_name("a/b c", ts), "a_b_c_20240309_140507_000000.jpg");
    }

    #[test]
    fn annotation_marks_zone_and_detection() {
        let image = annotate(&evaluation(1));
        assert_eq!(image.get_pixel(0, 0), &OCCUPIED_COLOR);
        assert_eq!(image.get_pixel(15, 10), &MARKER_COLOR);

        let free = annotate(&evaluation(0));
        assert_eq!(free.get_pixel(29, 19), &FREE_COLOR);
        assert_eq!(free.get_pixel(15, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn handle_writes_frame_and_queues_payload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let outbox = Outbox::new(4);
        let sink = ResultSink::new(Some(dir.path().to_path_buf()), outbox.clone())?;
        sink.handle(&evaluation(1));
        let stats = sink.shutdown();

        assert_eq!(stats.written, 1);
        assert_eq!(stats.published, 1);
        assert!(dir.path().join("lobby_20240309_140507_000000.jpg").exists());
        assert_eq!(outbox.len(), 1);
        Ok(())
    }

    #[test]
    fn disabled_output_only_publishes() -> Result<()> {
        let outbox = Outbox::new(1);
        let sink = ResultSink::new(None, outbox.clone())?;
        sink.handle(&evaluation(0));
        sink.handle(&evaluation(0));
        let stats = sink.shutdown();
        assert_eq!(stats.written, 0);
        assert_eq!(stats.published, 2);
        assert_eq!(stats.evicted, 1);
        assert_eq!(outbox.len(), 1);
        Ok(())
    }
}
