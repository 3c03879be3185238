use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;

use super::{open_backend, CaptureBackend, CaptureError, SourceLocator};
use crate::frame::{EnqueueOutcome, Frame, FrameQueue};
use crate::pipeline::Shutdown;

/// One camera: an id plus the capture handle it exclusively owns.
pub struct CameraSource {
    camera_id: String,
    locator: SourceLocator,
    backend: Box<dyn CaptureBackend>,
    opened: bool,
    sequence: u64,
}

impl CameraSource {
    pub fn new(camera_id: impl Into<String>, locator: SourceLocator) -> Result<Self> {
        let backend = open_backend(&locator)?;
        Ok(Self::with_backend(camera_id, locator, backend))
    }

    pub fn with_backend(
        camera_id: impl Into<String>,
        locator: SourceLocator,
        backend: Box<dyn CaptureBackend>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            locator,
            backend,
            opened: false,
            sequence: 0,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    /// Capture one frame. A finite source that reached its end is rewound and
    /// read again; a device error closes the handle so the next call reopens it.
    pub fn capture(&mut self) -> Result<Frame, CaptureError> {
        if !self.opened {
            self.backend.open()?;
            self.opened = true;
        }

        let grabbed = match self.backend.grab() {
            Err(CaptureError::EndOfStream) => {
                log::info!("camera {}: end of {}, looping", self.camera_id, self.locator);
                self.backend.rewind().and_then(|()| self.backend.grab())
            }
            other => other,
        };
        let image = match grabbed {
            Err(CaptureError::Device(msg)) => {
                self.backend.close();
                self.opened = false;
                return Err(CaptureError::Device(msg));
            }
            other => other?,
        };

        self.sequence += 1;
        Ok(Frame::new(&self.camera_id, self.sequence, Utc::now(), image))
    }

    pub fn close(&mut self) {
        if self.opened {
            self.backend.close();
            self.opened = false;
        }
    }
}

#[derive(Clone, Debug)]
pub struct CameraWorkerSettings {
    /// Time between captures.
    pub interval: Duration,
    /// Longest a capture may wait for room in the queue.
    pub enqueue_timeout: Duration,
    /// Pause before reopening a failed source.
    pub retry_delay: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CameraStats {
    pub camera_id: String,
    pub captured: u64,
    pub enqueued: u64,
    /// Older frames dropped to admit this camera's newer ones.
    pub dropped: u64,
    pub capture_errors: u64,
}

/// Camera worker loop: capture on every tick until shutdown.
pub fn run_camera(
    mut source: CameraSource,
    queue: Arc<FrameQueue>,
    shutdown: Shutdown,
    settings: CameraWorkerSettings,
) -> CameraStats {
    let mut stats = CameraStats {
        camera_id: source.camera_id().to_string(),
        ..CameraStats::default()
    };
    log::info!(
        "camera {} started ({}, every {:?})",
        source.camera_id(),
        source.locator(),
        settings.interval
    );

    while !shutdown.is_triggered() {
        let tick = Instant::now();
        match source.capture() {
            Ok(frame) => {
                stats.captured += 1;
                match queue.push(frame, settings.enqueue_timeout) {
                    Ok(EnqueueOutcome::Enqueued) => stats.enqueued += 1,
                    Ok(EnqueueOutcome::DroppedOldest) => {
                        stats.enqueued += 1;
                        stats.dropped += 1;
                    }
                    Ok(EnqueueOutcome::Closed) => break,
                    Err(err) => {
                        log::error!("camera {}: {:#}", source.camera_id(), err);
                        break;
                    }
                }
            }
            Err(CaptureError::Decode(msg)) => {
                stats.capture_errors += 1;
                log::warn!("camera {}: bad frame skipped: {}", source.camera_id(), msg);
            }
            Err(err) => {
                stats.capture_errors += 1;
                log::warn!(
                    "camera {}: {}; retrying in {:?}",
                    source.camera_id(),
                    err,
                    settings.retry_delay
                );
                if shutdown.wait_timeout(settings.retry_delay) {
                    break;
                }
                continue;
            }
        }

        let remaining = settings.interval.saturating_sub(tick.elapsed());
        if shutdown.wait_timeout(remaining) {
            break;
        }
    }

    source.close();
    log::info!(
        "camera {} stopped ({} captured, {} dropped, {} errors)",
        stats.camera_id,
        stats.captured,
        stats.dropped,
        stats.capture_errors
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back a scripted sequence of grab results.
    struct Scripted {
        script: VecDeque<Result<RgbImage, CaptureError>>,
        opens: Arc<AtomicUsize>,
        rewind_fails: bool,
    }

    impl Scripted {
        fn new(script: Vec<Result<RgbImage, CaptureError>>) -> Self {
            Self {
                script: script.into(),
                opens: Arc::new(AtomicUsize::new(0)),
                rewind_fails: false,
            }
        }
    }

    impl CaptureBackend for Scripted {
        fn open(&mut self) -> Result<(), CaptureError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn grab(&mut self) -> Result<RgbImage, CaptureError> {
            self.script
                .pop_front()
                .unwrap_or(Err(CaptureError::Device("script exhausted".to_string())))
        }

        fn rewind(&mut self) -> Result<(), CaptureError> {
            if self.rewind_fails {
                self.rewind_fails = false;
                return Err(CaptureError::Device("seek failed".to_string()));
            }
            Ok(())
        }
    }

    fn source(script: Vec<Result<RgbImage, CaptureError>>) -> CameraSource {
        CameraSource::with_backend(
            "cam",
            SourceLocator::File("clip.mp4".into()),
            Box::new(Scripted::new(script)),
        )
    }

    #[test]
    fn end_of_stream_loops_back() -> Result<()> {
        let mut camera = source(vec![
            Ok(RgbImage::new(2, 2)),
            Err(CaptureError::EndOfStream),
            Ok(RgbImage::new(3, 3)),
        ]);
        assert_eq!(camera.capture()?.sequence(), 1);
        let frame = camera.capture()?;
        assert_eq!(frame.sequence(), 2);
        assert_eq!(frame.width(), 3);
        Ok(())
    }

    #[test]
    fn device_error_reopens_on_next_capture() -> Result<()> {
        let mut camera = source(vec![
            Err(CaptureError::Device("unplugged".to_string())),
            Ok(RgbImage::new(2, 2)),
        ]);
        assert!(matches!(camera.capture(), Err(CaptureError::Device(_))));
        assert!(camera.capture().is_ok());
        Ok(())
    }

    #[test]
    fn failed_rewind_reopens_on_next_capture() -> Result<()> {
        let mut backend = Scripted::new(vec![
            Err(CaptureError::EndOfStream),
            Ok(RgbImage::new(2, 2)),
        ]);
        backend.rewind_fails = true;
        let opens = backend.opens.clone();
        let mut camera =
            CameraSource::with_backend("cam", SourceLocator::File("clip.mp4".into()), Box::new(backend));

        assert!(matches!(camera.capture(), Err(CaptureError::Device(_))));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(camera.capture()?.sequence(), 1);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn device_error_after_rewind_reopens() -> Result<()> {
        let backend = Scripted::new(vec![
            Err(CaptureError::EndOfStream),
            Err(CaptureError::Device("decoder lost".to_string())),
            Ok(RgbImage::new(2, 2)),
        ]);
        let opens = backend.opens.clone();
        let mut camera =
            CameraSource::with_backend("cam", SourceLocator::File("clip.mp4".into()), Box::new(backend));

        assert!(matches!(camera.capture(), Err(CaptureError::Device(_))));
        assert!(camera.capture().is_ok());
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn worker_stops_on_shutdown_and_counts_frames() -> Result<()> {
        let queue = Arc::new(FrameQueue::new(["cam"], 4)?);
        let shutdown = Shutdown::new();
        let camera = CameraSource::new(
            "cam",
            SourceLocator::parse("stub://cam?width=64&height=48&people=1")?,
        )?;
        let settings = CameraWorkerSettings {
            interval: Duration::from_millis(5),
            enqueue_timeout: Duration::ZERO,
            retry_delay: Duration::from_millis(5),
        };

        let worker = {
            let (queue, shutdown) = (queue.clone(), shutdown.clone());
            std::thread::spawn(move || run_camera(camera, queue, shutdown, settings))
        };
        std::thread::sleep(Duration::from_millis(100));
        shutdown.trigger();
        let stats = worker.join().unwrap();

        assert!(stats.captured >= 5, "captured {}", stats.captured);
        assert_eq!(queue.len(), 4);
        assert_eq!(stats.dropped, stats.captured - 4);
        assert_eq!(queue.stats().dropped(), stats.dropped);
        Ok(())
    }
}
