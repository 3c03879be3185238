//! Pipeline supervisor.
//!
//! Thread layout:
//! - one capture thread per camera, feeding the shared [`FrameQueue`]
//! - `workers` evaluation threads: lease a frame, aggregate its zones, run
//!   the detector, hand the result to the [`ResultSink`]
//! - the frame writer thread owned by the sink
//! - the publisher thread owning the outbound connection
//!
//! Shutdown runs in pipeline order: cameras stop first, the queue is closed
//! and drained by the evaluation workers within the grace period, then the
//! sink and publisher flush.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::detect::BackendRegistry;
use crate::frame::{FrameQueue, QueueStats};
use crate::ingest::{run_camera, CameraSource, CameraStats, CameraWorkerSettings};
use crate::occupancy::{EvaluatorStats, OccupancyEvaluator};
use crate::publish::{
    transport_from_url, Publisher, PublisherSettings, PublisherStats, TlsMaterials, Transport,
    TransportOptions,
};
use crate::roi::aggregate;
use crate::sink::{ResultSink, SinkStats};
use crate::zones::ZoneMap;

const POP_TIMEOUT: Duration = Duration::from_millis(100);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Cooperative stop signal shared by every long-running loop.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: Mutex<bool>,
    cvar: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut triggered = self
            .inner
            .triggered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *triggered = true;
        self.inner.cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self
            .inner
            .triggered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, waking early on trigger. Returns true once
    /// triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self
            .inner
            .triggered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .cvar
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            triggered = guard;
        }
        true
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Build the outbound transport named by the publish URL.
pub fn build_transport(config: &PipelineConfig) -> Result<Box<dyn Transport>> {
    let publish = &config.publish;
    let tls = TlsMaterials::load(
        publish.tls_ca_path.as_deref(),
        publish.tls_client_cert_path.as_deref(),
        publish.tls_client_key_path.as_deref(),
    )?;
    transport_from_url(&TransportOptions {
        url: publish.url.clone(),
        topic: publish.topic.clone(),
        client_id: publish.client_id.clone(),
        username: publish.username.clone(),
        password: publish.password.clone(),
        tls,
        connect_timeout: publish.connect_timeout,
        send_timeout: publish.send_timeout,
    })
}

#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    pub queue: QueueStats,
    pub evaluator: EvaluatorStats,
    pub sink: SinkStats,
    pub publisher: PublisherStats,
    /// Filled in once the camera threads have been joined.
    pub cameras: Vec<CameraStats>,
    /// Frames still queued when the grace period ran out.
    pub abandoned: usize,
}

/// Running pipeline. Dropping it stops everything without a grace period.
pub struct Pipeline {
    camera_stop: Shutdown,
    hard_stop: Arc<AtomicBool>,
    queue: Arc<FrameQueue>,
    evaluator: Arc<OccupancyEvaluator>,
    sink: Option<Arc<ResultSink>>,
    publisher: Option<Publisher>,
    cameras: Vec<JoinHandle<CameraStats>>,
    workers: Vec<JoinHandle<()>>,
    health_interval: Duration,
}

impl Pipeline {
    /// Validate everything, then spawn publisher, sink, evaluation workers
    /// and cameras in that order. Nothing is spawned when validation fails.
    pub fn start(
        config: &PipelineConfig,
        zones: ZoneMap,
        registry: Arc<BackendRegistry>,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        config.check_zones(&zones)?;
        let camera_ids: Vec<&str> = config.cameras.iter().map(|c| c.id.as_str()).collect();
        let queue = Arc::new(FrameQueue::new(camera_ids, config.capture.queue_capacity)?);
        let sources = config
            .cameras
            .iter()
            .map(|camera| {
                CameraSource::new(&camera.id, camera.source.clone())
                    .with_context(|| format!("camera '{}'", camera.id))
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(dir) = &config.output_dir {
            ensure_writable_dir(dir)?;
        }

        let publisher = Publisher::start(
            transport,
            PublisherSettings {
                backoff_base: config.publish.backoff_base,
                backoff_max: config.publish.backoff_max,
                outbox_capacity: config.publish.outbox_capacity,
                ..PublisherSettings::default()
            },
        )?;
        let sink = ResultSink::new(config.output_dir.clone(), publisher.outbox())?;

        let mut pipeline = Self {
            camera_stop: Shutdown::new(),
            hard_stop: Arc::new(AtomicBool::new(false)),
            queue,
            evaluator: Arc::new(OccupancyEvaluator::new(
                registry,
                config.detector.confidence_threshold,
            )),
            sink: Some(Arc::new(sink)),
            publisher: Some(publisher),
            cameras: Vec::new(),
            workers: Vec::new(),
            health_interval: config.health_interval,
        };
        if let Err(err) = pipeline.spawn_threads(config, Arc::new(zones), sources) {
            pipeline.stop_now();
            return Err(err);
        }
        log::info!(
            "pipeline started: {} camera(s), {} evaluation worker(s)",
            pipeline.cameras.len(),
            pipeline.workers.len()
        );
        Ok(pipeline)
    }

    fn spawn_threads(
        &mut self,
        config: &PipelineConfig,
        zones: Arc<ZoneMap>,
        sources: Vec<CameraSource>,
    ) -> Result<()> {
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| anyhow!("result sink already shut down"))?;
        for n in 0..config.detector.workers {
            let worker = EvaluationWorker {
                queue: self.queue.clone(),
                zones: zones.clone(),
                evaluator: self.evaluator.clone(),
                sink: sink.clone(),
                hard_stop: self.hard_stop.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("eval-{}", n))
                .spawn(move || worker.run())
                .context("failed to spawn evaluation worker")?;
            self.workers.push(handle);
        }

        for (source, camera) in sources.into_iter().zip(&config.cameras) {
            let settings = CameraWorkerSettings {
                interval: config.interval_for(camera),
                enqueue_timeout: config.capture.enqueue_timeout,
                retry_delay: config.capture.retry_delay,
            };
            let queue = self.queue.clone();
            let stop = self.camera_stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("camera-{}", camera.id))
                .spawn(move || run_camera(source, queue, stop, settings))
                .with_context(|| format!("failed to spawn camera '{}'", camera.id))?;
            self.cameras.push(handle);
        }
        Ok(())
    }

    /// Block until `stop` is triggered, logging a health line every health
    /// interval.
    pub fn run_until(&self, stop: &Shutdown) {
        while !stop.wait_timeout(self.health_interval) {
            self.log_health();
        }
    }

    pub fn log_health(&self) {
        let stats = self.stats();
        log::info!(
            "health: queued {} ({} KiB, dropped {}), evaluated {} (skipped {}), publisher {} (sent {}, dropped {}, connections {})",
            stats.queue.depth(),
            stats.queue.bytes() / 1024,
            stats.queue.dropped(),
            stats.evaluator.evaluated,
            stats.evaluator.skipped,
            stats.publisher.state,
            stats.publisher.sent,
            stats.publisher.dropped,
            stats.publisher.connections
        );
    }

    /// Live snapshot; camera counters are only known after shutdown.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queue: self.queue.stats(),
            evaluator: self.evaluator.stats(),
            sink: self.sink.as_ref().map(|s| s.stats()).unwrap_or_default(),
            publisher: self
                .publisher
                .as_ref()
                .map(Publisher::stats)
                .unwrap_or_default(),
            cameras: Vec::new(),
            abandoned: 0,
        }
    }

    /// Stop cameras, let the workers drain the queue for up to `grace`, then
    /// flush the sink and the publisher.
    pub fn shutdown(mut self, grace: Duration) -> Result<PipelineStats> {
        let deadline = Instant::now() + grace;
        log::info!("shutting down (grace {:?})", grace);

        self.camera_stop.trigger();
        let cameras = self.join_cameras();
        self.queue.close();

        while Instant::now() < deadline && self.workers.iter().any(|w| !w.is_finished()) {
            std::thread::sleep(JOIN_POLL);
        }
        self.hard_stop.store(true, Ordering::SeqCst);
        self.join_workers();
        let abandoned = self.queue.len();
        if abandoned > 0 {
            log::warn!("{} queued frame(s) abandoned at shutdown", abandoned);
        }

        let sink = self.finish_sink();
        let publisher = match self.publisher.take() {
            Some(publisher) => publisher.shutdown(deadline.saturating_duration_since(Instant::now()))?,
            None => PublisherStats::default(),
        };

        let stats = PipelineStats {
            queue: self.queue.stats(),
            evaluator: self.evaluator.stats(),
            sink,
            publisher,
            cameras,
            abandoned,
        };
        log::info!(
            "pipeline stopped: {} evaluated, {} payload(s) sent",
            stats.evaluator.evaluated,
            stats.publisher.sent
        );
        Ok(stats)
    }

    fn join_cameras(&mut self) -> Vec<CameraStats> {
        self.cameras
            .drain(..)
            .filter_map(|handle| match handle.join() {
                Ok(stats) => Some(stats),
                Err(_) => {
                    log::warn!("camera thread panicked");
                    None
                }
            })
            .collect()
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("evaluation worker panicked");
            }
        }
    }

    fn finish_sink(&mut self) -> SinkStats {
        match self.sink.take().map(Arc::try_unwrap) {
            Some(Ok(sink)) => sink.shutdown(),
            Some(Err(shared)) => {
                log::warn!("result sink still in use at shutdown");
                shared.stats()
            }
            None => SinkStats::default(),
        }
    }

    fn stop_now(&mut self) {
        self.camera_stop.trigger();
        self.hard_stop.store(true, Ordering::SeqCst);
        self.queue.close();
        self.join_cameras();
        self.join_workers();
        self.finish_sink();
        if let Some(publisher) = self.publisher.take() {
            if let Err(err) = publisher.shutdown(Duration::ZERO) {
                log::warn!("{:#}", err);
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.publisher.is_some() {
            self.stop_now();
        }
    }
}

const WRITE_CHECK_FILE: &str = ".occupancy-write-check";

/// Create `dir` if needed and prove a file can be written into it.
fn ensure_writable_dir(dir: &Path) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(anyhow!(
            "output path {} exists and is not a directory",
            dir.display()
        ));
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output dir {}", dir.display()))?;
    let check = dir.join(WRITE_CHECK_FILE);
    std::fs::write(&check, b"")
        .with_context(|| format!("output dir {} is not writable", dir.display()))?;
    if let Err(err) = std::fs::remove_file(&check) {
        log::debug!("could not remove {}: {}", check.display(), err);
    }
    Ok(())
}

struct EvaluationWorker {
    queue: Arc<FrameQueue>,
    zones: Arc<ZoneMap>,
    evaluator: Arc<OccupancyEvaluator>,
    sink: Arc<ResultSink>,
    hard_stop: Arc<AtomicBool>,
}

impl EvaluationWorker {
    fn run(self) {
        while !self.hard_stop.load(Ordering::SeqCst) {
            let Some(lease) = self.queue.pop(POP_TIMEOUT) else {
                if self.queue.is_drained() {
                    break;
                }
                continue;
            };
            let Some(zones) = self.zones.zones_for(lease.camera_id()) else {
                log::warn!("no zones for camera {}, frame skipped", lease.camera_id());
                continue;
            };
            let Some(composite) = aggregate(&lease, zones) else {
                continue;
            };
            if let Some(evaluation) = self.evaluator.process(composite) {
                self.sink.handle(&evaluation);
            }
            // Held until the hand-off so one camera's results stay in order.
            drop(lease);
        }
    }
}
