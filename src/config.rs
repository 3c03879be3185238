use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::SourceLocator;
use crate::zones::ZoneMap;

const DEFAULT_ZONES_PATH: &str = "data/roi.json";
const DEFAULT_OUTPUT_DIR: &str = "output/frames";
const DEFAULT_FRAME_INTERVAL_SECS: f64 = 10.0;
const DEFAULT_QUEUE_CAPACITY: usize = crate::frame::DEFAULT_QUEUE_CAPACITY;
const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 100;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_PUBLISH_URL: &str = "tcp://127.0.0.1:8000";
const DEFAULT_PUBLISH_TOPIC: &str = "occupancy/frames";
const DEFAULT_CLIENT_ID: &str = "occupancyd";
const DEFAULT_OUTBOX_CAPACITY: usize = 32;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 8000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

/// Environment variables read by [`PipelineConfig::load`].
pub const ENV_KEYS: &[&str] = &[
    "OCCUPANCY_CONFIG",
    "OCCUPANCY_ZONES_PATH",
    "OCCUPANCY_OUTPUT_DIR",
    "OCCUPANCY_VIDEO_SOURCES",
    "OCCUPANCY_FRAME_INTERVAL_SECS",
    "OCCUPANCY_QUEUE_CAPACITY",
    "OCCUPANCY_WORKERS",
    "OCCUPANCY_DETECTOR",
    "OCCUPANCY_MODEL_PATH",
    "OCCUPANCY_CONFIDENCE_THRESHOLD",
    "OCCUPANCY_PUBLISH_URL",
    "OCCUPANCY_PUBLISH_TOPIC",
    "OCCUPANCY_MQTT_CLIENT_ID",
    "OCCUPANCY_MQTT_USERNAME",
    "OCCUPANCY_MQTT_PASSWORD",
    "OCCUPANCY_MQTT_TLS_CA_PATH",
    "OCCUPANCY_MQTT_TLS_CLIENT_CERT_PATH",
    "OCCUPANCY_MQTT_TLS_CLIENT_KEY_PATH",
    "OCCUPANCY_SHUTDOWN_GRACE_MS",
];

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    zones_path: Option<PathBuf>,
    output_dir: Option<String>,
    cameras: Option<Vec<CameraConfigFile>>,
    capture: Option<CaptureConfigFile>,
    detector: Option<DetectorConfigFile>,
    publish: Option<PublishConfigFile>,
    shutdown_grace_ms: Option<u64>,
    health_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    id: Option<String>,
    source: String,
    interval_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    frame_interval_secs: Option<f64>,
    queue_capacity: Option<usize>,
    enqueue_timeout_ms: Option<u64>,
    retry_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    workers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PublishConfigFile {
    url: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    outbox_capacity: Option<usize>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub zones_path: PathBuf,
    /// Where annotated frames go; `None` disables writing.
    pub output_dir: Option<PathBuf>,
    pub cameras: Vec<CameraConfig>,
    pub capture: CaptureSettings,
    pub detector: DetectorSettings,
    pub publish: PublishSettings,
    pub shutdown_grace: Duration,
    pub health_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    pub source: SourceLocator,
    /// Per-camera override of the capture interval.
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub frame_interval: Duration,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub url: String,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub outbox_capacity: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
}

/// Command-line values; each one that is set wins over file and environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub zones_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub no_frames: bool,
    pub video_sources: Vec<String>,
    pub frame_interval_secs: Option<f64>,
    pub detector: Option<String>,
    pub model_path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub publish_url: Option<String>,
}

impl PipelineConfig {
    /// Defaults, then `OCCUPANCY_CONFIG`, then environment.
    pub fn load() -> Result<Self> {
        Self::load_with(None, &ConfigOverrides::default())
    }

    /// Like [`load`](Self::load), with an explicit config file taking the
    /// place of `OCCUPANCY_CONFIG` and command-line overrides applied last.
    pub fn load_with(config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .or_else(|| env_value("OCCUPANCY_CONFIG").map(PathBuf::from));
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.apply_overrides(overrides)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let capture = file.capture.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let publish = file.publish.unwrap_or_default();

        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|camera| {
                let source = SourceLocator::parse(&camera.source)?;
                Ok(CameraConfig {
                    id: camera.id.unwrap_or_else(|| source.default_camera_id()),
                    source,
                    interval: camera.interval_secs.map(secs_to_duration).transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let output_dir = match file.output_dir {
            Some(dir) if dir.trim().is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => Some(PathBuf::from(DEFAULT_OUTPUT_DIR)),
        };

        Ok(Self {
            zones_path: file
                .zones_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ZONES_PATH)),
            output_dir,
            cameras,
            capture: CaptureSettings {
                frame_interval: secs_to_duration(
                    capture
                        .frame_interval_secs
                        .unwrap_or(DEFAULT_FRAME_INTERVAL_SECS),
                )?,
                queue_capacity: capture.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                enqueue_timeout: Duration::from_millis(
                    capture
                        .enqueue_timeout_ms
                        .unwrap_or(DEFAULT_ENQUEUE_TIMEOUT_MS),
                ),
                retry_delay: Duration::from_millis(
                    capture.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
                ),
            },
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector.model_path,
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                workers: detector.workers.unwrap_or(DEFAULT_WORKERS),
            },
            publish: PublishSettings {
                url: publish
                    .url
                    .unwrap_or_else(|| DEFAULT_PUBLISH_URL.to_string()),
                topic: publish
                    .topic
                    .unwrap_or_else(|| DEFAULT_PUBLISH_TOPIC.to_string()),
                client_id: publish
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                username: publish.username,
                password: publish.password,
                tls_ca_path: publish.tls_ca_path,
                tls_client_cert_path: publish.tls_client_cert_path,
                tls_client_key_path: publish.tls_client_key_path,
                outbox_capacity: publish.outbox_capacity.unwrap_or(DEFAULT_OUTBOX_CAPACITY),
                backoff_base: Duration::from_millis(
                    publish.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
                ),
                backoff_max: Duration::from_millis(
                    publish.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS),
                ),
                connect_timeout: Duration::from_millis(
                    publish
                        .connect_timeout_ms
                        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
                ),
                send_timeout: Duration::from_millis(
                    publish.send_timeout_ms.unwrap_or(DEFAULT_SEND_TIMEOUT_MS),
                ),
            },
            shutdown_grace: Duration::from_millis(
                file.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
            health_interval: Duration::from_secs(
                file.health_interval_secs
                    .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("OCCUPANCY_ZONES_PATH") {
            self.zones_path = PathBuf::from(path);
        }
        if let Some(dir) = env_value("OCCUPANCY_OUTPUT_DIR") {
            self.output_dir = Some(PathBuf::from(dir));
        }
        if let Some(sources) = env_value("OCCUPANCY_VIDEO_SOURCES") {
            let parsed = split_csv(&sources);
            if !parsed.is_empty() {
                self.cameras = cameras_from_sources(&parsed)?;
            }
        }
        if let Some(interval) = env_value("OCCUPANCY_FRAME_INTERVAL_SECS") {
            let secs: f64 = interval.parse().map_err(|_| {
                anyhow!("OCCUPANCY_FRAME_INTERVAL_SECS must be a number of seconds")
            })?;
            self.capture.frame_interval = secs_to_duration(secs)?;
        }
        if let Some(capacity) = env_value("OCCUPANCY_QUEUE_CAPACITY") {
            self.capture.queue_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("OCCUPANCY_QUEUE_CAPACITY must be a positive integer"))?;
        }
        if let Some(workers) = env_value("OCCUPANCY_WORKERS") {
            self.detector.workers = workers
                .parse()
                .map_err(|_| anyhow!("OCCUPANCY_WORKERS must be a positive integer"))?;
        }
        if let Some(backend) = env_value("OCCUPANCY_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_value("OCCUPANCY_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(threshold) = env_value("OCCUPANCY_CONFIDENCE_THRESHOLD") {
            self.detector.confidence_threshold = threshold.parse().map_err(|_| {
                anyhow!("OCCUPANCY_CONFIDENCE_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        if let Some(url) = env_value("OCCUPANCY_PUBLISH_URL") {
            self.publish.url = url;
        }
        if let Some(topic) = env_value("OCCUPANCY_PUBLISH_TOPIC") {
            self.publish.topic = topic;
        }
        if let Some(client_id) = env_value("OCCUPANCY_MQTT_CLIENT_ID") {
            self.publish.client_id = client_id;
        }
        if let Some(username) = env_value("OCCUPANCY_MQTT_USERNAME") {
            self.publish.username = Some(username);
        }
        if let Some(password) = env_value("OCCUPANCY_MQTT_PASSWORD") {
            self.publish.password = Some(password);
        }
        if let Some(path) = env_value("OCCUPANCY_MQTT_TLS_CA_PATH") {
            self.publish.tls_ca_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("OCCUPANCY_MQTT_TLS_CLIENT_CERT_PATH") {
            self.publish.tls_client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("OCCUPANCY_MQTT_TLS_CLIENT_KEY_PATH") {
            self.publish.tls_client_key_path = Some(PathBuf::from(path));
        }
        if let Some(grace) = env_value("OCCUPANCY_SHUTDOWN_GRACE_MS") {
            let millis: u64 = grace.parse().map_err(|_| {
                anyhow!("OCCUPANCY_SHUTDOWN_GRACE_MS must be an integer number of milliseconds")
            })?;
            self.shutdown_grace = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(path) = &overrides.zones_path {
            self.zones_path = path.clone();
        }
        if let Some(dir) = &overrides.output_dir {
            self.output_dir = Some(dir.clone());
        }
        if overrides.no_frames {
            self.output_dir = None;
        }
        if !overrides.video_sources.is_empty() {
            self.cameras = cameras_from_sources(&overrides.video_sources)?;
        }
        if let Some(secs) = overrides.frame_interval_secs {
            self.capture.frame_interval = secs_to_duration(secs)?;
        }
        if let Some(backend) = &overrides.detector {
            self.detector.backend = backend.clone();
        }
        if let Some(path) = &overrides.model_path {
            self.detector.model_path = Some(path.clone());
        }
        if let Some(workers) = overrides.workers {
            self.detector.workers = workers;
        }
        if let Some(url) = &overrides.publish_url {
            self.publish.url = url.clone();
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!(
                "no cameras configured; set `cameras` in the config file or OCCUPANCY_VIDEO_SOURCES"
            ));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(anyhow!("camera id for {} must not be empty", camera.source));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.id));
            }
            if camera.interval == Some(Duration::ZERO) {
                return Err(anyhow!("camera {}: interval must be greater than zero", camera.id));
            }
        }
        if self.capture.frame_interval.is_zero() {
            return Err(anyhow!("frame interval must be greater than zero"));
        }
        if self.capture.queue_capacity == 0 {
            return Err(anyhow!("queue capacity must be at least 1"));
        }
        if self.detector.workers == 0 {
            return Err(anyhow!("evaluation workers must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("confidence threshold must be between 0 and 1"));
        }
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if self.publish.outbox_capacity == 0 {
            return Err(anyhow!("outbox capacity must be at least 1"));
        }
        if self.publish.backoff_base.is_zero() {
            return Err(anyhow!("backoff base delay must be greater than zero"));
        }
        if self.publish.backoff_base > self.publish.backoff_max {
            return Err(anyhow!(
                "backoff base delay ({:?}) exceeds the maximum delay ({:?})",
                self.publish.backoff_base,
                self.publish.backoff_max
            ));
        }
        if self.publish.topic.trim().is_empty() {
            return Err(anyhow!("publish topic must not be empty"));
        }
        if self.health_interval.is_zero() {
            return Err(anyhow!("health interval must be greater than zero"));
        }
        Ok(())
    }

    /// Capture interval for one camera.
    pub fn interval_for(&self, camera: &CameraConfig) -> Duration {
        camera.interval.unwrap_or(self.capture.frame_interval)
    }

    /// Every configured camera needs at least one zone. Zones of cameras that
    /// are not configured are reported and ignored.
    pub fn check_zones(&self, zones: &ZoneMap) -> Result<()> {
        for camera in &self.cameras {
            match zones.zones_for(&camera.id) {
                Some(list) if !list.is_empty() => {}
                _ => {
                    return Err(anyhow!(
                        "camera '{}' has no zones in {}",
                        camera.id,
                        self.zones_path.display()
                    ))
                }
            }
        }
        for id in zones.camera_ids() {
            if !self.cameras.iter().any(|camera| camera.id == id) {
                log::warn!("zones for unconfigured camera '{}' are ignored", id);
            }
        }
        Ok(())
    }
}

/// Cameras for a plain list of sources. Ids come from the source; a repeated
/// id gets the 1-based position of its source appended.
pub fn cameras_from_sources(sources: &[String]) -> Result<Vec<CameraConfig>> {
    let mut seen = HashSet::new();
    let mut cameras = Vec::with_capacity(sources.len());
    for (idx, raw) in sources.iter().enumerate() {
        let source = SourceLocator::parse(raw)?;
        let mut id = source.default_camera_id();
        if seen.contains(&id) {
            id = format!("{}_{}", id, idx + 1);
        }
        seen.insert(id.clone());
        cameras.push(CameraConfig {
            id,
            source,
            interval: None,
        });
    }
    Ok(cameras)
}

fn secs_to_duration(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("invalid interval {} seconds", secs))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
