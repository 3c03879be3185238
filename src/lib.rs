//! Multi-camera occupancy pipeline.
//!
//! Cameras are sampled at a fixed interval. Each frame is cut down to the
//! camera's configured zones, the crops are stacked into one composite image,
//! and a person detector runs once per composite. Detections are attributed
//! back to zones by vertical position, giving per-zone counts, occupancy and
//! free slots. Results are logged, optionally written as annotated JPEGs, and
//! streamed to a downstream consumer over a reconnecting link.
//!
//! # Module Structure
//!
//! - `config`: pipeline configuration (file, environment, command line)
//! - `zones`: zone definitions and the per-camera zone map
//! - `frame`: frames and the bounded, per-camera-fair frame queue
//! - `ingest`: capture backends and the camera worker loop
//! - `roi`: zone cropping and composite stacking
//! - `detect`: detector backends and registry
//! - `occupancy`: detection attribution and per-zone occupancy
//! - `sink`: log line, annotated frames, payload hand-off
//! - `publish`: reconnecting publisher and its transports
//! - `pipeline`: supervisor and shutdown signal

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod occupancy;
pub mod pipeline;
pub mod publish;
pub mod roi;
pub mod sink;
pub mod ui;
pub mod zones;

pub use config::{CameraConfig, ConfigOverrides, PipelineConfig};
pub use detect::{build_registry, BackendRegistry, Detection, DetectorBackend, ObjectClass};
pub use frame::{EnqueueOutcome, Frame, FrameLease, FrameQueue, QueueStats};
pub use ingest::{CameraSource, CaptureError, SourceLocator};
pub use occupancy::{Evaluation, OccupancyEvaluator, Summary, ZoneOccupancy};
pub use pipeline::{build_transport, Pipeline, PipelineStats, Shutdown};
pub use publish::{ConnectionState, OutgoingPayload, Publisher, PublisherSettings, Transport};
pub use roi::{aggregate, CompositeImage, Segment};
pub use sink::ResultSink;
pub use zones::{ZoneDefinition, ZoneMap};
