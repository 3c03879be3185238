//! occupancyd - multi-camera zone occupancy daemon
//!
//! This daemon:
//! 1. Loads the pipeline configuration and the per-camera zone map
//! 2. Prepares the person detector
//! 3. Samples every camera, evaluates zone occupancy per frame
//! 4. Logs a summary line per frame, writes annotated frames, and streams
//!    results to the configured consumer
//! 5. Shuts down gracefully on SIGINT/SIGTERM

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use occupancy_pipeline::{
    build_registry, build_transport,
    ui::{Ui, UiMode},
    ConfigOverrides, Pipeline, PipelineConfig, Shutdown, ZoneMap,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera zone occupancy daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "OCCUPANCY_CONFIG")]
    config: Option<PathBuf>,

    /// Zone map file.
    #[arg(long)]
    zones: Option<PathBuf>,

    /// Video source; repeat for several cameras. Replaces configured cameras.
    #[arg(long = "source", value_name = "SOURCE")]
    sources: Vec<String>,

    /// Seconds between frames of one camera.
    #[arg(long)]
    interval: Option<f64>,

    /// Directory for annotated frames.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Do not write annotated frames.
    #[arg(long)]
    no_frames: bool,

    /// Detector backend (stub, tract).
    #[arg(long)]
    detector: Option<String>,

    /// Model file for model-based detectors.
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Number of evaluation workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Where results go: tcp://host:port, mqtt://host:port or mqtts://host:port.
    #[arg(long)]
    publish_url: Option<String>,

    /// Startup output style.
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            zones_path: self.zones.clone(),
            output_dir: self.output_dir.clone(),
            no_frames: self.no_frames,
            video_sources: self.sources.clone(),
            frame_interval_secs: self.interval,
            detector: self.detector.clone(),
            model_path: self.model_path.clone(),
            workers: self.workers,
            publish_url: self.publish_url.clone(),
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let is_tty = std::io::stderr().is_terminal();
    let verbose_logs = log::log_enabled!(log::Level::Info);
    let ui = Ui::new(UiMode::parse(Some(&args.ui)), is_tty, verbose_logs);

    let stage = ui.stage("Load configuration");
    let config = PipelineConfig::load_with(args.config.as_deref(), &args.overrides())?;
    let zones = ZoneMap::load(&config.zones_path)?;
    stage.done(&format!(
        "{} camera(s), {} zone map entries",
        config.cameras.len(),
        zones.len()
    ));

    let stage = ui.stage("Prepare detector");
    let registry = build_registry(&config.detector.backend, config.detector.model_path.as_deref())?;
    registry
        .warm_up()
        .with_context(|| format!("detector '{}' failed to warm up", config.detector.backend))?;
    stage.done(&config.detector.backend);

    let stage = ui.stage("Start pipeline");
    let transport = build_transport(&config)?;
    let target = transport.describe();
    let pipeline = Pipeline::start(&config, zones, Arc::new(registry), transport)?;
    stage.done(&format!("publishing to {}", target));

    let stop = Shutdown::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received");
            stop.trigger();
        })
        .context("error setting signal handler")?;
    }

    log::info!("occupancyd running. press Ctrl-C to stop");
    pipeline.run_until(&stop);

    let stats = pipeline.shutdown(config.shutdown_grace)?;
    for camera in &stats.cameras {
        log::info!(
            "camera {}: {} captured, {} dropped, {} capture errors",
            camera.camera_id,
            camera.captured,
            camera.dropped,
            camera.capture_errors
        );
    }
    log::info!(
        "frames evaluated {}, skipped {}, written {}; payloads sent {}, dropped {}, evicted {}",
        stats.evaluator.evaluated,
        stats.evaluator.skipped,
        stats.sink.written,
        stats.publisher.sent,
        stats.publisher.dropped,
        stats.publisher.evicted
    );
    Ok(())
}
