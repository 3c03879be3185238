use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use occupancy_pipeline::config::{ConfigOverrides, PipelineConfig, ENV_KEYS};
use occupancy_pipeline::{SourceLocator, ZoneMap};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

fn write_temp(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write temp file");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        r#"{
            "zones_path": "site/roi.json",
            "output_dir": "/var/lib/occupancy/frames",
            "cameras": [
                {"id": "north", "source": "stub://north?people=2"},
                {"source": "videos/south.mp4", "interval_secs": 2.5}
            ],
            "capture": {"frame_interval_secs": 5, "queue_capacity": 4},
            "detector": {"backend": "stub", "confidence_threshold": 0.4, "workers": 2},
            "publish": {
                "url": "mqtt://broker.local:1883",
                "topic": "site/occupancy",
                "backoff_base_ms": 500,
                "backoff_max_ms": 4000
            },
            "shutdown_grace_ms": 2000
        }"#,
    );

    std::env::set_var("OCCUPANCY_CONFIG", file.path());
    std::env::set_var("OCCUPANCY_QUEUE_CAPACITY", "6");
    std::env::set_var("OCCUPANCY_PUBLISH_URL", "tcp://10.0.0.5:9000");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.zones_path, PathBuf::from("site/roi.json"));
    assert_eq!(
        cfg.output_dir,
        Some(PathBuf::from("/var/lib/occupancy/frames"))
    );
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].id, "north");
    assert_eq!(cfg.cameras[1].id, "south");
    assert_eq!(
        cfg.cameras[1].source,
        SourceLocator::File(PathBuf::from("videos/south.mp4"))
    );
    assert_eq!(cfg.interval_for(&cfg.cameras[0]), Duration::from_secs(5));
    assert_eq!(cfg.interval_for(&cfg.cameras[1]), Duration::from_millis(2500));
    assert_eq!(cfg.capture.queue_capacity, 6);
    assert_eq!(cfg.detector.workers, 2);
    assert_eq!(cfg.detector.confidence_threshold, 0.4);
    assert_eq!(cfg.publish.url, "tcp://10.0.0.5:9000");
    assert_eq!(cfg.publish.topic, "site/occupancy");
    assert_eq!(cfg.publish.backoff_base, Duration::from_millis(500));
    assert_eq!(cfg.publish.backoff_max, Duration::from_secs(4));
    assert_eq!(cfg.shutdown_grace, Duration::from_secs(2));

    clear_env();
}

#[test]
fn video_sources_env_and_cli_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var(
        "OCCUPANCY_VIDEO_SOURCES",
        "a/lobby.mp4, b/lobby.mp4, 0",
    );
    std::env::set_var("OCCUPANCY_DETECTOR", "STUB");
    let cfg = PipelineConfig::load().expect("load config");
    let ids: Vec<_> = cfg.cameras.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["lobby", "lobby_2", "device0"]);
    assert_eq!(cfg.detector.backend, "stub");

    let overrides = ConfigOverrides {
        video_sources: vec!["stub://gate".to_string()],
        no_frames: true,
        workers: Some(3),
        ..ConfigOverrides::default()
    };
    let cfg = PipelineConfig::load_with(None, &overrides).expect("load config");
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.cameras[0].id, "gate");
    assert_eq!(cfg.output_dir, None);
    assert_eq!(cfg.detector.workers, 3);

    clear_env();
}

#[test]
fn invalid_env_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("OCCUPANCY_VIDEO_SOURCES", "stub://a");
    std::env::set_var("OCCUPANCY_FRAME_INTERVAL_SECS", "soon");
    let err = PipelineConfig::load().unwrap_err();
    assert!(err.to_string().contains("OCCUPANCY_FRAME_INTERVAL_SECS"));

    std::env::set_var("OCCUPANCY_FRAME_INTERVAL_SECS", "0");
    assert!(PipelineConfig::load().is_err());

    std::env::remove_var("OCCUPANCY_FRAME_INTERVAL_SECS");
    std::env::set_var("OCCUPANCY_QUEUE_CAPACITY", "0");
    assert!(PipelineConfig::load().is_err());

    clear_env();
}

#[test]
fn missing_cameras_is_a_config_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = PipelineConfig::load().unwrap_err();
    assert!(err.to_string().contains("no cameras configured"));

    let file = write_temp(r#"{"cameras": [{"source": "stub://a"}], "colour": "red"}"#);
    let err = PipelineConfig::load_with(Some(file.path()), &ConfigOverrides::default())
        .unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}

#[test]
fn zone_file_is_loaded_and_checked_against_cameras() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let zones_file = write_temp(
        r#"{
            "north": {"boxes": [
                {"tl": [10, 10], "tr": [110, 10], "bl": [10, 60], "br": [110, 60], "capacity": 4, "name": "Bay A"},
                {"tl": [10, 80], "tr": [110, 80], "bl": [10, 140], "br": [110, 140], "capacity": 2}
            ]},
            "unused": {"boxes": [
                {"tl": [0, 0], "tr": [5, 0], "bl": [0, 5], "br": [5, 5], "capacity": 1}
            ]}
        }"#,
    );
    std::env::set_var("OCCUPANCY_VIDEO_SOURCES", "stub://north");
    std::env::set_var("OCCUPANCY_ZONES_PATH", zones_file.path());

    let cfg = PipelineConfig::load().expect("load config");
    let zones = ZoneMap::load(&cfg.zones_path).expect("load zones");
    let north = zones.zones_for("north").expect("north zones");
    assert_eq!(north.len(), 2);
    assert_eq!(north[0].label(), "Bay A");
    assert_eq!(north[1].label(), "ROI-2");
    cfg.check_zones(&zones).expect("zones cover cameras");

    std::env::set_var("OCCUPANCY_VIDEO_SOURCES", "stub://north,stub://south");
    let cfg = PipelineConfig::load().expect("load config");
    let err = cfg.check_zones(&zones).unwrap_err();
    assert!(err.to_string().contains("south"));

    clear_env();
}

#[test]
fn malformed_zone_file_is_rejected() {
    let missing_corner = write_temp(
        r#"{"cam": {"boxes": [{"tl": [0, 0], "tr": [5, 0], "bl": [0, 5], "capacity": 1}]}}"#,
    );
    assert!(ZoneMap::load(missing_corner.path()).is_err());

    let zero_capacity = write_temp(
        r#"{"cam": {"boxes": [{"tl": [0, 0], "tr": [5, 0], "bl": [0, 5], "br": [5, 5], "capacity": 0}]}}"#,
    );
    assert!(ZoneMap::load(zero_capacity.path()).is_err());
}
