use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use traffic_sentinel::config::{BackendKind, ExecutionModel, Mode, Overrides, RunConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "TRAFFIC_CONFIG",
        "TRAFFIC_MODE",
        "TRAFFIC_EXECUTION",
        "ENVIRONMENT",
        "TRAFFIC_SITE_NAME",
        "TRAFFIC_FIXTURE_DIR",
        "TRAFFIC_LIVE_URL",
        "TRAFFIC_MODEL_WEIGHTS",
        "TRAFFIC_DETECTOR_BACKEND",
        "TRAFFIC_CAPTURE_INTERVAL_SECS",
        "TRAFFIC_REPORT_THROTTLE_SECS",
        "TRAFFIC_DENSITY_THRESHOLD",
        "MQTT_BROKER_ADDR",
        "MQTT_USERNAME",
        "MQTT_PASSWORD",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "mode": "live",
            "site_name": "Rua Oratorio",
            "report_throttle_secs": 120,
            "density_threshold": 0.05,
            "live": {
                "url": "http://camera.local/snapshot.jpg",
                "camera_id": 42,
                "open_attempts": 5,
                "preview": false
            },
            "model": { "backend": "stub" },
            "notify": {
                "channel": "oratorio-alerts",
                "mqtt": { "broker_addr": "mqtt://broker.local:1883", "topic_prefix": "city" }
            }
        }"#,
    );
    std::env::set_var("TRAFFIC_CONFIG", file.path());
    std::env::set_var("TRAFFIC_DENSITY_THRESHOLD", "0.03");
    std::env::set_var("MQTT_USERNAME", "sentinel");

    let cfg = RunConfig::load(Overrides::default()).expect("load config");
    assert_eq!(cfg.mode, Mode::Live);
    assert_eq!(cfg.execution, ExecutionModel::Interactive);
    assert_eq!(cfg.site_name, "Rua Oratorio");
    assert_eq!(cfg.capture_interval, Duration::from_secs(36));
    assert_eq!(cfg.report_throttle, Duration::from_secs(120));
    assert!((cfg.density_threshold - 0.03).abs() < f64::EPSILON);
    assert_eq!(cfg.live.url, "http://camera.local/snapshot.jpg");
    assert_eq!(cfg.live.camera_id, 42);
    assert_eq!(cfg.live.open_attempts, 5);
    assert!(!cfg.live.preview);
    assert_eq!(cfg.model.backend, BackendKind::Stub);
    assert_eq!(cfg.notify.channel, "oratorio-alerts");
    let mqtt = cfg.notify.mqtt.expect("mqtt settings");
    assert_eq!(mqtt.broker_addr, "mqtt://broker.local:1883");
    assert_eq!(mqtt.topic_prefix, "city");
    assert_eq!(mqtt.username.as_deref(), Some("sentinel"));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
mode = "demo"
execution = "single-shot"
fixture_dir = "samples"
capture_interval_secs = 3

[scratch]
single_shot_root = "/var/tmp/traffic"
"#,
    );
    std::env::set_var("TRAFFIC_CONFIG", file.path());

    let cfg = RunConfig::load(Overrides::default()).expect("load config");
    assert_eq!(cfg.mode, Mode::Demo);
    assert_eq!(cfg.execution, ExecutionModel::SingleShot);
    assert_eq!(cfg.fixture_dir, Path::new("samples"));
    assert_eq!(cfg.capture_interval, Duration::from_secs(3));
    assert_eq!(cfg.scratch_root(), Path::new("/var/tmp/traffic"));
    assert_eq!(
        cfg.audit_log_path(),
        Path::new("/var/tmp/traffic/traffic_notifications.log")
    );

    clear_env();
}

#[test]
fn command_line_overrides_win() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("TRAFFIC_MODE", "live");
    std::env::set_var("ENVIRONMENT", "lambda");

    let cfg = RunConfig::load(Overrides::default()).expect("env selection");
    assert_eq!(cfg.mode, Mode::Live);
    assert_eq!(cfg.execution, ExecutionModel::SingleShot);

    let cfg = RunConfig::load(Overrides {
        mode: Some(Mode::Demo),
        execution: Some(ExecutionModel::Interactive),
    })
    .expect("override selection");
    assert_eq!(cfg.mode, Mode::Demo);
    assert_eq!(cfg.execution, ExecutionModel::Interactive);

    clear_env();
}

#[test]
fn local_environment_selects_interactive() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ENVIRONMENT", "local");
    let cfg = RunConfig::load(Overrides {
        mode: Some(Mode::Demo),
        execution: None,
    })
    .expect("load config");
    assert_eq!(cfg.execution, ExecutionModel::Interactive);
    assert_eq!(cfg.scratch_root(), Path::new("resources/images"));

    clear_env();
}

#[test]
fn missing_or_invalid_mode_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = RunConfig::load(Overrides::default()).unwrap_err();
    assert!(format!("{err}").contains("no mode selected"));
    assert_eq!(RunConfig::configured_mode().unwrap(), None);

    std::env::set_var("TRAFFIC_MODE", "replay");
    assert!(RunConfig::load(Overrides::default()).is_err());
    assert!(RunConfig::configured_mode().is_err());

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let demo = Overrides {
        mode: Some(Mode::Demo),
        execution: None,
    };

    std::env::set_var("TRAFFIC_DENSITY_THRESHOLD", "-1");
    assert!(RunConfig::load(demo).is_err());
    std::env::set_var("TRAFFIC_DENSITY_THRESHOLD", "heavy");
    assert!(RunConfig::load(demo).is_err());
    std::env::remove_var("TRAFFIC_DENSITY_THRESHOLD");

    std::env::set_var("TRAFFIC_CAPTURE_INTERVAL_SECS", "5.5");
    assert!(RunConfig::load(demo).is_err());
    std::env::remove_var("TRAFFIC_CAPTURE_INTERVAL_SECS");

    std::env::set_var("TRAFFIC_CAPTURE_INTERVAL_SECS", "0");
    let err = RunConfig::load(demo).unwrap_err();
    assert!(format!("{err}").contains("capture interval"));
    std::env::remove_var("TRAFFIC_CAPTURE_INTERVAL_SECS");

    std::env::set_var("TRAFFIC_REPORT_THROTTLE_SECS", "0");
    assert!(RunConfig::load(demo).is_err());
    std::env::remove_var("TRAFFIC_REPORT_THROTTLE_SECS");

    std::env::set_var("TRAFFIC_CAPTURE_INTERVAL_SECS", "2");
    let err = RunConfig::load(demo).unwrap_err();
    assert!(format!("{err}").contains("shorter than the capture interval"));
    std::env::remove_var("TRAFFIC_CAPTURE_INTERVAL_SECS");

    std::env::set_var("TRAFFIC_DETECTOR_BACKEND", "opencv");
    assert!(RunConfig::load(demo).is_err());
    std::env::remove_var("TRAFFIC_DETECTOR_BACKEND");

    let file = write_config(".json", r#"{ "notify": { "channel": "traffic alerts" } }"#);
    std::env::set_var("TRAFFIC_CONFIG", file.path());
    assert!(RunConfig::load(demo).is_err());

    clear_env();
}
