use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use dartboard_capture::config::DartboardConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "DARTBOARD_CONFIG",
        "DARTBOARD_DB_PATH",
        "DARTBOARD_API_ADDR",
        "DARTBOARD_CALIBRATION_PATH",
        "DARTBOARD_FRAME_SOURCE",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = DartboardConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "dartboard.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:8800");
    assert_eq!(cfg.calibration.path.to_str(), Some("calibration.json"));
    assert_eq!(cfg.calibration.target_size, 800);
    assert_eq!(cfg.capture.width, 640);
    assert_eq!(cfg.capture.height, 480);
    assert_eq!(cfg.stop_timeout, Duration::from_secs(2));
    assert_eq!(cfg.jpeg_quality, 80);
    assert_eq!(cfg.detector.min_motion_area, 1200);
    assert_eq!(cfg.detector.cooldown, Duration::from_millis(350));
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "darts_prod.db",
        "api": { "addr": "127.0.0.1:9100" },
        "calibration": { "path": "/tmp/board.json", "target_size": 600 },
        "capture": {
            "source": "stub",
            "width": 800,
            "height": 600,
            "stop_timeout_ms": 500,
            "jpeg_quality": 70
        },
        "detector": { "min_motion_area": 900, "cooldown_ms": 500 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("DARTBOARD_CONFIG", file.path());
    std::env::set_var("DARTBOARD_API_ADDR", "127.0.0.1:9200");
    std::env::set_var("DARTBOARD_DB_PATH", "override.db");

    let cfg = DartboardConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "override.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:9200");
    assert_eq!(cfg.calibration.path.to_str(), Some("/tmp/board.json"));
    assert_eq!(cfg.calibration.target_size, 600);
    assert_eq!(cfg.capture.source, "stub");
    assert_eq!(cfg.capture.width, 800);
    assert_eq!(cfg.stop_timeout, Duration::from_millis(500));
    assert_eq!(cfg.jpeg_quality, 70);
    assert_eq!(cfg.detector.min_motion_area, 900);
    assert_eq!(cfg.detector.cooldown, Duration::from_millis(500));
    assert_eq!(cfg.detector.diff_threshold, 28);

    let settings = cfg.capture_settings();
    assert_eq!(settings.stop_timeout, Duration::from_millis(500));
    assert_eq!(settings.jpeg_quality, 70);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
db_path = "darts.db"

[capture]
source = "synthetic"
jpeg_quality = 95

[detector]
diff_threshold = 40
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = DartboardConfig::load_from(file.path()).expect("load config");
    assert_eq!(cfg.db_path, "darts.db");
    assert_eq!(cfg.capture.source, "stub");
    assert_eq!(cfg.jpeg_quality, 95);
    assert_eq!(cfg.detector.diff_threshold, 40);
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for json in [
        r#"{ "calibration": { "target_size": 1 } }"#,
        r#"{ "capture": { "jpeg_quality": 0 } }"#,
        r#"{ "capture": { "stop_timeout_ms": 0 } }"#,
        r#"{ "capture": { "source": "rtsp" } }"#,
    ] {
        let mut file = NamedTempFile::new().expect("temp config");
        file.write_all(json.as_bytes()).expect("write config");
        assert!(
            DartboardConfig::load_from(file.path()).is_err(),
            "accepted {}",
            json
        );
    }

    std::env::set_var("DARTBOARD_FRAME_SOURCE", "nope");
    assert!(DartboardConfig::load().is_err());
    clear_env();
}
