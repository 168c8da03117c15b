use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calibration::DEFAULT_TARGET_SIZE;
use crate::capture::{CaptureSettings, DEFAULT_STOP_TIMEOUT};
use crate::detect::{DetectorConfig, DetectorConfigFile};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::ingest::SourceKind;

const DEFAULT_DB_PATH: &str = "dartboard.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_CALIBRATION_PATH: &str = "calibration.json";
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;

#[derive(Debug, Deserialize, Default)]
struct DartboardConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    calibration: Option<CalibrationConfigFile>,
    capture: Option<CaptureConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationConfigFile {
    path: Option<PathBuf>,
    target_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    stop_timeout_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct DartboardConfig {
    pub db_path: String,
    pub api_addr: String,
    pub calibration: CalibrationSettings,
    pub capture: CaptureSourceSettings,
    pub stop_timeout: Duration,
    pub jpeg_quality: u8,
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    pub path: PathBuf,
    pub target_size: u32,
}

#[derive(Debug, Clone)]
pub struct CaptureSourceSettings {
    pub source: String,
    pub width: u32,
    pub height: u32,
}

impl DartboardConfig {
    /// Defaults, then `DARTBOARD_CONFIG` (JSON, or TOML for `.toml` paths),
    /// then `DARTBOARD_*` environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DARTBOARD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file, still honoring environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DartboardConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let calibration_file = file.calibration.unwrap_or_default();
        let calibration = CalibrationSettings {
            path: calibration_file
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CALIBRATION_PATH)),
            target_size: calibration_file.target_size.unwrap_or(DEFAULT_TARGET_SIZE),
        };
        let capture_file = file.capture.unwrap_or_default();
        let capture = CaptureSourceSettings {
            source: capture_file
                .source
                .unwrap_or_else(|| SourceKind::default_for_build().as_str().to_string()),
            width: capture_file.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
            height: capture_file.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
        };
        let stop_timeout = capture_file
            .stop_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STOP_TIMEOUT);
        let jpeg_quality = capture_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY);
        let detector = file.detector.unwrap_or_default().resolve();
        Self {
            db_path,
            api_addr,
            calibration,
            capture,
            stop_timeout,
            jpeg_quality,
            detector,
        }
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("DARTBOARD_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("DARTBOARD_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("DARTBOARD_CALIBRATION_PATH") {
            if !path.trim().is_empty() {
                self.calibration.path = PathBuf::from(path);
            }
        }
        if let Ok(source) = std::env::var("DARTBOARD_FRAME_SOURCE") {
            if !source.trim().is_empty() {
                self.capture.source = source;
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        let kind = SourceKind::parse(&self.capture.source)?;
        self.capture.source = kind.as_str().to_string();

        if self.calibration.target_size < 2 {
            return Err(anyhow!("calibration.target_size must be at least 2"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("capture.jpeg_quality must be between 1 and 100"));
        }
        if self.stop_timeout.is_zero() {
            return Err(anyhow!("capture.stop_timeout_ms must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture.width and capture.height must be non-zero"));
        }
        Ok(())
    }

    pub fn source_kind(&self) -> Result<SourceKind> {
        SourceKind::parse(&self.capture.source)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            stop_timeout: self.stop_timeout,
            jpeg_quality: self.jpeg_quality,
            detector: self.detector.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<DartboardConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
