//! Durable calibration state.
//!
//! The calibrator reads its state once at startup and writes it back on every
//! mutation. The on-disk format is a small JSON document:
//!
//! ```json
//! { "src_points": [[x, y], [x, y], [x, y], [x, y]] }
//! ```
//!
//! with `null` meaning "uncalibrated".

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::lock_unpoisoned;

/// Board corners in pixel coordinates, ordered TL, TR, BR, BL.
pub type SourcePoints = [[f64; 2]; 4];

pub trait CalibrationStore: Send + Sync {
    /// Persisted points, unvalidated. `None` when nothing has been saved.
    fn load(&self) -> Result<Option<Vec<[f64; 2]>>>;

    /// Replace the persisted points (`None` clears).
    fn save(&self, points: Option<&SourcePoints>) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationFile {
    src_points: Option<Vec<[f64; 2]>>,
}

/// JSON file store.
pub struct JsonFileCalibrationStore {
    path: PathBuf,
}

impl JsonFileCalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CalibrationStore for JsonFileCalibrationStore {
    fn load(&self) -> Result<Option<Vec<[f64; 2]>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            anyhow!(
                "failed to read calibration file {}: {}",
                self.path.display(),
                e
            )
        })?;
        let file: CalibrationFile = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid calibration file {}: {}", self.path.display(), e))?;
        Ok(file.src_points)
    }

    fn save(&self, points: Option<&SourcePoints>) -> Result<()> {
        let file = CalibrationFile {
            src_points: points.map(|p| p.to_vec()),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, json).map_err(|e| {
            anyhow!(
                "failed to write calibration file {}: {}",
                self.path.display(),
                e
            )
        })?;
        Ok(())
    }
}

/// Process-local store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryCalibrationStore {
    points: Mutex<Option<Vec<[f64; 2]>>>,
    saves: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_points(points: Vec<[f64; 2]>) -> Self {
        Self {
            points: Mutex::new(Some(points)),
            ..Self::default()
        }
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl CalibrationStore for InMemoryCalibrationStore {
    fn load(&self) -> Result<Option<Vec<[f64; 2]>>> {
        Ok(lock_unpoisoned(&self.points).clone())
    }

    fn save(&self, points: Option<&SourcePoints>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("calibration store is read-only"));
        }
        *lock_unpoisoned(&self.points) = points.map(|p| p.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_as_uncalibrated() -> Result<()> {
        let dir = tempdir()?;
        let store = JsonFileCalibrationStore::new(dir.path().join("calibration.json"));
        assert!(store.load()?.is_none());
        Ok(())
    }

    #[test]
    fn file_store_persists_points_and_clears() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("calibration.json");
        let store = JsonFileCalibrationStore::new(&path);

        let points = [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]];
        store.save(Some(&points))?;
        assert_eq!(store.load()?, Some(points.to_vec()));

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["src_points"][2][1], 6.0);

        store.save(None)?;
        assert!(store.load()?.is_none());
        Ok(())
    }

    #[test]
    fn corrupt_file_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("calibration.json");
        std::fs::write(&path, "{not json")?;
        assert!(JsonFileCalibrationStore::new(&path).load().is_err());
        Ok(())
    }
}
