//! Dartboard capture kernel
//!
//! Turns a continuous camera feed into a sparse, calibrated stream of
//! "dart landed" events while serving the latest frame to live viewers.
//!
//! # Architecture
//!
//! - `capture`: `CaptureController`, the single-session worker lifecycle and
//!   status state machine
//! - `calibration`: four-corner perspective mapping from camera pixels to
//!   normalized board space
//! - `detect`: stateful frame-differencing impact detector
//! - `frame`: RGB frames, JPEG encoding and the single-slot live-view cache
//! - `ingest`: frame sources (synthetic, V4L2)
//! - `storage`: SQLite users/sessions/throws and the `HitSink` seam
//! - `checkout` / `heatmap`: finishing advice and throw heatmaps served by
//!   the API
//! - `config` / `api`: daemon configuration and the local HTTP API
//!
//! The controller composes the other pieces and is owned explicitly: the
//! daemon builds one instance and shares it through an `Arc`.

use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};

pub mod api;
pub mod calibration;
pub mod capture;
pub mod checkout;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod heatmap;
pub mod ingest;
pub mod storage;

pub use calibration::{BoardCalibrator, CalibrationStatus};
pub use capture::{CaptureController, CaptureMode, CaptureSettings, CaptureStatus};
pub use detect::{DetectorConfig, HitPoint, Impact, MotionImpactDetector};
pub use error::CaptureError;
pub use frame::{CachedFrame, Frame, FrameBuffer};
pub use ingest::{FrameSource, FrameSourceFactory, SourceError, SourceKind};
pub use storage::{HitSink, InMemoryHitSink, SqliteThrowStore};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every guarded value in this crate is replaced wholesale or updated in a
/// single step, so a poisoned lock never exposes a half-written state.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wall-clock time in epoch milliseconds.
pub fn now_ms() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| anyhow!("system time before unix epoch"))?;
    i64::try_from(elapsed.as_millis()).map_err(|_| anyhow!("system time out of range"))
}
