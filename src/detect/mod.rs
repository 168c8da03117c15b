//! Motion-based impact detection.
//!
//! `MotionImpactDetector` differences each frame against the previous one and
//! reports the largest motion blob as a dart landing, debounced by a cooldown.
//! It is a crude heuristic, not dart-tip localization: anything that moves
//! enough (a hand, a dart being pulled) also registers.
//!
//! One detector instance belongs to one capture session. It keeps the previous
//! frame and the last accepted hit time, and MUST NOT be shared between
//! sessions.

pub mod imgproc;
mod result;

use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use imgproc::GrayImage;

pub use result::{HitPoint, Impact};

pub const DEFAULT_MIN_MOTION_AREA: usize = 1200;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(350);
pub const DEFAULT_DIFF_THRESHOLD: u8 = 28;
pub const DEFAULT_BLUR_KERNEL: usize = 9;
pub const DEFAULT_DILATE_ITERATIONS: usize = 2;
/// Fraction of the frame area at which confidence saturates to 1.
pub const DEFAULT_CONFIDENCE_AREA_FRACTION: f64 = 0.02;

/// Tuning knobs for the motion detector.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    /// Minimum blob size, counted in pixels of the dilated motion mask. This
    /// runs slightly above a traced-contour polygon area for the same blob.
    pub min_motion_area: usize,
    pub cooldown: Duration,
    pub diff_threshold: u8,
    pub blur_kernel: usize,
    pub dilate_iterations: usize,
    pub confidence_area_fraction: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_motion_area: DEFAULT_MIN_MOTION_AREA,
            cooldown: DEFAULT_COOLDOWN,
            diff_threshold: DEFAULT_DIFF_THRESHOLD,
            blur_kernel: DEFAULT_BLUR_KERNEL,
            dilate_iterations: DEFAULT_DILATE_ITERATIONS,
            confidence_area_fraction: DEFAULT_CONFIDENCE_AREA_FRACTION,
        }
    }
}

/// Partial detector settings as they appear in a config file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DetectorConfigFile {
    pub min_motion_area: Option<usize>,
    pub cooldown_ms: Option<u64>,
    pub diff_threshold: Option<u8>,
    pub blur_kernel: Option<usize>,
    pub dilate_iterations: Option<usize>,
    pub confidence_area_fraction: Option<f64>,
}

impl DetectorConfigFile {
    pub fn resolve(self) -> DetectorConfig {
        let d = DetectorConfig::default();
        DetectorConfig {
            min_motion_area: self.min_motion_area.unwrap_or(d.min_motion_area),
            cooldown: self
                .cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(d.cooldown),
            diff_threshold: self.diff_threshold.unwrap_or(d.diff_threshold),
            blur_kernel: self.blur_kernel.unwrap_or(d.blur_kernel),
            dilate_iterations: self.dilate_iterations.unwrap_or(d.dilate_iterations),
            confidence_area_fraction: self
                .confidence_area_fraction
                .unwrap_or(d.confidence_area_fraction),
        }
    }
}

/// Stateful frame-differencing detector.
pub struct MotionImpactDetector {
    config: DetectorConfig,
    previous: Option<GrayImage>,
    last_hit_at: Option<Instant>,
}

impl MotionImpactDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            previous: None,
            last_hit_at: None,
        }
    }

    /// Feed one frame, using the current time for the cooldown.
    pub fn detect(&mut self, frame: &Frame) -> Option<Impact> {
        self.detect_at(frame, Instant::now())
    }

    /// Feed one frame observed at `now`.
    ///
    /// A blob's area is the number of set pixels in its 8-connected region of
    /// the dilated mask, both for the `min_motion_area` cut and for confidence.
    pub fn detect_at(&mut self, frame: &Frame, now: Instant) -> Option<Impact> {
        let gray = imgproc::gaussian_blur(&imgproc::to_luma(frame), self.config.blur_kernel);

        let previous = match self.previous.take() {
            Some(prev) if prev.same_dims(&gray) => prev,
            _ => {
                self.previous = Some(gray);
                return None;
            }
        };

        let mask = imgproc::diff_mask(&previous, &gray, self.config.diff_threshold);
        let mask = imgproc::dilate(&mask, self.config.dilate_iterations);
        let (w, h) = (gray.width, gray.height);
        self.previous = Some(gray);

        let region = imgproc::largest_region(&mask)?;
        if region.area < self.config.min_motion_area {
            return None;
        }

        if let Some(last) = self.last_hit_at {
            if now.saturating_duration_since(last) < self.config.cooldown {
                return None;
            }
        }

        let (cx, cy) = region.centroid;
        let x_norm = cx / (w.saturating_sub(1).max(1)) as f64;
        let y_norm = cy / (h.saturating_sub(1).max(1)) as f64;
        let saturation = ((w * h) as f64 * self.config.confidence_area_fraction).max(1.0);
        let confidence = (region.area as f64 / saturation).min(1.0);

        self.last_hit_at = Some(now);
        Some(Impact {
            hit: HitPoint::clamped(x_norm, y_norm, confidence),
            centroid_px: region.centroid,
            area_px: region.area,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
