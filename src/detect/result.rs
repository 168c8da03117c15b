use serde::{Deserialize, Serialize};

/// A detected dart landing in normalized board space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HitPoint {
    /// 0..=1, left to right.
    pub x_norm: f64,
    /// 0..=1, top to bottom.
    pub y_norm: f64,
    /// 0..=1 heuristic; larger motion blobs score higher.
    pub confidence: f64,
}

impl HitPoint {
    /// Build a hit with every component clamped into [0, 1].
    pub fn clamped(x_norm: f64, y_norm: f64, confidence: f64) -> Self {
        Self {
            x_norm: clamp_unit(x_norm),
            y_norm: clamp_unit(y_norm),
            confidence: clamp_unit(confidence),
        }
    }
}

/// Detector output: the hit plus the motion centroid in frame pixels, so the
/// caller can remap it through a board calibration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Impact {
    pub hit: HitPoint,
    pub centroid_px: (f64, f64),
    pub area_px: usize,
}

pub(crate) fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
