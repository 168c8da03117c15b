//! Board calibration: camera pixels to normalized board space.
//!
//! The operator marks the four visible board corners (TL, TR, BR, BL). The
//! calibrator maps that quadrilateral onto a canonical `target_size` square
//! and uses the mapping to turn detection centroids into `[0, 1]` board
//! coordinates. The points and the derived homography always change together
//! under one lock, and every change is persisted before it becomes visible.

mod homography;
pub mod store;

use nalgebra::Point2;
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::lock_unpoisoned;

pub use homography::{homography_from_4pt, warp_perspective_rgb, Homography};
pub use store::{CalibrationStore, InMemoryCalibrationStore, JsonFileCalibrationStore, SourcePoints};

pub const DEFAULT_TARGET_SIZE: u32 = 800;

/// Snapshot returned by `BoardCalibrator::status`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibrationStatus {
    pub calibrated: bool,
    pub target_size: u32,
    pub src_points: Option<Vec<[f64; 2]>>,
}

#[derive(Clone, Copy, Default)]
struct Calibration {
    src_points: Option<SourcePoints>,
    homography: Option<Homography>,
}

pub struct BoardCalibrator {
    target_size: u32,
    store: Arc<dyn CalibrationStore>,
    state: Mutex<Calibration>,
}

impl BoardCalibrator {
    /// Load persisted state once. Unreadable or invalid state starts uncalibrated.
    pub fn load(store: Arc<dyn CalibrationStore>, target_size: u32) -> Self {
        let calibrator = Self::uncalibrated(store, target_size);
        let loaded = match calibrator.store.load() {
            Ok(points) => points,
            Err(err) => {
                log::warn!("calibration: ignoring persisted state: {}", err);
                None
            }
        };
        if let Some(points) = loaded {
            match calibrator.compute(&points) {
                Ok(calibration) => {
                    *lock_unpoisoned(&calibrator.state) = calibration;
                    log::info!("calibration: loaded board corners {:?}", points);
                }
                Err(err) => log::warn!("calibration: ignoring persisted points: {}", err),
            }
        }
        calibrator
    }

    /// Calibrator with no calibration, without reading the store.
    pub fn uncalibrated(store: Arc<dyn CalibrationStore>, target_size: u32) -> Self {
        Self {
            target_size: target_size.max(2),
            store,
            state: Mutex::new(Calibration::default()),
        }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    fn scale(&self) -> f64 {
        (self.target_size - 1).max(1) as f64
    }

    fn compute(&self, points: &[[f64; 2]]) -> Result<Calibration, CaptureError> {
        let src: SourcePoints = points.try_into().map_err(|_| {
            CaptureError::InvalidCalibration(format!(
                "exactly 4 source points are required, got {}",
                points.len()
            ))
        })?;
        if src.iter().flatten().any(|v| !v.is_finite()) {
            return Err(CaptureError::InvalidCalibration(
                "source points must be finite".to_string(),
            ));
        }
        let s = self.scale();
        let dst = [
            Point2::new(0.0, 0.0),
            Point2::new(s, 0.0),
            Point2::new(s, s),
            Point2::new(0.0, s),
        ];
        let src_pts = src.map(|[x, y]| Point2::new(x, y));
        let homography = homography_from_4pt(&src_pts, &dst).ok_or_else(|| {
            CaptureError::InvalidCalibration(
                "source points do not form a valid quadrilateral".to_string(),
            )
        })?;
        Ok(Calibration {
            src_points: Some(src),
            homography: Some(homography),
        })
    }

    /// Replace the calibration. On any error the previous one stays active.
    pub fn set_source_points(&self, points: &[[f64; 2]]) -> Result<CalibrationStatus, CaptureError> {
        let calibration = self.compute(points)?;
        let mut state = lock_unpoisoned(&self.state);
        self.store.save(calibration.src_points.as_ref())?;
        *state = calibration;
        log::info!("calibration: board corners set to {:?}", points);
        Ok(self.status_of(&state))
    }

    /// Drop the calibration; transforms become unavailable.
    pub fn clear(&self) -> Result<CalibrationStatus, CaptureError> {
        let mut state = lock_unpoisoned(&self.state);
        self.store.save(None)?;
        *state = Calibration::default();
        log::info!("calibration: cleared");
        Ok(self.status_of(&state))
    }

    pub fn is_calibrated(&self) -> bool {
        lock_unpoisoned(&self.state).homography.is_some()
    }

    pub fn status(&self) -> CalibrationStatus {
        let state = lock_unpoisoned(&self.state);
        self.status_of(&state)
    }

    fn status_of(&self, state: &Calibration) -> CalibrationStatus {
        CalibrationStatus {
            calibrated: state.homography.is_some(),
            target_size: self.target_size,
            src_points: state.src_points.map(|p| p.to_vec()),
        }
    }

    /// Map a pixel to normalized board coordinates, clamped to `[0, 1]`.
    ///
    /// Points outside the board quadrilateral pile up on its edge. Returns
    /// `None` when uncalibrated.
    pub fn transform_point(&self, x_px: f64, y_px: f64) -> Option<(f64, f64)> {
        let homography = lock_unpoisoned(&self.state).homography?;
        let (x, y) = homography.apply(x_px, y_px)?;
        let s = self.scale();
        Some(((x / s).clamp(0.0, 1.0), (y / s).clamp(0.0, 1.0)))
    }

    /// Perspective-warp a frame into the canonical `target_size` square view.
    ///
    /// Used for the alignment preview only. Returns the input when uncalibrated.
    pub fn warp_frame(&self, frame: Frame) -> Frame {
        let Some(homography) = lock_unpoisoned(&self.state).homography else {
            return frame;
        };
        let Some(inverse) = homography.inverse() else {
            return frame;
        };
        warp_perspective_rgb(&frame, &inverse, self.target_size, self.target_size)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: [[f64; 2]; 4] = [[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]];

    fn calibrator(target_size: u32) -> (BoardCalibrator, Arc<InMemoryCalibrationStore>) {
        let store = Arc::new(InMemoryCalibrationStore::new());
        (BoardCalibrator::load(store.clone(), target_size), store)
    }

    fn assert_near(actual: (f64, f64), expected: (f64, f64)) {
        assert!(
            (actual.0 - expected.0).abs() < 1e-6 && (actual.1 - expected.1).abs() < 1e-6,
            "got {:?}, expected {:?}",
            actual,
            expected
        );
    }

    #[test]
    fn transform_requires_calibration() {
        let (cal, _) = calibrator(101);
        assert!(!cal.is_calibrated());
        assert_eq!(cal.transform_point(0.0, 0.0), None);
        assert_eq!(cal.transform_point(50.0, 50.0), None);
    }

    #[test]
    fn unit_square_maps_center_to_half() -> Result<(), CaptureError> {
        let (cal, _) = calibrator(101);
        cal.set_source_points(&SQUARE)?;
        assert_near(cal.transform_point(50.0, 50.0).expect("mapped"), (0.5, 0.5));
        assert_near(cal.transform_point(0.0, 100.0).expect("mapped"), (0.0, 1.0));
        Ok(())
    }

    #[test]
    fn perspective_quad_maps_corners_to_unit_square() -> Result<(), CaptureError> {
        let (cal, _) = calibrator(DEFAULT_TARGET_SIZE);
        let quad = [[120.0, 40.0], [520.0, 60.0], [560.0, 430.0], [90.0, 400.0]];
        cal.set_source_points(&quad)?;
        let expected = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        for (corner, want) in quad.iter().zip(expected) {
            assert_near(cal.transform_point(corner[0], corner[1]).expect("mapped"), want);
        }
        Ok(())
    }

    #[test]
    fn points_outside_the_board_are_clamped() -> Result<(), CaptureError> {
        let (cal, _) = calibrator(101);
        cal.set_source_points(&SQUARE)?;
        assert_near(cal.transform_point(-50.0, 250.0).expect("mapped"), (0.0, 1.0));
        Ok(())
    }

    #[test]
    fn wrong_point_count_keeps_prior_calibration() -> Result<(), CaptureError> {
        let (cal, store) = calibrator(101);
        cal.set_source_points(&SQUARE)?;

        let err = cal
            .set_source_points(&SQUARE[..3])
            .expect_err("three points rejected");
        assert!(matches!(err, CaptureError::InvalidCalibration(_)));
        let mut five = SQUARE.to_vec();
        five.push([1.0, 1.0]);
        assert!(cal.set_source_points(&five).is_err());

        assert_eq!(cal.status().src_points, Some(SQUARE.to_vec()));
        assert_eq!(store.save_count(), 1);
        Ok(())
    }

    #[test]
    fn degenerate_quad_is_invalid() {
        let (cal, _) = calibrator(101);
        let line = [[0.0, 0.0], [10.0, 0.0], [20.0, 0.0], [30.0, 0.0]];
        assert!(matches!(
            cal.set_source_points(&line),
            Err(CaptureError::InvalidCalibration(_))
        ));
        assert!(!cal.is_calibrated());
    }

    #[test]
    fn failed_persist_keeps_prior_calibration() -> Result<(), CaptureError> {
        let (cal, store) = calibrator(101);
        cal.set_source_points(&SQUARE)?;
        store.set_fail_writes(true);

        let shifted = [[10.0, 10.0], [90.0, 10.0], [90.0, 90.0], [10.0, 90.0]];
        assert!(matches!(
            cal.set_source_points(&shifted),
            Err(CaptureError::Persistence(_))
        ));
        assert!(cal.clear().is_err());
        assert_eq!(cal.status().src_points, Some(SQUARE.to_vec()));
        Ok(())
    }

    #[test]
    fn clear_reports_uncalibrated() -> Result<(), CaptureError> {
        let (cal, store) = calibrator(101);
        cal.set_source_points(&SQUARE)?;
        let status = cal.clear()?;
        assert!(!status.calibrated);
        assert_eq!(cal.status().src_points, None);
        assert!(!cal.status().calibrated);
        assert_eq!(cal.transform_point(50.0, 50.0), None);
        assert_eq!(store.load().map_err(CaptureError::from)?, None);
        Ok(())
    }

    #[test]
    fn persisted_points_are_loaded_once() {
        let store = Arc::new(InMemoryCalibrationStore::with_points(SQUARE.to_vec()));
        let cal = BoardCalibrator::load(store.clone(), 101);
        assert!(cal.is_calibrated());
        assert_eq!(cal.status().target_size, 101);
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn invalid_persisted_points_start_uncalibrated() {
        let store = Arc::new(InMemoryCalibrationStore::with_points(vec![[1.0, 1.0]]));
        let cal = BoardCalibrator::load(store, 101);
        assert!(!cal.is_calibrated());
    }

    #[test]
    fn warp_is_identity_when_uncalibrated() {
        let (cal, _) = calibrator(64);
        let frame = Frame::filled(10, 20, [1, 2, 3]);
        assert_eq!(cal.warp_frame(frame.clone()), frame);
    }

    #[test]
    fn warp_produces_canonical_square() -> Result<(), CaptureError> {
        let (cal, _) = calibrator(50);
        let mut frame = Frame::filled(120, 100, [0, 0, 0]);
        // Board region 20..80 x 10..70 is white.
        for y in 10..70 {
            for x in 20..80 {
                frame.set_pixel(x, y, [255, 255, 255]);
            }
        }
        cal.set_source_points(&[[20.0, 10.0], [79.0, 10.0], [79.0, 69.0], [20.0, 69.0]])?;
        let warped = cal.warp_frame(frame);
        assert_eq!((warped.width(), warped.height()), (50, 50));
        assert_eq!(warped.pixel(25, 25), [255, 255, 255]);
        assert_eq!(warped.pixel(0, 0), [255, 255, 255]);
        Ok(())
    }
}
