use thiserror::Error;

/// Errors surfaced by the capture controller and the board calibrator.
///
/// Only `AlreadyRunning`, `InvalidCalibration` and `Persistence` are ever
/// returned from a call. Device and read failures happen on the worker thread
/// and are rendered into `CaptureStatus::last_error` instead.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture already running")]
    AlreadyRunning,
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),
    #[error("failed to open camera index {index}: {reason}")]
    DeviceOpenFailure { index: u32, reason: String },
    #[error("unrecoverable frame read failure: {0}")]
    UnrecoverableReadFailure(String),
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}
