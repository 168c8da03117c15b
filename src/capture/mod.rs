//! Capture session lifecycle.
//!
//! `CaptureController` owns at most one active session. A session is one
//! worker thread that pulls frames from a `FrameSource`, publishes the live
//! view to the `FrameBuffer` and, when recording, turns detector impacts into
//! stored hits.
//!
//! State machine:
//!
//! ```text
//! Idle --start_preview / start_recording--> Running(mode) --stop--> Idle
//!                                      \--fatal worker error--> Idle (last_error set)
//! ```
//!
//! Locks:
//! - `control` serializes start/stop and owns the worker handle. It is held
//!   for the whole bounded stop wait, and never taken by `status()` or
//!   `latest_frame()`.
//! - the status lock and the frame-cache lock are narrow and never held across
//!   device I/O, encoding or persistence.
//!
//! Every session gets a monotonic epoch. `stop()` retires it; a worker whose
//! epoch is retired can no longer write status, so a worker abandoned after a
//! stop timeout cannot disturb later sessions.

mod cancel;
mod pacing;
mod worker;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::calibration::BoardCalibrator;
use crate::detect::DetectorConfig;
use crate::error::CaptureError;
use crate::frame::{CachedFrame, FrameBuffer, DEFAULT_JPEG_QUALITY};
use crate::ingest::FrameSourceFactory;
use crate::lock_unpoisoned;
use crate::storage::HitSink;

pub use cancel::CancelToken;
pub use pacing::{tick_interval, TickPacer};

pub const DEFAULT_FPS: u32 = 10;
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Live view only; nothing is detected or stored.
    #[default]
    Preview,
    Recording,
}

/// Snapshot of the controller state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub running: bool,
    pub mode: CaptureMode,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub camera_index: Option<u32>,
    pub fps: u32,
    pub frames_processed: u64,
    pub throws_detected: u64,
    pub last_error: Option<String>,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self {
            running: false,
            mode: CaptureMode::Preview,
            user_id: None,
            session_id: None,
            camera_index: None,
            fps: DEFAULT_FPS,
            frames_processed: 0,
            throws_detected: 0,
            last_error: None,
        }
    }
}

/// Controller tuning shared by every session.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// How long `stop()` waits for the worker before abandoning it.
    pub stop_timeout: Duration,
    pub jpeg_quality: u8,
    pub detector: DetectorConfig,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            detector: DetectorConfig::default(),
        }
    }
}

/// Who the hits of a recording session belong to.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Recording {
    user_id: String,
    session_id: String,
}

struct StatusCell {
    /// Epoch of the session allowed to write, 0 when none is.
    epoch: u64,
    status: CaptureStatus,
}

/// State shared between the controller and its workers.
struct Shared {
    status: Mutex<StatusCell>,
    frames: FrameBuffer,
}

impl Shared {
    fn snapshot(&self) -> CaptureStatus {
        lock_unpoisoned(&self.status).status.clone()
    }

    /// Apply `f` if `epoch` is still the live session. Returns whether it ran.
    fn update(&self, epoch: u64, f: impl FnOnce(&mut CaptureStatus)) -> bool {
        let mut cell = lock_unpoisoned(&self.status);
        if cell.epoch != epoch {
            return false;
        }
        f(&mut cell.status);
        true
    }

    /// Fence out `epoch` and report Idle.
    fn retire(&self, epoch: u64) {
        let mut cell = lock_unpoisoned(&self.status);
        if cell.epoch == epoch {
            cell.epoch = 0;
            cell.status.running = false;
        }
    }
}

struct ActiveSession {
    epoch: u64,
    cancel: CancelToken,
    done: Receiver<()>,
    join: JoinHandle<()>,
}

/// Single-session capture controller.
pub struct CaptureController {
    sources: Arc<dyn FrameSourceFactory>,
    hits: Arc<dyn HitSink>,
    calibrator: Arc<BoardCalibrator>,
    settings: CaptureSettings,
    shared: Arc<Shared>,
    control: Mutex<Option<ActiveSession>>,
    next_epoch: AtomicU64,
}

impl CaptureController {
    pub fn new(
        sources: Arc<dyn FrameSourceFactory>,
        hits: Arc<dyn HitSink>,
        calibrator: Arc<BoardCalibrator>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            sources,
            hits,
            calibrator,
            settings,
            shared: Arc::new(Shared {
                status: Mutex::new(StatusCell {
                    epoch: 0,
                    status: CaptureStatus::default(),
                }),
                frames: FrameBuffer::new(),
            }),
            control: Mutex::new(None),
            next_epoch: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn calibrator(&self) -> &Arc<BoardCalibrator> {
        &self.calibrator
    }

    /// Start a live-view session. Returns as soon as the worker is spawned;
    /// device failures show up in later `status()` calls.
    pub fn start_preview(&self, camera_index: u32, fps: u32) -> Result<CaptureStatus, CaptureError> {
        self.start(None, camera_index, fps)
    }

    /// Start a session that detects impacts and stores them for
    /// `user_id`/`session_id`.
    pub fn start_recording(
        &self,
        user_id: &str,
        session_id: &str,
        camera_index: u32,
        fps: u32,
    ) -> Result<CaptureStatus, CaptureError> {
        let recording = Recording {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        };
        self.start(Some(recording), camera_index, fps)
    }

    fn start(
        &self,
        recording: Option<Recording>,
        camera_index: u32,
        fps: u32,
    ) -> Result<CaptureStatus, CaptureError> {
        let mut control = lock_unpoisoned(&self.control);
        if self.shared.snapshot().running {
            let exited = control
                .as_ref()
                .is_some_and(|session| session.join.is_finished());
            if !exited {
                return Err(CaptureError::AlreadyRunning);
            }
        }
        // A worker that ended on its own is still parked here; reap it.
        if let Some(finished) = control.take() {
            self.finish(finished);
        }

        let fps = fps.max(1);
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let mode = if recording.is_some() {
            CaptureMode::Recording
        } else {
            CaptureMode::Preview
        };
        let status = CaptureStatus {
            running: true,
            mode,
            user_id: recording.as_ref().map(|r| r.user_id.clone()),
            session_id: recording.as_ref().map(|r| r.session_id.clone()),
            camera_index: Some(camera_index),
            fps,
            ..CaptureStatus::default()
        };
        {
            let mut cell = lock_unpoisoned(&self.shared.status);
            cell.epoch = epoch;
            cell.status = status.clone();
        }

        let cancel = CancelToken::new();
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let ctx = worker::WorkerContext {
            epoch,
            camera_index,
            fps,
            recording,
            cancel: cancel.clone(),
            shared: self.shared.clone(),
            sources: self.sources.clone(),
            hits: self.hits.clone(),
            calibrator: self.calibrator.clone(),
            jpeg_quality: self.settings.jpeg_quality,
            detector: self.settings.detector.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("capture-{}", camera_index))
            .spawn(move || worker::run(ctx, done_tx));
        match spawned {
            Ok(join) => {
                log::info!(
                    "capture: started {:?} session epoch={} camera={} fps={}",
                    mode,
                    epoch,
                    camera_index,
                    fps
                );
                *control = Some(ActiveSession {
                    epoch,
                    cancel,
                    done: done_rx,
                    join,
                });
                Ok(status)
            }
            Err(err) => {
                log::error!("capture: failed to spawn worker: {}", err);
                self.shared.update(epoch, |s| {
                    s.running = false;
                    s.last_error = Some(format!("failed to spawn capture worker: {}", err));
                });
                self.shared.retire(epoch);
                Ok(self.shared.snapshot())
            }
        }
    }

    /// Stop the active session, waiting at most the configured stop timeout.
    /// A no-op on an idle controller.
    pub fn stop(&self) -> CaptureStatus {
        let mut control = lock_unpoisoned(&self.control);
        if let Some(session) = control.take() {
            self.finish(session);
        }
        self.shared.snapshot()
    }

    fn finish(&self, session: ActiveSession) {
        let ActiveSession {
            epoch,
            cancel,
            done,
            join,
        } = session;
        cancel.cancel();
        match done.recv_timeout(self.settings.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if join.join().is_err() {
                    log::error!("capture: worker epoch={} panicked", epoch);
                    self.shared.update(epoch, |s| {
                        s.last_error = Some("capture worker panicked".to_string());
                    });
                    self.shared.frames.clear_session(epoch);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "capture: worker epoch={} did not stop within {:?}; abandoning it",
                    epoch,
                    self.settings.stop_timeout
                );
                drop(join);
                self.shared.frames.clear_session(epoch);
            }
        }
        self.shared.retire(epoch);
    }

    /// Current status. Never waits on the worker.
    pub fn status(&self) -> CaptureStatus {
        self.shared.snapshot()
    }

    /// Most recent live-view frame of the running session.
    pub fn latest_frame(&self) -> Option<CachedFrame> {
        self.shared.frames.latest()
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        let session = lock_unpoisoned(&self.control).take();
        if let Some(session) = session {
            self.finish(session);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::InMemoryCalibrationStore;
    use crate::frame::Frame;
    use crate::ingest::{FrameSource, SourceError, SyntheticConfig, SyntheticSource};
    use crate::storage::InMemoryHitSink;
    use anyhow::Result;
    use std::time::Instant;

    fn synthetic(config: SyntheticConfig) -> Arc<dyn FrameSourceFactory> {
        Arc::new(move || Box::new(SyntheticSource::new(config.clone())) as Box<dyn FrameSource>)
    }

    fn small() -> SyntheticConfig {
        SyntheticConfig {
            width: 160,
            height: 120,
            ..SyntheticConfig::default()
        }
    }

    fn controller(
        sources: Arc<dyn FrameSourceFactory>,
        settings: CaptureSettings,
    ) -> (CaptureController, Arc<InMemoryHitSink>) {
        let hits = Arc::new(InMemoryHitSink::new());
        let calibrator = Arc::new(BoardCalibrator::uncalibrated(
            Arc::new(InMemoryCalibrationStore::new()),
            101,
        ));
        let controller = CaptureController::new(sources, hits.clone(), calibrator, settings);
        (controller, hits)
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    /// Source whose reads block far longer than any stop timeout.
    struct StuckSource {
        block_for: Duration,
    }

    impl FrameSource for StuckSource {
        fn open(&mut self, _camera_index: u32) -> Result<()> {
            Ok(())
        }

        fn read(&mut self) -> std::result::Result<Frame, SourceError> {
            std::thread::sleep(self.block_for);
            Ok(Frame::filled(8, 8, [0, 0, 0]))
        }

        fn release(&mut self) {}
    }

    #[test]
    fn idle_stop_is_a_noop() {
        let (controller, _) = controller(synthetic(small()), CaptureSettings::default());
        let status = controller.stop();
        assert!(!status.running);
        assert_eq!(status, CaptureStatus::default());
        assert!(controller.latest_frame().is_none());
    }

    #[test]
    fn second_start_is_rejected_and_status_untouched() -> Result<()> {
        let (controller, _) = controller(synthetic(small()), CaptureSettings::default());
        controller.start_preview(0, 10)?;
        let before = controller.status();

        let err = controller
            .start_recording("u1", "s1", 1, 5)
            .expect_err("already running");
        assert!(matches!(err, CaptureError::AlreadyRunning));

        let after = controller.status();
        assert_eq!(after.mode, CaptureMode::Preview);
        assert_eq!(after.camera_index, before.camera_index);
        assert_eq!(after.user_id, None);
        controller.stop();
        Ok(())
    }

    #[test]
    fn fps_is_clamped_to_one() -> Result<()> {
        let (controller, _) = controller(synthetic(small()), CaptureSettings::default());
        let status = controller.start_preview(0, 0)?;
        assert_eq!(status.fps, 1);
        controller.stop();
        Ok(())
    }

    #[test]
    fn preview_publishes_square_frames_and_stops() -> Result<()> {
        let (controller, hits) = controller(synthetic(small()), CaptureSettings::default());
        let status = controller.start_preview(0, 30)?;
        assert!(status.running);
        assert_eq!(status.mode, CaptureMode::Preview);

        assert!(wait_for(
            || controller.latest_frame().is_some(),
            Duration::from_secs(5)
        ));
        let frame = controller.latest_frame().expect("frame");
        assert_eq!((frame.width, frame.height), (120, 120));

        let started = Instant::now();
        let stopped = controller.stop();
        assert!(!stopped.running);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(controller.latest_frame().is_none());
        assert!(hits.hits().is_empty());
        Ok(())
    }

    #[test]
    fn open_failure_lands_in_last_error() -> Result<()> {
        let config = SyntheticConfig {
            unavailable: true,
            ..small()
        };
        let (controller, _) = controller(synthetic(config), CaptureSettings::default());
        controller.start_preview(3, 10)?;
        assert!(wait_for(
            || !controller.status().running,
            Duration::from_secs(5)
        ));
        let status = controller.status();
        let error = status.last_error.expect("last_error");
        assert!(error.contains("failed to open camera index 3"), "{}", error);

        // The failed session does not block a new one.
        let restarted = controller.start_preview(3, 10)?;
        assert!(restarted.running);
        controller.stop();
        Ok(())
    }

    #[test]
    fn abandoned_worker_cannot_touch_the_next_session() -> Result<()> {
        let stuck: Arc<dyn FrameSourceFactory> = Arc::new(|| {
            Box::new(StuckSource {
                block_for: Duration::from_millis(800),
            }) as Box<dyn FrameSource>
        });
        let settings = CaptureSettings {
            stop_timeout: Duration::from_millis(50),
            ..CaptureSettings::default()
        };
        let (controller, _) = controller(stuck, settings);

        controller.start_preview(0, 10)?;
        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        let stopped = controller.stop();
        assert!(!stopped.running);
        assert!(started.elapsed() < Duration::from_millis(500));

        controller.start_recording("u1", "s1", 1, 10)?;
        // Let the abandoned worker's read return and the worker exit.
        std::thread::sleep(Duration::from_millis(1000));
        let status = controller.status();
        assert!(status.running);
        assert_eq!(status.mode, CaptureMode::Recording);
        assert_eq!(status.camera_index, Some(1));
        assert!(status.last_error.is_none());
        Ok(())
    }
}
