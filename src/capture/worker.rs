use anyhow::{anyhow, Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{tick_interval, CancelToken, Recording, Shared, TickPacer};
use crate::calibration::BoardCalibrator;
use crate::detect::{DetectorConfig, HitPoint, MotionImpactDetector};
use crate::error::CaptureError;
use crate::frame::CachedFrame;
use crate::ingest::{FrameSource, FrameSourceFactory, SourceError};
use crate::storage::HitSink;

/// Back-off after a transient read failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

pub(super) struct WorkerContext {
    pub epoch: u64,
    pub camera_index: u32,
    pub fps: u32,
    pub recording: Option<Recording>,
    pub cancel: CancelToken,
    pub shared: Arc<Shared>,
    pub sources: Arc<dyn FrameSourceFactory>,
    pub hits: Arc<dyn HitSink>,
    pub calibrator: Arc<BoardCalibrator>,
    pub jpeg_quality: u8,
    pub detector: DetectorConfig,
}

/// Worker thread body. Always clears the session's frame, reports the
/// session as ended and acknowledges on `done`, even when a source panics.
pub(super) fn run(ctx: WorkerContext, done: SyncSender<()>) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut source = ctx.sources.create();
        let outcome = run_session(&ctx, source.as_mut());
        source.release();
        outcome
    }))
    .unwrap_or_else(|_| Err(anyhow!("capture worker panicked")));
    ctx.shared.frames.clear_session(ctx.epoch);

    let last_error = match outcome {
        Ok(()) => {
            log::info!("capture: worker epoch={} stopped", ctx.epoch);
            None
        }
        Err(err) => {
            log::error!("capture: worker epoch={} failed: {:#}", ctx.epoch, err);
            Some(format!("{:#}", err))
        }
    };
    ctx.shared.update(ctx.epoch, |status| {
        status.running = false;
        if last_error.is_some() {
            status.last_error = last_error;
        }
    });
    let _ = done.send(());
}

fn run_session(ctx: &WorkerContext, source: &mut dyn FrameSource) -> Result<()> {
    source
        .open(ctx.camera_index)
        .map_err(|err| CaptureError::DeviceOpenFailure {
            index: ctx.camera_index,
            reason: format!("{:#}", err),
        })?;

    let mut detector = ctx
        .recording
        .as_ref()
        .map(|_| MotionImpactDetector::new(ctx.detector.clone()));
    let mut pacer = TickPacer::new(tick_interval(ctx.fps), Instant::now());

    while !ctx.cancel.is_cancelled() {
        let frame = match source.read() {
            Ok(frame) => frame,
            Err(SourceError::Transient(reason)) => {
                log::debug!("capture: camera {} frame not ready: {}", ctx.camera_index, reason);
                if ctx.cancel.wait_timeout(RETRY_BACKOFF) {
                    break;
                }
                continue;
            }
            Err(SourceError::Fatal(err)) => {
                return Err(CaptureError::UnrecoverableReadFailure(format!("{:#}", err)).into());
            }
        };
        // A read can block for a long time; a stop may have happened meanwhile.
        if ctx.cancel.is_cancelled() {
            break;
        }

        let frame = frame.center_crop_square();
        let cached = CachedFrame::encode(&frame, ctx.jpeg_quality)
            .context("encode live-view frame")?;
        ctx.shared.frames.publish(ctx.epoch, cached);

        let mut stored = false;
        if let (Some(detector), Some(recording)) = (detector.as_mut(), ctx.recording.as_ref()) {
            if let Some(impact) = detector.detect(&frame) {
                let (cx, cy) = impact.centroid_px;
                let hit = match ctx.calibrator.transform_point(cx, cy) {
                    Some((x, y)) => HitPoint::clamped(x, y, impact.hit.confidence),
                    None => impact.hit,
                };
                ctx.hits
                    .append_hit(&recording.user_id, &recording.session_id, &hit)
                    .map_err(|err| CaptureError::Persistence(err.context("store hit")))?;
                log::info!(
                    "capture: hit session={} x={:.3} y={:.3} confidence={:.2}",
                    recording.session_id,
                    hit.x_norm,
                    hit.y_norm,
                    hit.confidence
                );
                stored = true;
            }
        }

        ctx.shared.update(ctx.epoch, |status| {
            status.frames_processed += 1;
            if stored {
                status.throws_detected += 1;
            }
        });

        let wait = pacer.advance(Instant::now());
        if !wait.is_zero() && ctx.cancel.wait_timeout(wait) {
            break;
        }
    }
    Ok(())
}
