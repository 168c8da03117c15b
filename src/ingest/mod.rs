//! Frame sources.
//!
//! This module provides the sources the capture worker pulls frames from:
//! - Synthetic board feed (`stub`), used by tests and demos
//! - USB/V4L2 cameras (feature: ingest-v4l2)
//!
//! A source is created fresh for every capture session through a
//! `FrameSourceFactory` and is owned by exactly one worker thread for its
//! whole lifetime, so at most one device handle is open at a time.
//!
//! Sources MUST:
//! - Return RGB24 frames (normalizing device formats in-memory)
//! - Report "no frame this time" as `SourceError::Transient`
//! - Reserve `SourceError::Fatal` for conditions a retry cannot fix

use anyhow::{anyhow, Result};
use std::sync::Arc;
use thiserror::Error;

use crate::frame::Frame;

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// Read failure reported by a frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No frame available right now; the worker backs off briefly and retries.
    #[error("frame not ready: {0}")]
    Transient(String),
    /// The source is unusable; the session ends.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Hardware (or synthetic) camera feed.
pub trait FrameSource: Send {
    /// Open the camera with the given index. Called once, before any `read`.
    fn open(&mut self, camera_index: u32) -> Result<()>;

    /// Block until the next frame is available.
    fn read(&mut self) -> std::result::Result<Frame, SourceError>;

    /// Release the device. Called once when the session ends, opened or not.
    fn release(&mut self);
}

/// Creates one `FrameSource` per capture session.
pub trait FrameSourceFactory: Send + Sync {
    fn create(&self) -> Box<dyn FrameSource>;
}

impl<F> FrameSourceFactory for F
where
    F: Fn() -> Box<dyn FrameSource> + Send + Sync,
{
    fn create(&self) -> Box<dyn FrameSource> {
        self()
    }
}

/// Configured source backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Stub,
    V4l2,
}

impl SourceKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" | "synthetic" => Ok(Self::Stub),
            "v4l2" | "usb" => Ok(Self::V4l2),
            other => Err(anyhow!(
                "unknown frame source '{}' (expected 'stub' or 'v4l2')",
                other
            )),
        }
    }

    /// Default backend for this build.
    pub fn default_for_build() -> Self {
        if cfg!(feature = "ingest-v4l2") {
            Self::V4l2
        } else {
            Self::Stub
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stub => "stub",
            Self::V4l2 => "v4l2",
        }
    }
}

/// Build the factory for a configured backend.
pub fn source_factory(
    kind: SourceKind,
    width: u32,
    height: u32,
) -> Result<Arc<dyn FrameSourceFactory>> {
    match kind {
        SourceKind::Stub => {
            let config = SyntheticConfig {
                width,
                height,
                ..SyntheticConfig::default()
            };
            Ok(Arc::new(move || {
                Box::new(SyntheticSource::new(config.clone())) as Box<dyn FrameSource>
            }))
        }
        SourceKind::V4l2 => {
            #[cfg(feature = "ingest-v4l2")]
            {
                Ok(Arc::new(move || {
                    Box::new(V4l2Source::new(V4l2Config { width, height })) as Box<dyn FrameSource>
                }))
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                let _ = (width, height);
                Err(anyhow!("v4l2 frame source requires the ingest-v4l2 feature"))
            }
        }
    }
}
