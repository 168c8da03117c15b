//! Frames and the live-view frame cache.
//!
//! - `Frame`: owned RGB24 pixel buffer as produced by a frame source.
//! - `CachedFrame`: JPEG encoding of the latest square-cropped frame.
//! - `FrameBuffer`: single-slot, latest-wins cache shared between the capture
//!   worker (writer) and live-view readers.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::sync::{Arc, Mutex};

use crate::lock_unpoisoned;

/// Default JPEG quality for the live-view feed.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

// ----------------------------------------------------------------------------
// Frame: raw RGB24 pixels
// ----------------------------------------------------------------------------

/// Owned RGB24 frame (row-major, 3 bytes per pixel, no row padding).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap an RGB24 buffer, validating its length against the dimensions.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Frame filled with a single color.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// RGB value at (x, y). Panics when out of bounds, like slice indexing.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 3;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 3;
        self.data[offset..offset + 3].copy_from_slice(&rgb);
    }

    /// Center-crop to a square by trimming the longer dimension symmetrically.
    ///
    /// Square frames are returned as-is. An odd surplus leaves the extra
    /// column/row on the trailing side.
    pub fn center_crop_square(self) -> Frame {
        if self.width == self.height {
            return self;
        }
        let side = self.width.min(self.height) as usize;
        let (x0, y0) = if self.width > self.height {
            ((self.width as usize - side) / 2, 0)
        } else {
            (0, (self.height as usize - side) / 2)
        };
        let stride = self.width as usize * 3;
        let mut data = Vec::with_capacity(side * side * 3);
        for row in y0..y0 + side {
            let start = row * stride + x0 * 3;
            data.extend_from_slice(&self.data[start..start + side * 3]);
        }
        Frame {
            width: side as u32,
            height: side as u32,
            data,
        }
    }

    /// Encode as baseline JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .context("encode jpeg")?;
        Ok(out)
    }

    /// Decode a JPEG (or any format enabled in the `image` build) into RGB24.
    pub fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
        let decoded = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
            .context("decode jpeg")?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        Frame::from_rgb(width, height, decoded.into_raw())
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    let len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
    Ok(len)
}

// ----------------------------------------------------------------------------
// FrameBuffer: single-slot latest-frame cache
// ----------------------------------------------------------------------------

/// Encoded frame as served to live-view readers.
#[derive(Clone, Debug)]
pub struct CachedFrame {
    pub jpeg: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl CachedFrame {
    pub fn encode(frame: &Frame, quality: u8) -> Result<Self> {
        Ok(Self {
            jpeg: frame.encode_jpeg(quality)?.into(),
            width: frame.width,
            height: frame.height,
        })
    }
}

struct Slot {
    epoch: u64,
    frame: CachedFrame,
}

/// Single-slot frame cache.
///
/// Writers overwrite, readers clone the `Arc` out. There is no queue and no
/// change notification: a slow reader skips frames, a fast reader may see the
/// same frame twice. Each entry remembers the session epoch that published it.
pub struct FrameBuffer {
    slot: Mutex<Option<Slot>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Overwrite the cached frame.
    pub fn publish(&self, epoch: u64, frame: CachedFrame) {
        *lock_unpoisoned(&self.slot) = Some(Slot { epoch, frame });
    }

    /// Most recent frame, if any has been published since the last clear.
    pub fn latest(&self) -> Option<CachedFrame> {
        lock_unpoisoned(&self.slot)
            .as_ref()
            .map(|slot| slot.frame.clone())
    }

    /// Clear the slot only if it was last written by `epoch`.
    pub fn clear_session(&self, epoch: u64) {
        let mut slot = lock_unpoisoned(&self.slot);
        if slot.as_ref().is_some_and(|s| s.epoch == epoch) {
            *slot = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.slot).is_none()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
