//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for capturing frames from local USB
//! cameras through `/dev/video<index>`.
//!
//! The V4L2 source is responsible for:
//! - Opening the device node for the requested camera index
//! - Negotiating a capture format (RGB3 preferred, YUYV/NV12 accepted)
//! - Normalizing every buffer to RGB24 in-memory

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceError};
use crate::frame::Frame;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// USB camera source backed by libv4l memory-mapped streaming.
pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    device_path: String,
    pixel_format: PixelFormat,
    active_width: u32,
    active_height: u32,
    frame_count: u64,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            device_path: String::new(),
            pixel_format: PixelFormat::Rgb24,
            frame_count: 0,
        }
    }
}

impl FrameSource for V4l2Source {
    fn open(&mut self, camera_index: u32) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.device_path = format!("/dev/video{}", camera_index);
        let device = v4l::Device::with_path(&self.device_path)
            .with_context(|| format!("open v4l2 device {}", self.device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.pixel_format = match &format.fourcc.repr {
            b"RGB3" => PixelFormat::Rgb24,
            b"YUYV" => PixelFormat::Yuyv,
            b"NV12" => PixelFormat::Nv12,
            other => {
                return Err(anyhow!(
                    "unsupported v4l2 pixel format {} on {}",
                    String::from_utf8_lossy(other),
                    self.device_path
                ))
            }
        };
        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: opened {} ({}x{}, {:?})",
            self.device_path,
            self.active_width,
            self.active_height,
            self.pixel_format
        );
        Ok(())
    }

    fn read(&mut self) -> std::result::Result<Frame, SourceError> {
        use std::io::ErrorKind;
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| SourceError::Fatal(anyhow!("v4l2 device not opened")))?;
        let (width, height, format) = (self.active_width, self.active_height, self.pixel_format);

        let rgb = state.with_stream_mut(|stream| match stream.next() {
            Ok((buf, _meta)) => normalize_to_rgb(buf, width, height, format)
                .map_err(|err| SourceError::Transient(format!("partial frame: {err}"))),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Err(SourceError::Transient(err.to_string()))
            }
            Err(err) => Err(SourceError::Fatal(
                anyhow::Error::new(err).context("capture v4l2 frame"),
            )),
        })?;

        self.frame_count += 1;
        Frame::from_rgb(width, height, rgb).map_err(SourceError::Fatal)
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Source: released {} after {} frames",
                self.device_path,
                self.frame_count
            );
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.release();
    }
}
