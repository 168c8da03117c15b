//! Synthetic board feed.
//!
//! `SyntheticSource` renders a static dartboard-like scene and periodically
//! "lands" a dart: a bright disk at a random position that stays on the board
//! until the board is cleared. Between landings consecutive frames are
//! identical, so a frame-differencing detector sees exactly one motion burst
//! per landing (and one per clear).

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{FrameSource, SourceError};
use crate::frame::Frame;

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// A dart lands every N frames (0 disables landings).
    pub landing_every: u64,
    /// Darts on the board before it is cleared.
    pub darts_per_round: usize,
    /// Radius of a rendered dart in pixels.
    pub dart_radius: u32,
    /// Every Nth read reports a transient failure (0 disables).
    pub transient_every: u64,
    /// Reject `open` (simulates a missing device).
    pub unavailable: bool,
    /// RNG seed for landing positions.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            landing_every: 15,
            darts_per_round: 3,
            dart_radius: 24,
            transient_every: 0,
            unavailable: false,
            seed: 0x5eed,
        }
    }
}

/// Synthetic frame source (`stub`).
pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    background: Option<Frame>,
    darts: Vec<(u32, u32)>,
    reads: u64,
    opened: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            background: None,
            darts: Vec::new(),
            reads: 0,
            opened: false,
        }
    }

    /// Darts currently rendered on the board (pixel centers, uncropped frame).
    pub fn darts(&self) -> &[(u32, u32)] {
        &self.darts
    }

    fn render_background(&self) -> Frame {
        let (w, h) = (self.config.width, self.config.height);
        let mut frame = Frame::filled(w, h, [24, 24, 28]);
        let cx = w as f32 / 2.0;
        let cy = h as f32 / 2.0;
        let radius = w.min(h) as f32 * 0.45;
        for y in 0..h {
            for x in 0..w {
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                let r = (dx * dx + dy * dy).sqrt();
                if r > radius {
                    continue;
                }
                // Alternating rings, dark enough that darts stand out.
                let ring = ((r / radius) * 10.0) as u32;
                let rgb = if ring % 2 == 0 {
                    [60, 20, 20]
                } else {
                    [20, 50, 20]
                };
                frame.set_pixel(x, y, rgb);
            }
        }
        frame
    }

    fn advance_scene(&mut self) {
        if self.config.landing_every == 0 || self.reads % self.config.landing_every != 0 {
            return;
        }
        if self.darts.len() >= self.config.darts_per_round.max(1) {
            self.darts.clear();
            return;
        }
        let (w, h) = (self.config.width, self.config.height);
        let side = w.min(h);
        let margin = self.config.dart_radius + 2;
        if side <= margin * 2 {
            return;
        }
        // Land inside the centered square so darts survive the capture crop.
        let x0 = (w - side) / 2;
        let y0 = (h - side) / 2;
        let x = x0 + self.rng.gen_range(margin..side - margin);
        let y = y0 + self.rng.gen_range(margin..side - margin);
        self.darts.push((x, y));
    }

    fn render(&self) -> Frame {
        let mut frame = match &self.background {
            Some(bg) => bg.clone(),
            None => self.render_background(),
        };
        let r = self.config.dart_radius as i64;
        for &(cx, cy) in &self.darts {
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx * dx + dy * dy > r * r {
                        continue;
                    }
                    let x = cx as i64 + dx;
                    let y = cy as i64 + dy;
                    if x < 0 || y < 0 || x >= frame.width() as i64 || y >= frame.height() as i64 {
                        continue;
                    }
                    frame.set_pixel(x as u32, y as u32, [240, 240, 210]);
                }
            }
        }
        frame
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self, camera_index: u32) -> Result<()> {
        if self.config.unavailable {
            return Err(anyhow!("synthetic camera {} unavailable", camera_index));
        }
        self.background = Some(self.render_background());
        self.opened = true;
        log::info!(
            "SyntheticSource: opened camera {} ({}x{})",
            camera_index,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn read(&mut self) -> std::result::Result<Frame, SourceError> {
        if !self.opened {
            return Err(SourceError::Fatal(anyhow!("synthetic source not opened")));
        }
        self.reads += 1;
        if self.config.transient_every > 0 && self.reads % self.config.transient_every == 0 {
            return Err(SourceError::Transient("synthetic dropped frame".to_string()));
        }
        self.advance_scene();
        Ok(self.render())
    }

    fn release(&mut self) {
        self.opened = false;
        self.background = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SyntheticConfig {
        SyntheticConfig {
            width: 160,
            height: 120,
            landing_every: 3,
            dart_radius: 8,
            ..SyntheticConfig::default()
        }
    }

    #[test]
    fn read_before_open_is_fatal() {
        let mut source = SyntheticSource::new(small_config());
        assert!(matches!(source.read(), Err(SourceError::Fatal(_))));
    }

    #[test]
    fn unavailable_source_fails_to_open() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            unavailable: true,
            ..small_config()
        });
        assert!(source.open(3).is_err());
    }

    #[test]
    fn frames_only_change_on_landings() -> Result<()> {
        let mut source = SyntheticSource::new(small_config());
        source.open(0)?;

        let read = |s: &mut SyntheticSource| s.read().map_err(|e| anyhow!("{e}"));
        let f1 = read(&mut source)?;
        let f2 = read(&mut source)?;
        assert_eq!(f1, f2);

        let f3 = read(&mut source)?;
        assert_ne!(f2, f3);
        assert_eq!(source.darts().len(), 1);
        Ok(())
    }

    #[test]
    fn board_clears_after_a_round() -> Result<()> {
        let mut source = SyntheticSource::new(small_config());
        source.open(0)?;
        for _ in 0..9 {
            source.read().map_err(|e| anyhow!("{e}"))?;
        }
        assert_eq!(source.darts().len(), 3);
        for _ in 0..3 {
            source.read().map_err(|e| anyhow!("{e}"))?;
        }
        assert!(source.darts().is_empty());
        Ok(())
    }

    #[test]
    fn transient_failures_are_periodic() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig {
            transient_every: 2,
            ..small_config()
        });
        source.open(0)?;
        assert!(source.read().is_ok());
        assert!(matches!(source.read(), Err(SourceError::Transient(_))));
        assert!(source.read().is_ok());
        Ok(())
    }
}
