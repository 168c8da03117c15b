//! Throw heatmap rendering.
//!
//! Throws are stamped as discs into an intensity map, which is blurred,
//! normalized, colored with a jet ramp and blended over a stylized board.

use anyhow::{Context, Result};
use image::codecs::png::PngEncoder;
use image::{imageops, ExtendedColorType, GrayImage, ImageEncoder, Luma, Rgb, RgbImage};

pub const DEFAULT_HEATMAP_SIZE: u32 = 640;

const BACKGROUND: [u8; 3] = [24, 24, 24];
const RINGS: [([u8; 3], f32); 5] = [
    ([35, 35, 35], 0.48),
    ([55, 55, 55], 0.40),
    ([40, 90, 40], 0.30),
    ([40, 40, 90], 0.20),
    ([50, 50, 50], 0.08),
];
const OUTER_BULL: ([u8; 3], f32) = ([30, 150, 30], 0.03);
const BULLSEYE: ([u8; 3], f32) = ([180, 20, 20], 0.015);
const DISC_RADIUS: f32 = 0.03;
const BLUR_SIGMA: f32 = 0.02;
const BOARD_WEIGHT: f32 = 0.55;

/// Render normalized `(x, y)` throw positions as a `size`x`size` PNG.
/// Coordinates outside `[0, 1]` are clamped onto the board edge.
pub fn render_heatmap(points: &[(f64, f64)], size: u32) -> Result<Vec<u8>> {
    let size = size.max(8);
    let mut canvas = board_background(size);

    if !points.is_empty() {
        let mut stamps = GrayImage::new(size, size);
        let radius = (size as f32 * DISC_RADIUS) as i64;
        let last = (size - 1) as f64;
        for &(x, y) in points {
            let cx = (x.clamp(0.0, 1.0) * last) as i64;
            let cy = (y.clamp(0.0, 1.0) * last) as i64;
            fill_disc(size, cx, cy, radius, |px, py| {
                stamps.put_pixel(px, py, Luma([255]));
            });
        }
        let blurred = imageops::blur(&stamps, size as f32 * BLUR_SIGMA);
        let peak = blurred.pixels().map(|p| p.0[0]).max().unwrap_or(0);
        if peak > 0 {
            for (x, y, board) in canvas.enumerate_pixels_mut() {
                let level = blurred.get_pixel(x, y).0[0] as f32 / peak as f32;
                let heat = jet(level);
                for c in 0..3 {
                    let mixed = board.0[c] as f32 * BOARD_WEIGHT
                        + heat[c] as f32 * (1.0 - BOARD_WEIGHT);
                    board.0[c] = mixed.round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(canvas.as_raw(), size, size, ExtendedColorType::Rgb8)
        .context("encode heatmap png")?;
    Ok(png)
}

fn board_background(size: u32) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(size, size, Rgb(BACKGROUND));
    let center = (size / 2) as i64;
    for &(color, fraction) in RINGS.iter().chain([OUTER_BULL, BULLSEYE].iter()) {
        let radius = (size as f32 * fraction) as i64;
        fill_disc(size, center, center, radius, |x, y| {
            canvas.put_pixel(x, y, Rgb(color));
        });
    }
    canvas
}

fn fill_disc(size: u32, cx: i64, cy: i64, radius: i64, mut paint: impl FnMut(u32, u32)) {
    let limit = size as i64;
    for y in (cy - radius).max(0)..=(cy + radius).min(limit - 1) {
        for x in (cx - radius).max(0)..=(cx + radius).min(limit - 1) {
            let (dx, dy) = (x - cx, y - cy);
            if dx * dx + dy * dy <= radius * radius {
                paint(x as u32, y as u32);
            }
        }
    }
}

/// Blue through cyan, yellow and red for `level` in `[0, 1]`.
fn jet(level: f32) -> [u8; 3] {
    let v = level.clamp(0.0, 1.0) * 4.0;
    let channel = |offset: f32| ((1.5 - (v - offset).abs()).clamp(0.0, 1.0) * 255.0) as u8;
    [channel(3.0), channel(2.0), channel(1.0)]
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

    fn decode(png: &[u8]) -> Result<RgbImage> {
        Ok(image::load_from_memory_with_format(png, image::ImageFormat::Png)?.to_rgb8())
    }

    #[test]
    fn renders_a_png_of_the_requested_size() -> Result<()> {
        let png = render_heatmap(&[(0.5, 0.5), (0.55, 0.45)], DEFAULT_HEATMAP_SIZE)?;
        assert_eq!(&png[..8], PNG_SIGNATURE);
        assert!(png.len() > 1000);
        let decoded = decode(&png)?;
        assert_eq!(decoded.dimensions(), (DEFAULT_HEATMAP_SIZE, DEFAULT_HEATMAP_SIZE));
        Ok(())
    }

    #[test]
    fn no_throws_renders_the_bare_board() -> Result<()> {
        let decoded = decode(&render_heatmap(&[], 128)?)?;
        assert_eq!(decoded.get_pixel(0, 0).0, BACKGROUND);
        assert_eq!(decoded.get_pixel(64, 64).0, BULLSEYE.0);
        Ok(())
    }

    #[test]
    fn throws_heat_up_their_region() -> Result<()> {
        let bare = decode(&render_heatmap(&[], 128)?)?;
        let hot = decode(&render_heatmap(&[(0.2, 0.8), (2.0, -1.0)], 128)?)?;
        let (x, y) = (25, 101);
        assert_ne!(bare.get_pixel(x, y), hot.get_pixel(x, y));
        // The hottest spot is red-dominant.
        let [r, _, b] = hot.get_pixel(x, y).0;
        assert!(r > b, "{:?}", hot.get_pixel(x, y));
        Ok(())
    }

    #[test]
    fn jet_ramp_endpoints() {
        assert_eq!(jet(0.0), [0, 0, 127]);
        assert_eq!(jet(1.0), [127, 0, 0]);
        assert_eq!(jet(0.5)[1], 255);
    }
}
