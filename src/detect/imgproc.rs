//! Minimal grayscale image operations for frame differencing.

use std::collections::VecDeque;

use crate::frame::Frame;

/// Single-channel 8-bit image, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    pub fn same_dims(&self, other: &GrayImage) -> bool {
        self.width == other.width && self.height == other.height
    }
}

/// BT.601 luma, integer weights.
pub fn to_luma(frame: &Frame) -> GrayImage {
    let data = frame
        .pixels()
        .chunks_exact(3)
        .map(|px| {
            let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
            ((299 * r + 587 * g + 114 * b + 500) / 1000) as u8
        })
        .collect();
    GrayImage {
        width: frame.width() as usize,
        height: frame.height() as usize,
        data,
    }
}

fn gaussian_kernel(ksize: usize) -> Vec<f32> {
    let ksize = ksize.max(1) | 1;
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (ksize / 2) as i32;
    let mut kernel: Vec<f32> = (-half..=half)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// Separable Gaussian blur with replicated borders.
///
/// `ksize` is forced odd; sigma follows the usual `0.3*((k-1)/2-1)+0.8` rule.
pub fn gaussian_blur(src: &GrayImage, ksize: usize) -> GrayImage {
    let kernel = gaussian_kernel(ksize);
    if kernel.len() == 1 || src.data.is_empty() {
        return src.clone();
    }
    let half = (kernel.len() / 2) as isize;
    let (w, h) = (src.width, src.height);
    let clamp = |v: isize, max: usize| v.clamp(0, max as isize - 1) as usize;

    let mut horiz = vec![0f32; w * h];
    for y in 0..h {
        let row = &src.data[y * w..(y + 1) * w];
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = clamp(x as isize + k as isize - half, w);
                acc += weight * row[sx] as f32;
            }
            horiz[y * w + x] = acc;
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = clamp(y as isize + k as isize - half, h);
                acc += weight * horiz[sy * w + x];
            }
            out.data[y * w + x] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// `255` where `|a - b| > threshold`, else `0`. Images must share dimensions.
pub fn diff_mask(a: &GrayImage, b: &GrayImage, threshold: u8) -> GrayImage {
    debug_assert!(a.same_dims(b));
    let data = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(&pa, &pb)| if pa.abs_diff(pb) > threshold { 255 } else { 0 })
        .collect();
    GrayImage {
        width: a.width,
        height: a.height,
        data,
    }
}

/// 3x3 binary dilation, repeated `iterations` times.
pub fn dilate(mask: &GrayImage, iterations: usize) -> GrayImage {
    let (w, h) = (mask.width, mask.height);
    let mut current = mask.clone();
    for _ in 0..iterations {
        let mut next = GrayImage::new(w, h);
        for y in 0..h {
            let y0 = y.saturating_sub(1);
            let y1 = (y + 1).min(h - 1);
            for x in 0..w {
                let x0 = x.saturating_sub(1);
                let x1 = (x + 1).min(w - 1);
                let hit = (y0..=y1).any(|yy| (x0..=x1).any(|xx| current.get(xx, yy) != 0));
                if hit {
                    next.data[y * w + x] = 255;
                }
            }
        }
        current = next;
    }
    current
}

/// One 8-connected foreground region.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Region {
    /// Pixel count.
    pub area: usize,
    /// Area centroid in pixel coordinates.
    pub centroid: (f64, f64),
}

/// Largest 8-connected non-zero region of `mask`, if any.
pub fn largest_region(mask: &GrayImage) -> Option<Region> {
    let (w, h) = (mask.width, mask.height);
    let mut visited = vec![false; w * h];
    let mut queue = VecDeque::new();
    let mut best: Option<Region> = None;

    for start in 0..w * h {
        if visited[start] || mask.data[start] == 0 {
            continue;
        }
        visited[start] = true;
        queue.push_back(start);

        let (mut area, mut sum_x, mut sum_y) = (0usize, 0f64, 0f64);
        while let Some(idx) = queue.pop_front() {
            let (x, y) = (idx % w, idx / w);
            area += 1;
            sum_x += x as f64;
            sum_y += y as f64;

            for yy in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for xx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let n = yy * w + xx;
                    if !visited[n] && mask.data[n] != 0 {
                        visited[n] = true;
                        queue.push_back(n);
                    }
                }
            }
        }

        if best.map_or(true, |b| area > b.area) {
            best = Some(Region {
                area,
                centroid: (sum_x / area as f64, sum_y / area as f64),
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> GrayImage {
        let height = rows.len();
        let width = rows[0].len();
        let data = rows
            .iter()
            .flat_map(|row| row.bytes().map(|b| if b == b'#' { 255 } else { 0 }))
            .collect();
        GrayImage {
            width,
            height,
            data,
        }
    }

    #[test]
    fn luma_weights_channels() {
        let frame = Frame::filled(1, 1, [255, 0, 0]);
        assert_eq!(to_luma(&frame).data, vec![76]);
        let frame = Frame::filled(1, 1, [255, 255, 255]);
        assert_eq!(to_luma(&frame).data, vec![255]);
    }

    #[test]
    fn blur_preserves_flat_images() {
        let img = GrayImage {
            width: 12,
            height: 7,
            data: vec![90; 84],
        };
        assert_eq!(gaussian_blur(&img, 9), img);
    }

    #[test]
    fn blur_spreads_an_impulse() {
        let mut img = GrayImage::new(15, 15);
        img.data[7 * 15 + 7] = 255;
        let blurred = gaussian_blur(&img, 9);
        assert!(blurred.get(7, 7) < 255);
        assert!(blurred.get(8, 7) > 0);
        assert!(blurred.get(7, 7) >= blurred.get(9, 7));
    }

    #[test]
    fn diff_mask_is_strictly_above_threshold() {
        let a = GrayImage {
            width: 3,
            height: 1,
            data: vec![10, 10, 10],
        };
        let b = GrayImage {
            width: 3,
            height: 1,
            data: vec![38, 39, 0],
        };
        assert_eq!(diff_mask(&a, &b, 28).data, vec![0, 255, 0]);
    }

    #[test]
    fn dilation_grows_and_merges() {
        let mask = mask_from(&["#...#", ".....", "....."]);
        let grown = dilate(&mask, 1);
        assert_eq!(grown, mask_from(&["##.##", "##.##", "....."]));
        let twice = dilate(&mask, 2);
        assert!(twice.data.iter().take(10).all(|&v| v == 255));
    }

    #[test]
    fn largest_region_picks_biggest_blob() {
        let mask = mask_from(&[
            "##......", //
            "##...###", //
            ".....###", //
            ".....###", //
        ]);
        let region = largest_region(&mask).expect("region");
        assert_eq!(region.area, 9);
        assert_eq!(region.centroid, (6.0, 2.0));
    }

    #[test]
    fn diagonal_pixels_are_connected() {
        let mask = mask_from(&["#..", ".#.", "..#"]);
        assert_eq!(largest_region(&mask).map(|r| r.area), Some(3));
    }

    #[test]
    fn empty_mask_has_no_region() {
        assert!(largest_region(&GrayImage::new(4, 4)).is_none());
    }
}
