//! Variational stereo matching
//!
//! Coarse-to-fine minimization of a photometric data term with Tikhonov
//! smoothing, solved by damped fixed-point iteration on a float disparity
//! field, followed by a median filter. Produces a dense map without an
//! explicit validity mask, unlike the block-matching family.

use super::{DisparityMap, Tuning, DISPARITY_SCALE};
use crate::{Error, Result};
use image::GrayImage;

const LEVELS: usize = 3;
const ITERATIONS: usize = 25;
const LAMBDA: f32 = 0.03;

pub struct VariationalMatcher {
    tuning: Tuning,
}

struct FloatImage {
    data: Vec<f32>,
    width: usize,
    height: usize,
}

impl FloatImage {
    fn from_gray(img: &GrayImage) -> Self {
        Self {
            data: img.as_raw().iter().map(|&v| v as f32).collect(),
            width: img.width() as usize,
            height: img.height() as usize,
        }
    }

    fn downsample(&self) -> Self {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut data = vec![0.0f32; width * height];
        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = (x * 2, y * 2);
                let mut sum = 0.0;
                let mut count = 0.0;
                for dy in 0..2 {
                    for dx in 0..2 {
                        let (px, py) = (sx + dx, sy + dy);
                        if px < self.width && py < self.height {
                            sum += self.data[py * self.width + px];
                            count += 1.0;
                        }
                    }
                }
                data[y * width + x] = sum / count;
            }
        }
        Self {
            data,
            width,
            height,
        }
    }

    fn sample(&self, x: f32, y: usize) -> f32 {
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let x0 = x.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let dx = x - x0 as f32;
        let row = y * self.width;
        self.data[row + x0] * (1.0 - dx) + self.data[row + x1] * dx
    }

    fn gradient_x(&self, x: f32, y: usize) -> f32 {
        0.5 * (self.sample(x + 1.0, y) - self.sample(x - 1.0, y))
    }
}

impl VariationalMatcher {
    pub(crate) fn new(tuning: Tuning) -> Self {
        Self { tuning }
    }

    pub fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap> {
        if left.dimensions() != right.dimensions() {
            return Err(Error::DimensionMismatch(format!(
                "left {:?} vs right {:?}",
                left.dimensions(),
                right.dimensions()
            )));
        }
        if left.width() < 8 || left.height() < 8 {
            return Err(Error::Configuration(
                "variational matching needs at least an 8x8 image".to_string(),
            ));
        }

        let min_d = self.tuning.min_disparity as f32;
        let nd = self.tuning.resolve_num_disparities(left.width());
        let max_d = min_d + nd as f32;

        // Image pyramids, coarsest last.
        let mut left_pyr = vec![FloatImage::from_gray(left)];
        let mut right_pyr = vec![FloatImage::from_gray(right)];
        for _ in 1..LEVELS {
            left_pyr.push(left_pyr[left_pyr.len() - 1].downsample());
            right_pyr.push(right_pyr[right_pyr.len() - 1].downsample());
        }

        let coarsest = &left_pyr[LEVELS - 1];
        let mut field = vec![0.0f32; coarsest.width * coarsest.height];

        for level in (0..LEVELS).rev() {
            let l = &left_pyr[level];
            let r = &right_pyr[level];
            let level_max = max_d / (1 << level) as f32;
            field = solve_level(l, r, field, min_d, level_max);
            if level > 0 {
                field = upsample_field(
                    &field,
                    l.width,
                    l.height,
                    left_pyr[level - 1].width,
                    left_pyr[level - 1].height,
                );
            }
        }

        let filtered = median3x3(
            &field,
            left.width() as usize,
            left.height() as usize,
        );

        let mut disparity = DisparityMap::new(left.width(), left.height(), min_d as i32, nd);
        for (dst, &d) in disparity.data.iter_mut().zip(filtered.iter()) {
            *dst = (d.clamp(min_d, max_d) * DISPARITY_SCALE as f32).round() as i16;
        }
        Ok(disparity)
    }
}

/// Damped Jacobi iterations at one pyramid level. Each update blends the
/// neighborhood average with a regularized Gauss-Newton step on the
/// photometric residual.
fn solve_level(
    left: &FloatImage,
    right: &FloatImage,
    init: Vec<f32>,
    min_d: f32,
    max_d: f32,
) -> Vec<f32> {
    let (width, height) = (left.width, left.height);
    let mut field = init;
    let mut next = vec![0.0f32; width * height];

    for _ in 0..ITERATIONS {
        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;
                let d = field[idx];

                let mut sum = 0.0;
                let mut count = 0.0;
                if x > 0 {
                    sum += field[idx - 1];
                    count += 1.0;
                }
                if x + 1 < width {
                    sum += field[idx + 1];
                    count += 1.0;
                }
                if y > 0 {
                    sum += field[idx - width];
                    count += 1.0;
                }
                if y + 1 < height {
                    sum += field[idx + width];
                    count += 1.0;
                }
                let smooth = if count > 0.0 { sum / count } else { d };

                let xr = x as f32 - d;
                let residual = left.data[idx] - right.sample(xr, y);
                let grad = right.gradient_x(xr, y);
                let step = (-residual * grad / (grad * grad + LAMBDA)).clamp(-1.0, 1.0);

                next[idx] = (smooth + step).clamp(min_d, max_d);
            }
        }
        std::mem::swap(&mut field, &mut next);
    }
    field
}

/// Bilinear upsampling of a disparity field to the next finer level;
/// values double along with the pixel coordinates.
fn upsample_field(
    field: &[f32],
    width: usize,
    height: usize,
    new_width: usize,
    new_height: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; new_width * new_height];
    for y in 0..new_height {
        for x in 0..new_width {
            let sx = (x as f32 * width as f32 / new_width as f32)
                .min((width - 1) as f32);
            let sy = (y as f32 * height as f32 / new_height as f32)
                .min((height - 1) as f32);
            let (x0, y0) = (sx.floor() as usize, sy.floor() as usize);
            let x1 = (x0 + 1).min(width - 1);
            let y1 = (y0 + 1).min(height - 1);
            let (dx, dy) = (sx - x0 as f32, sy - y0 as f32);
            let value = field[y0 * width + x0] * (1.0 - dx) * (1.0 - dy)
                + field[y0 * width + x1] * dx * (1.0 - dy)
                + field[y1 * width + x0] * (1.0 - dx) * dy
                + field[y1 * width + x1] * dx * dy;
            out[y * new_width + x] = value * 2.0;
        }
    }
    out
}

fn median3x3(field: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = field.to_vec();
    let mut window = [0.0f32; 9];
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let mut n = 0;
            for dy in 0..3 {
                for dx in 0..3 {
                    window[n] = field[(y + dy - 1) * width + (x + dx - 1)];
                    n += 1;
                }
            }
            window.sort_by(|a, b| a.total_cmp(b));
            out[y * width + x] = window[4];
        }
    }
    out
}
