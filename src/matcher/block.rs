//! Block-matching stereo
//!
//! Classic SAD window matching over x-Sobel prefiltered images, with
//! uniqueness rejection, left-right consistency and speckle filtering.
//! Works on single-channel input only.

use super::{
    box_sum, filter_speckles, left_right_consistency, prefilter_xsobel, subpixel_disparity,
    DisparityMap, Tuning, DISPARITY_SCALE, INVALID_DISPARITY,
};
use crate::{Error, Result};
use image::GrayImage;
use rayon::prelude::*;

pub struct BlockMatcher {
    tuning: Tuning,
}

impl BlockMatcher {
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
        let width = left.width() as usize;
        let height = left.height() as usize;
        let window = self.tuning.window as usize;
        if window >= width || window >= height {
            return Err(Error::Configuration(format!(
                "SAD window {window} does not fit a {width}x{height} image"
            )));
        }

        let min_d = self.tuning.min_disparity;
        let nd = self.tuning.resolve_num_disparities(left.width()) as usize;
        let half = window / 2;

        let left_pf = prefilter_xsobel(left.as_raw(), width, height, self.tuning.pre_filter_cap);
        let right_pf = prefilter_xsobel(right.as_raw(), width, height, self.tuning.pre_filter_cap);

        // One windowed SAD cost plane per disparity candidate.
        let planes: Vec<Vec<u32>> = (0..nd)
            .into_par_iter()
            .map(|d_idx| {
                let d = (min_d + d_idx as i32) as usize;
                let mut diff = vec![0u32; width * height];
                for y in 0..height {
                    for x in d..width {
                        let l = left_pf[y * width + x] as i32;
                        let r = right_pf[y * width + x - d] as i32;
                        diff[y * width + x] = (l - r).unsigned_abs();
                    }
                }
                let mut sums = box_sum(&diff, width, height, window);
                // Columns whose window reaches past the disparity shift
                // have no valid right-image support.
                let blocked = (d + half).min(width);
                for y in 0..height {
                    for x in 0..blocked {
                        sums[y * width + x] = u32::MAX;
                    }
                }
                sums
            })
            .collect();

        let mut disparity =
            DisparityMap::new(left.width(), left.height(), min_d, nd as i32);
        let uniqueness = self.tuning.uniqueness_ratio;

        disparity
            .data
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let idx = y * width + x;
                    row[x] = match winner_take_all(&planes, idx, uniqueness) {
                        Some((d_idx, best)) => {
                            let cp = neighbor_cost(&planes, d_idx.wrapping_sub(1), idx, best);
                            let cn = neighbor_cost(&planes, d_idx + 1, idx, best);
                            subpixel_disparity(cp, best, cn, min_d + d_idx as i32)
                        }
                        None => INVALID_DISPARITY,
                    };
                }
            });

        // Right-image disparities from the same cost volume: the cost of
        // right pixel xr at disparity d lives at left pixel xr + d.
        let mut right_raw = vec![INVALID_DISPARITY; width * height];
        right_raw
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for xr in 0..width {
                    let mut best = u32::MAX;
                    let mut best_d = -1i32;
                    for (d_idx, plane) in planes.iter().enumerate() {
                        let x = xr + (min_d + d_idx as i32) as usize;
                        if x >= width {
                            break;
                        }
                        let c = plane[y * width + x];
                        if c < best {
                            best = c;
                            best_d = min_d + d_idx as i32;
                        }
                    }
                    if best_d >= 0 {
                        row[xr] = (best_d * DISPARITY_SCALE as i32) as i16;
                    }
                }
            });

        left_right_consistency(&mut disparity, &right_raw, self.tuning.disp12_max_diff);
        filter_speckles(
            &mut disparity,
            self.tuning.speckle_window_size,
            self.tuning.speckle_range,
        );

        Ok(disparity)
    }
}

/// Minimum-cost disparity with uniqueness rejection: the winner is
/// discarded when another candidate more than one step away comes within
/// `ratio` percent of its cost.
fn winner_take_all(planes: &[Vec<u32>], idx: usize, ratio: i32) -> Option<(usize, u32)> {
    let mut best = u32::MAX;
    let mut best_d = usize::MAX;
    for (d_idx, plane) in planes.iter().enumerate() {
        let c = plane[idx];
        if c < best {
            best = c;
            best_d = d_idx;
        }
    }
    if best == u32::MAX {
        return None;
    }
    for (d_idx, plane) in planes.iter().enumerate() {
        let c = plane[idx];
        if c == u32::MAX || d_idx.abs_diff(best_d) <= 1 {
            continue;
        }
        if (c as u64) * 100 <= (best as u64) * (100 + ratio as u64) {
            return None;
        }
    }
    Some((best_d, best))
}

fn neighbor_cost(planes: &[Vec<u32>], d_idx: usize, idx: usize, fallback: u32) -> u32 {
    match planes.get(d_idx) {
        Some(plane) if plane[idx] != u32::MAX => plane[idx],
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{MatcherKind, MatcherParams};
    use image::Luma;

    fn shifted_pair(width: u32, height: u32, shift: u32) -> (GrayImage, GrayImage) {
        // Textured pattern with unique horizontal structure; the right
        // image sees the scene shifted left by `shift` pixels.
        let pattern = |x: u32, y: u32| ((x * 131 + y * 31) % 251) as u8;
        let mut left = GrayImage::new(width, height);
        let mut right = GrayImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                left.put_pixel(x, y, Luma([pattern(x, y)]));
                right.put_pixel(x, y, Luma([pattern(x + shift, y)]));
            }
        }
        (left, right)
    }

    fn matcher(params: &MatcherParams) -> BlockMatcher {
        BlockMatcher::new(super::super::Tuning::resolve(
            MatcherKind::BlockMatching,
            params,
        ))
    }

    #[test]
    fn test_known_shift_recovered() {
        let (left, right) = shifted_pair(128, 64, 6);
        let params = MatcherParams::new()
            .with_num_disparities(32)
            .with_sad_window_size(9)
            .with_speckle_filter(0, 0);
        let disparity = matcher(&params).compute(&left, &right).unwrap();

        assert_eq!(disparity.width, 128);
        assert_eq!(disparity.height, 64);

        let mut hits = 0;
        let mut total = 0;
        for y in 10..54 {
            for x in 48..110 {
                let d = disparity.get(x, y);
                if d >= 0 {
                    total += 1;
                    if (d as i32 - 6 * 16).abs() <= 16 {
                        hits += 1;
                    }
                }
            }
        }
        assert!(total > 500, "expected mostly valid pixels, got {total}");
        assert!(
            hits as f64 >= total as f64 * 0.9,
            "only {hits}/{total} pixels near expected disparity"
        );
    }

    #[test]
    fn test_window_must_fit_image() {
        let (left, right) = shifted_pair(16, 16, 2);
        let params = MatcherParams::new()
            .with_num_disparities(16)
            .with_sad_window_size(21);
        assert!(matcher(&params).compute(&left, &right).is_err());
    }

    #[test]
    fn test_output_is_deterministic() {
        let (left, right) = shifted_pair(96, 48, 4);
        let params = MatcherParams::new().with_num_disparities(16);
        let m = matcher(&params);
        let a = m.compute(&left, &right).unwrap();
        let b = m.compute(&left, &right).unwrap();
        assert_eq!(a.data, b.data);
    }
}
