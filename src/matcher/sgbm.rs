//! Semi-global block matching
//!
//! Birchfield-Tomasi window costs on prefiltered channels, aggregated
//! along multiple scanline directions with P1/P2 smoothness penalties.
//! The default mode aggregates 5 paths; full dynamic-programming mode
//! (the `HH` variant) aggregates all 8.

use super::{
    box_sum, filter_speckles, left_right_consistency, prefilter_xsobel, subpixel_disparity,
    DisparityMap, ImagePlanes, Tuning, DISPARITY_SCALE, INVALID_DISPARITY,
};
use crate::{Error, Result};
use rayon::prelude::*;

/// Cost assigned where no valid match exists; bounded so path sums never
/// overflow.
const HIGH_COST: u32 = 1 << 20;

const PATHS_DEFAULT: [(i32, i32); 5] = [(1, 0), (-1, 0), (0, 1), (1, 1), (-1, 1)];
const PATHS_FULL: [(i32, i32); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (-1, 1),
    (1, -1),
    (-1, -1),
];

pub struct SgbmMatcher {
    tuning: Tuning,
    full_dp: bool,
}

impl SgbmMatcher {
    pub(crate) fn new(tuning: Tuning, full_dp: bool) -> Self {
        Self { tuning, full_dp }
    }

    pub(crate) fn compute(
        &self,
        left: &ImagePlanes,
        right: &ImagePlanes,
    ) -> Result<DisparityMap> {
        if left.channels.len() != right.channels.len() {
            return Err(Error::Configuration(
                "left and right images must have the same channel count".to_string(),
            ));
        }
        let width = left.width as usize;
        let height = left.height as usize;
        let window = self.tuning.window as usize;
        if window >= width || window >= height {
            return Err(Error::Configuration(format!(
                "SAD window {window} does not fit a {width}x{height} image"
            )));
        }

        let channels = left.channels.len() as i32;
        let win_sq = (window * window) as i32;
        let p1 = self.tuning.p1.unwrap_or(8 * channels * win_sq) as u32;
        let p2 = self.tuning.p2.unwrap_or(32 * channels * win_sq) as u32;
        if p2 <= p1 {
            return Err(Error::Configuration(format!(
                "smoothness penalties require P1 < P2, got P1={p1} P2={p2}"
            )));
        }

        let min_d = self.tuning.min_disparity;
        let nd = self.tuning.resolve_num_disparities(left.width) as usize;
        let half = window / 2;

        let left_pf: Vec<Vec<u8>> = left
            .channels
            .iter()
            .map(|c| prefilter_xsobel(c, width, height, self.tuning.pre_filter_cap))
            .collect();
        let right_pf: Vec<Vec<u8>> = right
            .channels
            .iter()
            .map(|c| prefilter_xsobel(c, width, height, self.tuning.pre_filter_cap))
            .collect();

        // Windowed BT cost planes, one per disparity candidate.
        let planes: Vec<Vec<u32>> = (0..nd)
            .into_par_iter()
            .map(|d_idx| {
                let d = (min_d + d_idx as i32) as usize;
                let mut diff = vec![0u32; width * height];
                for (lc, rc) in left_pf.iter().zip(right_pf.iter()) {
                    for y in 0..height {
                        let row = y * width;
                        for x in d..width {
                            diff[row + x] += bt_cost(&lc[row..row + width], &rc[row..row + width], x, x - d);
                        }
                    }
                }
                let mut sums = box_sum(&diff, width, height, window);
                let blocked = (d + half).min(width);
                for y in 0..height {
                    for x in 0..blocked {
                        sums[y * width + x] = u32::MAX;
                    }
                }
                sums
            })
            .collect();

        // Pixel-major cost volume for cache-friendly path aggregation.
        let mut cost = vec![0u32; width * height * nd];
        cost.par_chunks_mut(nd).enumerate().for_each(|(pix, cell)| {
            for (d_idx, plane) in planes.iter().enumerate() {
                cell[d_idx] = plane[pix].min(HIGH_COST);
            }
        });
        drop(planes);

        let paths: &[(i32, i32)] = if self.full_dp {
            &PATHS_FULL
        } else {
            &PATHS_DEFAULT
        };
        let mut aggregated = vec![0u32; width * height * nd];
        for &(dx, dy) in paths {
            aggregate_direction(&cost, width, height, nd, dx, dy, p1, p2, &mut aggregated);
        }
        drop(cost);

        let mut disparity = DisparityMap::new(left.width, left.height, min_d, nd as i32);
        let uniqueness = self.tuning.uniqueness_ratio;

        disparity
            .data
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let cell = &aggregated[(y * width + x) * nd..(y * width + x + 1) * nd];
                    row[x] = match winner_take_all(cell, uniqueness) {
                        Some(d_idx) => {
                            let best = cell[d_idx];
                            let cp = if d_idx > 0 { cell[d_idx - 1] } else { best };
                            let cn = if d_idx + 1 < nd { cell[d_idx + 1] } else { best };
                            subpixel_disparity(cp, best, cn, min_d + d_idx as i32)
                        }
                        None => INVALID_DISPARITY,
                    };
                }
            });

        let mut right_raw = vec![INVALID_DISPARITY; width * height];
        right_raw
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for xr in 0..width {
                    let mut best = u32::MAX;
                    let mut best_d = -1i32;
                    for d_idx in 0..nd {
                        let d = min_d + d_idx as i32;
                        let x = xr + d as usize;
                        if x >= width {
                            break;
                        }
                        let c = aggregated[(y * width + x) * nd + d_idx];
                        if c < best {
                            best = c;
                            best_d = d;
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

/// Birchfield-Tomasi dissimilarity between a left pixel and a right
/// pixel, sampling the right scanline at half-pixel offsets.
fn bt_cost(left_row: &[u8], right_row: &[u8], xl: usize, xr: usize) -> u32 {
    let l = left_row[xl] as i32;
    let r = right_row[xr] as i32;
    let r_minus = if xr > 0 {
        (right_row[xr - 1] as i32 + r) / 2
    } else {
        r
    };
    let r_plus = if xr + 1 < right_row.len() {
        (right_row[xr + 1] as i32 + r) / 2
    } else {
        r
    };
    let direct = (l - r).abs();
    let interp = (l - r_minus).abs().min((l - r_plus).abs());
    direct.min(interp) as u32
}

/// One directional pass of the semi-global recurrence
/// `L(p,d) = C(p,d) + min(L(q,d), L(q,d±1)+P1, min_d' L(q,d')+P2) - min_d' L(q,d')`
/// where q is the predecessor along `(dx, dy)`; accumulates L into `s`.
#[allow(clippy::too_many_arguments)]
fn aggregate_direction(
    cost: &[u32],
    width: usize,
    height: usize,
    nd: usize,
    dx: i32,
    dy: i32,
    p1: u32,
    p2: u32,
    s: &mut [u32],
) {
    let rows: Vec<usize> = if dy >= 0 {
        (0..height).collect()
    } else {
        (0..height).rev().collect()
    };
    let cols: Vec<usize> = if dx >= 0 {
        (0..width).collect()
    } else {
        (0..width).rev().collect()
    };

    let mut prev_row = vec![0u32; width * nd];
    let mut prev_row_valid = vec![false; width];
    let mut cur_row = vec![0u32; width * nd];
    let mut cur_row_valid = vec![false; width];
    let mut l_buf = vec![0u32; nd];
    let mut prev_l = vec![0u32; nd];

    for &y in &rows {
        let mut prev_l_valid = false;
        for &x in &cols {
            let base = (y * width + x) * nd;
            let cell = &cost[base..base + nd];

            let pred: Option<&[u32]> = if dy == 0 {
                if prev_l_valid {
                    Some(&prev_l)
                } else {
                    None
                }
            } else {
                let px = x as i32 - dx;
                if px >= 0 && px < width as i32 && prev_row_valid[px as usize] {
                    let p = px as usize;
                    Some(&prev_row[p * nd..(p + 1) * nd])
                } else {
                    None
                }
            };

            match pred {
                None => l_buf.copy_from_slice(cell),
                Some(lp) => {
                    let minp = lp.iter().copied().min().unwrap_or(0);
                    for d in 0..nd {
                        let mut best = lp[d];
                        if d > 0 {
                            best = best.min(lp[d - 1] + p1);
                        }
                        if d + 1 < nd {
                            best = best.min(lp[d + 1] + p1);
                        }
                        best = best.min(minp + p2);
                        l_buf[d] = cell[d] + best - minp;
                    }
                }
            }

            for d in 0..nd {
                s[base + d] += l_buf[d];
            }
            if dy == 0 {
                prev_l.copy_from_slice(&l_buf);
                prev_l_valid = true;
            } else {
                cur_row[x * nd..(x + 1) * nd].copy_from_slice(&l_buf);
                cur_row_valid[x] = true;
            }
        }
        if dy != 0 {
            std::mem::swap(&mut prev_row, &mut cur_row);
            std::mem::swap(&mut prev_row_valid, &mut cur_row_valid);
            cur_row_valid.iter_mut().for_each(|v| *v = false);
        }
    }
}

fn winner_take_all(cell: &[u32], ratio: i32) -> Option<usize> {
    let mut best = u32::MAX;
    let mut best_d = usize::MAX;
    for (d_idx, &c) in cell.iter().enumerate() {
        if c < best {
            best = c;
            best_d = d_idx;
        }
    }
    if best_d == usize::MAX || best >= HIGH_COST {
        return None;
    }
    for (d_idx, &c) in cell.iter().enumerate() {
        if d_idx.abs_diff(best_d) <= 1 {
            continue;
        }
        if (c as u64) * 100 <= (best as u64) * (100 + ratio as u64) {
            return None;
        }
    }
    Some(best_d)
}
