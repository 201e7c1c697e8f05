//! Dense stereo matching
//!
//! Computes a fixed-point disparity map from a rectified stereo pair
//! using one of the selectable matching algorithms. The algorithm variant
//! is a closed enum configured once up front; switching variants replaces
//! the owned matcher state transactionally.

use crate::{Error, Result};
use image::{DynamicImage, GrayImage};

pub mod block;
pub mod sgbm;
pub mod variational;

pub use block::BlockMatcher;
pub use sgbm::SgbmMatcher;
pub use variational::VariationalMatcher;

/// Raw disparity values are fixed-point, scaled by this factor.
pub const DISPARITY_SCALE: i16 = 16;

/// Marker for pixels with no reliable match (disparity -1 in fixed point).
pub const INVALID_DISPARITY: i16 = -16;

/// Single-channel disparity map, same size as the rectified inputs.
/// Values encode horizontal pixel displacement times [`DISPARITY_SCALE`].
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityMap {
    pub data: Vec<i16>,
    pub width: u32,
    pub height: u32,
    pub min_disparity: i32,
    pub num_disparities: i32,
}

impl DisparityMap {
    pub fn new(width: u32, height: u32, min_disparity: i32, num_disparities: i32) -> Self {
        Self {
            data: vec![INVALID_DISPARITY; (width * height) as usize],
            width,
            height,
            min_disparity,
            num_disparities,
        }
    }

    pub fn get(&self, x: u32, y: u32) -> i16 {
        if x >= self.width || y >= self.height {
            return INVALID_DISPARITY;
        }
        self.data[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: i16) {
        if x < self.width && y < self.height {
            self.data[(y * self.width + x) as usize] = value;
        }
    }

    /// 8-bit depth visualization: disparity linearly scaled by
    /// `255 / (num_disparities * 16)`, invalid pixels black.
    pub fn to_depth_image(&self) -> GrayImage {
        let scale = 255.0 / (self.num_disparities as f32 * DISPARITY_SCALE as f32);
        let mut img = GrayImage::new(self.width, self.height);
        for (dst, &d) in img.iter_mut().zip(self.data.iter()) {
            *dst = if d < 0 {
                0
            } else {
                (d as f32 * scale).round().clamp(0.0, 255.0) as u8
            };
        }
        img
    }

    /// 8-bit visualization scaled by the map's own value range. Used for
    /// the variational matcher, whose output is not bounded by the
    /// configured disparity count.
    pub fn to_depth_image_normalized(&self) -> GrayImage {
        let mut min_val = i16::MAX;
        let mut max_val = i16::MIN;
        for &d in &self.data {
            if d >= 0 {
                min_val = min_val.min(d);
                max_val = max_val.max(d);
            }
        }
        let range = if max_val > min_val {
            (max_val - min_val) as f32
        } else {
            1.0
        };

        let mut img = GrayImage::new(self.width, self.height);
        for (dst, &d) in img.iter_mut().zip(self.data.iter()) {
            *dst = if d < 0 {
                0
            } else {
                (((d - min_val) as f32 / range) * 255.0).round() as u8
            };
        }
        img
    }
}

/// Dense-matching algorithm variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    BlockMatching,
    SemiGlobalBlockMatching,
    SemiGlobalBlockMatchingFullDp,
    Variational,
}

impl MatcherKind {
    /// Parse the conventional mode names `BM`, `SGBM`, `HH` and `VAR`.
    /// `HH` selects semi-global matching with full dynamic programming.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "BM" => Ok(MatcherKind::BlockMatching),
            "SGBM" => Ok(MatcherKind::SemiGlobalBlockMatching),
            "HH" => Ok(MatcherKind::SemiGlobalBlockMatchingFullDp),
            "VAR" => Ok(MatcherKind::Variational),
            other => Err(Error::Configuration(format!(
                "unknown matching algorithm '{other}', expected BM, SGBM, HH or VAR"
            ))),
        }
    }

    /// Whether the algorithm only accepts single-channel input.
    pub fn requires_grayscale(&self) -> bool {
        matches!(
            self,
            MatcherKind::BlockMatching | MatcherKind::Variational
        )
    }
}

/// Numeric tuning parameters. All optional fields default per algorithm,
/// see [`MatcherKind`] and `DisparityEngine::configure`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatcherParams {
    pub min_disparity: i32,
    /// Unset derives `((width / 8) + 15) & !15` from the image width.
    pub num_disparities: Option<i32>,
    /// Unset defaults to 9 for block matching, 3 for semi-global.
    pub sad_window_size: Option<i32>,
    /// Unset derives `8 * channels * window^2` for semi-global matching.
    pub p1: Option<i32>,
    /// Unset derives `32 * channels * window^2` for semi-global matching.
    pub p2: Option<i32>,
    pub disp12_max_diff: i32,
    /// Unset defaults to 31 for block matching, 63 for semi-global.
    pub pre_filter_cap: Option<i32>,
    /// Unset defaults to 15 for block matching, 10 for semi-global.
    pub uniqueness_ratio: Option<i32>,
    pub speckle_window_size: i32,
    pub speckle_range: i32,
    pub full_dp: bool,
}

impl Default for MatcherParams {
    fn default() -> Self {
        Self {
            min_disparity: 0,
            num_disparities: None,
            sad_window_size: None,
            p1: None,
            p2: None,
            disp12_max_diff: 1,
            pre_filter_cap: None,
            uniqueness_ratio: None,
            speckle_window_size: 100,
            speckle_range: 32,
            full_dp: false,
        }
    }
}

impl MatcherParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_disparity(mut self, value: i32) -> Self {
        self.min_disparity = value;
        self
    }

    pub fn with_num_disparities(mut self, value: i32) -> Self {
        self.num_disparities = Some(value);
        self
    }

    pub fn with_sad_window_size(mut self, value: i32) -> Self {
        self.sad_window_size = Some(value);
        self
    }

    pub fn with_penalties(mut self, p1: i32, p2: i32) -> Self {
        self.p1 = Some(p1);
        self.p2 = Some(p2);
        self
    }

    pub fn with_disp12_max_diff(mut self, value: i32) -> Self {
        self.disp12_max_diff = value;
        self
    }

    pub fn with_pre_filter_cap(mut self, value: i32) -> Self {
        self.pre_filter_cap = Some(value);
        self
    }

    pub fn with_uniqueness_ratio(mut self, value: i32) -> Self {
        self.uniqueness_ratio = Some(value);
        self
    }

    pub fn with_speckle_filter(mut self, window_size: i32, range: i32) -> Self {
        self.speckle_window_size = window_size;
        self.speckle_range = range;
        self
    }

    pub fn with_full_dp(mut self, value: bool) -> Self {
        self.full_dp = value;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.min_disparity < 0 {
            return Err(Error::Configuration(
                "min_disparity must be non-negative".to_string(),
            ));
        }
        if let Some(n) = self.num_disparities {
            if n <= 0 || n % 16 != 0 {
                return Err(Error::Configuration(format!(
                    "num_disparities must be a positive multiple of 16, got {n}"
                )));
            }
        }
        if let Some(w) = self.sad_window_size {
            if w < 1 || w % 2 == 0 {
                return Err(Error::Configuration(format!(
                    "sad_window_size must be odd and positive, got {w}"
                )));
            }
        }
        if let Some(cap) = self.pre_filter_cap {
            if !(1..=63).contains(&cap) {
                return Err(Error::Configuration(format!(
                    "pre_filter_cap must be in 1..=63, got {cap}"
                )));
            }
        }
        if let Some(u) = self.uniqueness_ratio {
            if u < 0 {
                return Err(Error::Configuration(
                    "uniqueness_ratio must be non-negative".to_string(),
                ));
            }
        }
        if let (Some(p1), Some(p2)) = (self.p1, self.p2) {
            if p1 <= 0 || p2 <= p1 {
                return Err(Error::Configuration(format!(
                    "smoothness penalties require 0 < P1 < P2, got P1={p1} P2={p2}"
                )));
            }
        }
        if self.speckle_range < 0 {
            return Err(Error::Configuration(
                "speckle_range must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Disparity count derived from the image width when `num_disparities`
/// is unset: rounds `width / 8` up to a multiple of 16, never below 16
/// so the count stays positive for very narrow images.
pub fn derived_num_disparities(width: u32) -> i32 {
    (((width as i32 / 8) + 15) & !15).max(16)
}

/// Parameters resolved against per-algorithm defaults at configure time.
/// Width- and channel-dependent values stay deferred to compute time.
#[derive(Debug, Clone)]
pub(crate) struct Tuning {
    pub min_disparity: i32,
    pub num_disparities: Option<i32>,
    pub window: i32,
    pub p1: Option<i32>,
    pub p2: Option<i32>,
    pub disp12_max_diff: i32,
    pub pre_filter_cap: i32,
    pub uniqueness_ratio: i32,
    pub speckle_window_size: i32,
    pub speckle_range: i32,
}

impl Tuning {
    fn resolve(kind: MatcherKind, params: &MatcherParams) -> Self {
        let block = kind == MatcherKind::BlockMatching;
        Self {
            min_disparity: params.min_disparity,
            num_disparities: params.num_disparities,
            window: params.sad_window_size.unwrap_or(if block { 9 } else { 3 }),
            p1: params.p1,
            p2: params.p2,
            disp12_max_diff: params.disp12_max_diff,
            pre_filter_cap: params.pre_filter_cap.unwrap_or(if block { 31 } else { 63 }),
            uniqueness_ratio: params.uniqueness_ratio.unwrap_or(if block { 15 } else { 10 }),
            speckle_window_size: params.speckle_window_size,
            speckle_range: params.speckle_range,
        }
    }

    pub(crate) fn resolve_num_disparities(&self, width: u32) -> i32 {
        self.num_disparities
            .unwrap_or_else(|| derived_num_disparities(width))
    }
}

/// Planar image view used by the semi-global matcher: one or three
/// channels of row-major bytes.
pub(crate) struct ImagePlanes {
    pub channels: Vec<Vec<u8>>,
    pub width: u32,
    pub height: u32,
}

impl ImagePlanes {
    pub(crate) fn from_dynamic(img: &DynamicImage) -> Self {
        match img {
            DynamicImage::ImageLuma8(gray) => Self {
                channels: vec![gray.as_raw().clone()],
                width: gray.width(),
                height: gray.height(),
            },
            other => {
                let rgb = other.to_rgb8();
                let (width, height) = (rgb.width(), rgb.height());
                let n = (width * height) as usize;
                let mut channels = vec![Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n)];
                for px in rgb.pixels() {
                    channels[0].push(px[0]);
                    channels[1].push(px[1]);
                    channels[2].push(px[2]);
                }
                Self {
                    channels,
                    width,
                    height,
                }
            }
        }
    }
}

enum MatcherState {
    Block(BlockMatcher),
    SemiGlobal(SgbmMatcher),
    Variational(VariationalMatcher),
}

/// Owns the configured matching algorithm and its working state.
///
/// An instance is reused across frames; reconfiguring drops the previous
/// algorithm's state entirely before the new one is installed.
pub struct DisparityEngine {
    kind: Option<MatcherKind>,
    state: Option<MatcherState>,
}

impl DisparityEngine {
    pub fn new() -> Self {
        Self {
            kind: None,
            state: None,
        }
    }

    pub fn kind(&self) -> Option<MatcherKind> {
        self.kind
    }

    /// Select an algorithm variant and validate its parameters once.
    /// On error the previous configuration stays in place.
    pub fn configure(&mut self, kind: MatcherKind, params: &MatcherParams) -> Result<()> {
        params.validate()?;
        let tuning = Tuning::resolve(kind, params);
        let state = match kind {
            MatcherKind::BlockMatching => MatcherState::Block(BlockMatcher::new(tuning)),
            MatcherKind::SemiGlobalBlockMatching => {
                MatcherState::SemiGlobal(SgbmMatcher::new(tuning, params.full_dp))
            }
            MatcherKind::SemiGlobalBlockMatchingFullDp => {
                MatcherState::SemiGlobal(SgbmMatcher::new(tuning, true))
            }
            MatcherKind::Variational => {
                MatcherState::Variational(VariationalMatcher::new(tuning))
            }
        };
        self.kind = Some(kind);
        self.state = Some(state);
        Ok(())
    }

    /// Compute a disparity map from a rectified pair. Both images must
    /// share dimensions; block matching additionally requires grayscale
    /// input (the pipeline converts before calling).
    pub fn compute(&self, left: &DynamicImage, right: &DynamicImage) -> Result<DisparityMap> {
        use image::GenericImageView;

        let state = self.state.as_ref().ok_or_else(|| {
            Error::Configuration("disparity engine is not configured".to_string())
        })?;
        if left.dimensions() != right.dimensions() {
            return Err(Error::DimensionMismatch(format!(
                "left {:?} vs right {:?}",
                left.dimensions(),
                right.dimensions()
            )));
        }

        match state {
            MatcherState::Block(m) => match (left, right) {
                (DynamicImage::ImageLuma8(l), DynamicImage::ImageLuma8(r)) => m.compute(l, r),
                _ => Err(Error::Configuration(
                    "block matching requires single-channel input".to_string(),
                )),
            },
            MatcherState::SemiGlobal(m) => m.compute(
                &ImagePlanes::from_dynamic(left),
                &ImagePlanes::from_dynamic(right),
            ),
            MatcherState::Variational(m) => m.compute(&left.to_luma8(), &right.to_luma8()),
        }
    }
}

impl Default for DisparityEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Horizontal Sobel response clamped to `[-cap, cap]` and shifted by
/// `cap`, the texture pre-filter of the block-matching family.
pub(crate) fn prefilter_xsobel(data: &[u8], width: usize, height: usize, cap: i32) -> Vec<u8> {
    let mut out = vec![cap as u8; width * height];
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let at = |dx: i32, dy: i32| -> i32 {
                data[(y as i32 + dy) as usize * width + (x as i32 + dx) as usize] as i32
            };
            let dx = (at(1, -1) - at(-1, -1)) + 2 * (at(1, 0) - at(-1, 0)) + (at(1, 1) - at(-1, 1));
            out[y * width + x] = (dx.clamp(-cap, cap) + cap) as u8;
        }
    }
    out
}

/// Windowed sums of a cost plane via an integral image. Border pixels
/// where the window does not fit keep `u32::MAX` (invalid).
pub(crate) fn box_sum(plane: &[u32], width: usize, height: usize, win: usize) -> Vec<u32> {
    let half = win / 2;
    let mut integral = vec![0u64; (width + 1) * (height + 1)];
    for y in 0..height {
        let mut row_sum = 0u64;
        for x in 0..width {
            row_sum += plane[y * width + x] as u64;
            integral[(y + 1) * (width + 1) + x + 1] = integral[y * (width + 1) + x + 1] + row_sum;
        }
    }

    let mut out = vec![u32::MAX; width * height];
    if height <= 2 * half || width <= 2 * half {
        return out;
    }
    for y in half..height - half {
        let (y0, y1) = (y - half, y + half + 1);
        for x in half..width - half {
            let (x0, x1) = (x - half, x + half + 1);
            let sum = integral[y1 * (width + 1) + x1] + integral[y0 * (width + 1) + x0]
                - integral[y0 * (width + 1) + x1]
                - integral[y1 * (width + 1) + x0];
            out[y * width + x] = sum as u32;
        }
    }
    out
}

/// Parabolic sub-pixel refinement around the winning disparity, emitted
/// in ×16 fixed point.
pub(crate) fn subpixel_disparity(c_prev: u32, c_best: u32, c_next: u32, disparity: i32) -> i16 {
    let denom = c_prev as f32 + c_next as f32 - 2.0 * c_best as f32;
    let delta = if denom > 0.0 {
        ((c_prev as f32 - c_next as f32) / (2.0 * denom)).clamp(-0.5, 0.5)
    } else {
        0.0
    };
    ((disparity as f32 + delta) * DISPARITY_SCALE as f32).round() as i16
}

/// Invalidate left-map pixels whose right-map counterpart disagrees by
/// more than `max_diff` integer disparities. Negative `max_diff` disables
/// the check.
pub(crate) fn left_right_consistency(left: &mut DisparityMap, right_raw: &[i16], max_diff: i32) {
    if max_diff < 0 {
        return;
    }
    let width = left.width as i32;
    for y in 0..left.height {
        for x in 0..left.width {
            let d = left.get(x, y);
            if d < 0 {
                continue;
            }
            let dl = (d as i32 + DISPARITY_SCALE as i32 / 2) / DISPARITY_SCALE as i32;
            let xr = x as i32 - dl;
            if xr < 0 || xr >= width {
                left.set(x, y, INVALID_DISPARITY);
                continue;
            }
            let dr_raw = right_raw[(y as i32 * width + xr) as usize];
            if dr_raw < 0 {
                continue;
            }
            let dr = (dr_raw as i32 + DISPARITY_SCALE as i32 / 2) / DISPARITY_SCALE as i32;
            if (dl - dr).abs() > max_diff {
                left.set(x, y, INVALID_DISPARITY);
            }
        }
    }
}

/// Remove small connected regions of similar disparity ("speckles").
/// `range` is in integer disparity units; regions smaller than
/// `max_region` pixels are invalidated. Disabled when `max_region <= 0`.
pub(crate) fn filter_speckles(map: &mut DisparityMap, max_region: i32, range: i32) {
    if max_region <= 0 {
        return;
    }
    let width = map.width as usize;
    let height = map.height as usize;
    let diff_fixed = (range * DISPARITY_SCALE as i32) as i32;

    let mut label = vec![0u32; width * height];
    let mut next_label = 0u32;
    let mut stack = Vec::new();
    let mut component = Vec::new();

    for start in 0..width * height {
        if label[start] != 0 || map.data[start] < 0 {
            continue;
        }
        next_label += 1;
        stack.push(start);
        label[start] = next_label;
        component.clear();

        while let Some(idx) = stack.pop() {
            component.push(idx);
            let (x, y) = (idx % width, idx / width);
            let value = map.data[idx] as i32;

            let mut visit = |nx: usize, ny: usize, stack: &mut Vec<usize>| {
                let nidx = ny * width + nx;
                if label[nidx] == 0
                    && map.data[nidx] >= 0
                    && (map.data[nidx] as i32 - value).abs() <= diff_fixed
                {
                    label[nidx] = next_label;
                    stack.push(nidx);
                }
            };
            if x > 0 {
                visit(x - 1, y, &mut stack);
            }
            if x + 1 < width {
                visit(x + 1, y, &mut stack);
            }
            if y > 0 {
                visit(x, y - 1, &mut stack);
            }
            if y + 1 < height {
                visit(x, y + 1, &mut stack);
            }
        }

        if (component.len() as i32) < max_region {
            for &idx in &component {
                map.data[idx] = INVALID_DISPARITY;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_num_disparities_is_multiple_of_16() {
        for width in [3u32, 7, 64, 320, 640, 1280, 1000, 17] {
            let n = derived_num_disparities(width);
            assert!(n > 0, "width {width} derived {n}");
            assert_eq!(n % 16, 0, "width {width} derived {n}");
        }
        assert_eq!(derived_num_disparities(1280), 160);
        assert_eq!(derived_num_disparities(640), 80);
        // Narrower than 8 px still derives a positive count.
        assert_eq!(derived_num_disparities(7), 16);
    }

    #[test]
    fn test_params_validation() {
        let bad_nd = MatcherParams::new().with_num_disparities(50);
        assert!(bad_nd.validate().is_err());

        let bad_window = MatcherParams::new().with_sad_window_size(8);
        assert!(bad_window.validate().is_err());

        let bad_penalties = MatcherParams::new().with_penalties(100, 50);
        assert!(bad_penalties.validate().is_err());

        let bad_cap = MatcherParams::new().with_pre_filter_cap(64);
        assert!(bad_cap.validate().is_err());

        assert!(MatcherParams::new().validate().is_ok());
    }

    #[test]
    fn test_per_algorithm_defaults() {
        let params = MatcherParams::default();
        let bm = Tuning::resolve(MatcherKind::BlockMatching, &params);
        assert_eq!(bm.window, 9);
        assert_eq!(bm.pre_filter_cap, 31);
        assert_eq!(bm.uniqueness_ratio, 15);

        let sgbm = Tuning::resolve(MatcherKind::SemiGlobalBlockMatching, &params);
        assert_eq!(sgbm.window, 3);
        assert_eq!(sgbm.pre_filter_cap, 63);
        assert_eq!(sgbm.uniqueness_ratio, 10);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(MatcherKind::parse("BM").unwrap(), MatcherKind::BlockMatching);
        assert_eq!(
            MatcherKind::parse("HH").unwrap(),
            MatcherKind::SemiGlobalBlockMatchingFullDp
        );
        assert_eq!(MatcherKind::parse("VAR").unwrap(), MatcherKind::Variational);
        assert!(MatcherKind::parse("GC").is_err());
    }

    #[test]
    fn test_engine_requires_configuration() {
        let engine = DisparityEngine::new();
        let img = DynamicImage::ImageLuma8(GrayImage::new(32, 32));
        assert!(matches!(
            engine.compute(&img, &img),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_engine_rejects_mismatched_dimensions() {
        let mut engine = DisparityEngine::new();
        engine
            .configure(MatcherKind::BlockMatching, &MatcherParams::default())
            .unwrap();
        let a = DynamicImage::ImageLuma8(GrayImage::new(32, 32));
        let b = DynamicImage::ImageLuma8(GrayImage::new(64, 32));
        assert!(matches!(
            engine.compute(&a, &b),
            Err(Error::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_semi_global_handles_narrow_images() {
        // Width below 8 px derives the minimum disparity count; the
        // frame still yields a map rather than failing.
        let mut engine = DisparityEngine::new();
        engine
            .configure(MatcherKind::SemiGlobalBlockMatching, &MatcherParams::default())
            .unwrap();
        let img = DynamicImage::ImageLuma8(GrayImage::new(7, 16));
        let disparity = engine.compute(&img, &img).unwrap();
        assert_eq!(disparity.num_disparities, 16);
        assert_eq!((disparity.width, disparity.height), (7, 16));
    }

    #[test]
    fn test_out_of_range_accessors_do_not_wrap() {
        let mut map = DisparityMap::new(4, 4, 0, 16);
        map.set(0, 1, 80);
        assert_eq!(map.get(4, 0), INVALID_DISPARITY);
        assert_eq!(map.get(0, 4), INVALID_DISPARITY);
        // An out-of-range write must not alias (0, 1).
        map.set(4, 0, 99);
        assert_eq!(map.get(0, 1), 80);
    }

    #[test]
    fn test_block_matching_rejects_color_input() {
        let mut engine = DisparityEngine::new();
        engine
            .configure(MatcherKind::BlockMatching, &MatcherParams::default())
            .unwrap();
        let color = DynamicImage::ImageRgb8(image::RgbImage::new(32, 32));
        assert!(matches!(
            engine.compute(&color, &color),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_box_sum_inner_window() {
        // 5x5 plane of ones, 3x3 window: inner sums are 9.
        let plane = vec![1u32; 25];
        let sums = box_sum(&plane, 5, 5, 3);
        assert_eq!(sums[2 * 5 + 2], 9);
        assert_eq!(sums[0], u32::MAX);
    }

    #[test]
    fn test_subpixel_refinement_stays_within_half_pixel() {
        let d = subpixel_disparity(10, 2, 6, 5);
        assert!(d >= 5 * 16 - 8 && d <= 5 * 16 + 8);
        // Symmetric neighbors leave the integer winner untouched.
        assert_eq!(subpixel_disparity(8, 2, 8, 5), 80);
    }

    #[test]
    fn test_speckle_filter_removes_small_regions() {
        let mut map = DisparityMap::new(8, 8, 0, 16);
        // One large flat region plus one isolated outlier.
        for y in 0..8 {
            for x in 0..8 {
                map.set(x, y, 64);
            }
        }
        map.set(4, 4, 240);
        filter_speckles(&mut map, 10, 2);
        assert_eq!(map.get(4, 4), INVALID_DISPARITY);
        assert_eq!(map.get(0, 0), 64);
    }

    #[test]
    fn test_normalized_depth_image_spans_value_range() {
        let mut map = DisparityMap::new(3, 1, 0, 16);
        map.set(0, 0, 32);
        map.set(1, 0, 96);
        map.set(2, 0, INVALID_DISPARITY);
        let img = map.to_depth_image_normalized();
        assert_eq!(img.get_pixel(0, 0)[0], 0);
        assert_eq!(img.get_pixel(1, 0)[0], 255);
        assert_eq!(img.get_pixel(2, 0)[0], 0);

        // All-invalid maps normalize to black.
        let empty = DisparityMap::new(3, 1, 0, 16);
        assert!(empty.to_depth_image_normalized().pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_depth_image_scaling() {
        let mut map = DisparityMap::new(4, 1, 0, 64);
        map.set(0, 0, 64 * 16); // full range
        map.set(1, 0, 32 * 16); // half range
        map.set(2, 0, INVALID_DISPARITY);
        let img = map.to_depth_image();
        assert_eq!(img.get_pixel(0, 0)[0], 255);
        assert_eq!(img.get_pixel(1, 0)[0], 128);
        assert_eq!(img.get_pixel(2, 0)[0], 0);
    }
}
