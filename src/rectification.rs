//! Stereo rectification
//!
//! Computes the row-aligning rotations R1/R2 and rectified projections
//! P1/P2 for a calibrated stereo rig, derives undistort+rectify remap
//! tables from them, and applies the tables to raw images. Transforms and
//! tables are cached per calibration/size combination so steady-state
//! frames skip all matrix algebra and go straight to the remap.

use crate::calibration::{CalibrationModel, RectificationSource, StereoExtrinsics};
use crate::reproject::derive_q;
use crate::{Error, Result};
use image::{DynamicImage, GrayImage, RgbImage};
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Rotation3, Vector3};
use rayon::prelude::*;

/// Rectification transforms for a stereo pair: per-camera row-aligning
/// rotation and rectified projection, plus the shared disparity-to-depth
/// matrix Q.
#[derive(Debug, Clone, PartialEq)]
pub struct RectificationTransforms {
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    pub p2: Matrix3x4<f64>,
    pub q: Matrix4<f64>,
}

/// Per-camera lookup table mapping output pixel coordinates to input
/// sample coordinates. Valid only for the image size it was built for.
#[derive(Debug, Clone)]
pub struct RemapTable {
    map_x: Vec<f32>,
    map_y: Vec<f32>,
    width: u32,
    height: u32,
}

/// Planar stereo rectification with the zero-disparity-at-infinity policy.
///
/// Splits the inter-camera rotation evenly between the two views, aligns
/// the new x axis with the baseline and assembles rectified projections
/// sharing one principal point, so epipolar lines become horizontal and
/// disparity vanishes at infinity.
pub fn stereo_rectify(
    left: &CalibrationModel,
    right: &CalibrationModel,
    extrinsics: &StereoExtrinsics,
    image_size: (u32, u32),
) -> Result<RectificationTransforms> {
    if image_size.0 == 0 || image_size.1 == 0 {
        return Err(Error::Configuration(
            "stereo_rectify requires a non-zero image size".to_string(),
        ));
    }
    left.intrinsics.validate()?;
    right.intrinsics.validate()?;
    let baseline = extrinsics.baseline();
    if baseline <= 1e-12 {
        return Err(Error::Configuration(
            "stereo_rectify requires a non-zero baseline".to_string(),
        ));
    }

    // Rotate each camera halfway toward the other so both share one
    // orientation, then rotate that common frame to put the baseline on
    // the x axis.
    let om = Rotation3::from_matrix(&extrinsics.rotation).scaled_axis();
    let r_half = Rotation3::new(om * -0.5).into_inner();
    let t = r_half * extrinsics.translation;

    let sign = if t[0] >= 0.0 { 1.0 } else { -1.0 };
    let e1 = t * (sign / baseline);
    let helper = if e1[2].abs() < 0.9 {
        Vector3::<f64>::new(0.0, 0.0, 1.0)
    } else {
        Vector3::<f64>::new(0.0, 1.0, 0.0)
    };
    let e2 = helper.cross(&e1).normalize();
    let e3 = e1.cross(&e2);
    let row_align = Matrix3::from_columns(&[e1, e2, e3]).transpose();

    let r1 = row_align * r_half.transpose();
    let r2 = row_align * r_half;
    let t_new = row_align * t;

    let fx = 0.5 * (left.intrinsics.fx + right.intrinsics.fx);
    let fy = 0.5 * (left.intrinsics.fy + right.intrinsics.fy);
    let cx = 0.5 * (left.intrinsics.cx + right.intrinsics.cx);
    let cy = 0.5 * (left.intrinsics.cy + right.intrinsics.cy);

    let p1 = Matrix3x4::new(
        fx, 0.0, cx, 0.0, //
        0.0, fy, cy, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    );
    let p2 = Matrix3x4::new(
        fx, 0.0, cx, t_new[0] * fx, //
        0.0, fy, cy, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    );
    let q = derive_q(&p1, &p2)?;

    Ok(RectificationTransforms { r1, r2, p1, p2, q })
}

/// Build the undistort+rectify lookup table for one camera.
///
/// Each output pixel is lifted into the rectified camera, rotated back to
/// the original view, distorted forward and projected through the original
/// intrinsics, yielding the input coordinates to sample from.
pub fn init_rectification_map(
    calib: &CalibrationModel,
    rectification: &Matrix3<f64>,
    projection: &Matrix3x4<f64>,
    image_size: (u32, u32),
) -> Result<RemapTable> {
    if image_size.0 == 0 || image_size.1 == 0 {
        return Err(Error::Configuration(
            "init_rectification_map requires a non-zero image size".to_string(),
        ));
    }
    calib.intrinsics.validate()?;

    let (width, height) = image_size;
    let k_new: Matrix3<f64> = projection.fixed_view::<3, 3>(0, 0).into_owned();
    let k_new_inv = k_new.try_inverse().ok_or_else(|| {
        Error::Configuration("rectified projection matrix is singular".to_string())
    })?;
    let r_inv = rectification
        .try_inverse()
        .unwrap_or_else(|| rectification.transpose());

    // Degenerate rays keep the out-of-range default and sample the
    // zero border.
    let mut map_x = vec![-1.0f32; (width * height) as usize];
    let mut map_y = vec![-1.0f32; (width * height) as usize];
    let intrinsics = calib.intrinsics;
    let distortion = calib.distortion;

    map_x
        .par_chunks_mut(width as usize)
        .zip(map_y.par_chunks_mut(width as usize))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            for x in 0..width {
                let dst = Vector3::new(x as f64, y as f64, 1.0);
                let rectified_norm = k_new_inv * dst;
                let original_norm = r_inv * rectified_norm;

                if original_norm[2].abs() <= 1e-12 {
                    continue;
                }
                let xn = original_norm[0] / original_norm[2];
                let yn = original_norm[1] / original_norm[2];
                let (xd, yd) = distortion.apply(xn, yn);

                row_x[x as usize] = (intrinsics.fx * xd + intrinsics.cx) as f32;
                row_y[x as usize] = (intrinsics.fy * yd + intrinsics.cy) as f32;
            }
        });

    Ok(RemapTable {
        map_x,
        map_y,
        width,
        height,
    })
}

impl RemapTable {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Remap an image, preserving its channel count. Output size equals
    /// the table size; the input is never mutated.
    pub fn remap(&self, src: &DynamicImage) -> DynamicImage {
        match src {
            DynamicImage::ImageLuma8(gray) => DynamicImage::ImageLuma8(self.remap_gray(gray)),
            other => DynamicImage::ImageRgb8(self.remap_color(&other.to_rgb8())),
        }
    }

    /// Remap a single-channel image with bilinear interpolation and a
    /// zero border.
    pub fn remap_gray(&self, src: &GrayImage) -> GrayImage {
        let mut dst = GrayImage::new(self.width, self.height);
        dst.par_chunks_mut(self.width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..self.width as usize {
                    let idx = y * self.width as usize + x;
                    row[x] = sample_gray(src, self.map_x[idx], self.map_y[idx]);
                }
            });
        dst
    }

    /// Remap a 3-channel image with bilinear interpolation and a zero
    /// border.
    pub fn remap_color(&self, src: &RgbImage) -> RgbImage {
        let mut dst = RgbImage::new(self.width, self.height);
        dst.par_chunks_mut(self.width as usize * 3)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..self.width as usize {
                    let idx = y * self.width as usize + x;
                    let px = sample_rgb(src, self.map_x[idx], self.map_y[idx]);
                    row[x * 3] = px[0];
                    row[x * 3 + 1] = px[1];
                    row[x * 3 + 2] = px[2];
                }
            });
        dst
    }
}

fn sample_gray(src: &GrayImage, x: f32, y: f32) -> u8 {
    let (w, h) = (src.width(), src.height());
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return 0;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let dx = x - x0 as f32;
    let dy = y - y0 as f32;

    let i00 = src.get_pixel(x0, y0)[0] as f32;
    let i10 = src.get_pixel(x1, y0)[0] as f32;
    let i01 = src.get_pixel(x0, y1)[0] as f32;
    let i11 = src.get_pixel(x1, y1)[0] as f32;

    let value = i00 * (1.0 - dx) * (1.0 - dy)
        + i10 * dx * (1.0 - dy)
        + i01 * (1.0 - dx) * dy
        + i11 * dx * dy;
    value.clamp(0.0, 255.0) as u8
}

fn sample_rgb(src: &RgbImage, x: f32, y: f32) -> [u8; 3] {
    let (w, h) = (src.width(), src.height());
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return [0, 0, 0];
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let dx = x - x0 as f32;
    let dy = y - y0 as f32;

    let p00 = src.get_pixel(x0, y0);
    let p10 = src.get_pixel(x1, y0);
    let p01 = src.get_pixel(x0, y1);
    let p11 = src.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let value = p00[c] as f32 * (1.0 - dx) * (1.0 - dy)
            + p10[c] as f32 * dx * (1.0 - dy)
            + p01[c] as f32 * (1.0 - dx) * dy
            + p11[c] as f32 * dx * dy;
        out[c] = value.clamp(0.0, 255.0) as u8;
    }
    out
}

struct CacheEntry {
    left: CalibrationModel,
    right: CalibrationModel,
    extrinsics: StereoExtrinsics,
    size: (u32, u32),
    transforms: RectificationTransforms,
    left_map: RemapTable,
    right_map: RemapTable,
}

impl CacheEntry {
    fn matches(
        &self,
        left: &CalibrationModel,
        right: &CalibrationModel,
        extrinsics: &StereoExtrinsics,
        size: (u32, u32),
    ) -> bool {
        self.size == size
            && self.left == *left
            && self.right == *right
            && self.extrinsics == *extrinsics
    }
}

/// Rectification engine with a transform/remap-table cache.
///
/// Tables are keyed by the calibration pair, the extrinsics and the image
/// size, all compared by value; any change invalidates and recomputes
/// them, a hit goes straight to the remap.
pub struct Rectifier {
    source: RectificationSource,
    cached: Option<CacheEntry>,
    rebuilds: u64,
}

impl Rectifier {
    pub fn new(source: RectificationSource) -> Self {
        Self {
            source,
            cached: None,
            rebuilds: 0,
        }
    }

    /// Rectify a stereo pair, reusing cached transforms and remap tables
    /// when calibration and image size are unchanged.
    pub fn rectify_pair(
        &mut self,
        left_image: &DynamicImage,
        right_image: &DynamicImage,
        left: &CalibrationModel,
        right: &CalibrationModel,
        extrinsics: &StereoExtrinsics,
    ) -> Result<(DynamicImage, DynamicImage, RectificationTransforms)> {
        use image::GenericImageView;

        let size = left_image.dimensions();
        if size != right_image.dimensions() {
            return Err(Error::DimensionMismatch(format!(
                "left {:?} vs right {:?}",
                size,
                right_image.dimensions()
            )));
        }

        let entry = self.ensure_cached(left, right, extrinsics, size)?;
        let rectified_left = entry.left_map.remap(left_image);
        let rectified_right = entry.right_map.remap(right_image);
        Ok((rectified_left, rectified_right, entry.transforms.clone()))
    }

    fn ensure_cached(
        &mut self,
        left: &CalibrationModel,
        right: &CalibrationModel,
        extrinsics: &StereoExtrinsics,
        size: (u32, u32),
    ) -> Result<&CacheEntry> {
        let stale = match &self.cached {
            Some(entry) => !entry.matches(left, right, extrinsics, size),
            None => true,
        };
        if stale {
            log::debug!(
                "computing rectification transforms and remap tables for {}x{}",
                size.0,
                size.1
            );
            let transforms = match &self.source {
                RectificationSource::Derived => stereo_rectify(left, right, extrinsics, size)?,
                RectificationSource::Fixed(t) => t.clone(),
            };
            let left_map = init_rectification_map(left, &transforms.r1, &transforms.p1, size)?;
            let right_map = init_rectification_map(right, &transforms.r2, &transforms.p2, size)?;
            self.cached = Some(CacheEntry {
                left: *left,
                right: *right,
                extrinsics: extrinsics.clone(),
                size,
                transforms,
                left_map,
                right_map,
            });
            self.rebuilds += 1;
        }
        match &self.cached {
            Some(entry) => Ok(entry),
            None => Err(Error::Configuration(
                "rectification cache unavailable".to_string(),
            )),
        }
    }
}

impl Default for Rectifier {
    fn default() -> Self {
        Self::new(RectificationSource::Derived)
    }
}
