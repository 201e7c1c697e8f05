//! Disparity-to-depth reprojection
//!
//! Derives the 4x4 disparity-to-depth transform Q from the rectified
//! projection matrices and lifts valid disparity pixels into 3D camera
//! space.

use crate::matcher::{DisparityMap, DISPARITY_SCALE};
use crate::{Error, Result, Stage};
use nalgebra::{Matrix3x4, Matrix4, Point3, Vector4};

/// Reprojection filter thresholds. `max_depth` doubles as the sentinel
/// value marking "no valid depth"; points at or beyond it are dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReprojectionParams {
    pub max_depth: f64,
    pub depth_epsilon: f64,
    /// When set, pixels carrying the invalid-disparity marker are skipped
    /// instead of reprojected.
    pub handle_missing_disparities: bool,
}

impl Default for ReprojectionParams {
    fn default() -> Self {
        Self {
            max_depth: 1.0e4,
            depth_epsilon: 1.0e-6,
            handle_missing_disparities: true,
        }
    }
}

impl ReprojectionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, value: f64) -> Self {
        self.max_depth = value;
        self
    }

    pub fn with_depth_epsilon(mut self, value: f64) -> Self {
        self.depth_epsilon = value;
        self
    }

    pub fn with_handle_missing_disparities(mut self, value: bool) -> Self {
        self.handle_missing_disparities = value;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.max_depth.is_finite() || self.max_depth <= 0.0 {
            return Err(Error::Configuration(format!(
                "max_depth must be finite and positive, got {}",
                self.max_depth
            )));
        }
        if !self.depth_epsilon.is_finite() || self.depth_epsilon < 0.0 {
            return Err(Error::Configuration(format!(
                "depth_epsilon must be finite and non-negative, got {}",
                self.depth_epsilon
            )));
        }
        Ok(())
    }
}

/// 3D points reconstructed from a disparity map, appended in raster order
/// of the valid pixels. The cloud keeps no pixel adjacency.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointCloud {
    pub points: Vec<Point3<f64>>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Closed-form disparity-to-depth matrix from the rectified projections:
///
/// ```text
/// Q = [ 1  0   0       -lCx        ]
///     [ 0  1   0       -rCy        ]
///     [ 0  0   0        rFx        ]
///     [ 0  0  -1/Tx  (rCx - lCx)/Tx]
/// ```
///
/// with `Tx = P2[0,3] / -rFx`, the rectified baseline in world units.
pub fn derive_q(p1: &Matrix3x4<f64>, p2: &Matrix3x4<f64>) -> Result<Matrix4<f64>> {
    let r_fx = p2[(0, 0)];
    if r_fx.abs() <= f64::EPSILON {
        return Err(Error::Configuration(
            "projection matrix P2 has a zero focal length".to_string(),
        ));
    }
    let tx = p2[(0, 3)] / -r_fx;
    if tx.abs() <= f64::EPSILON {
        return Err(Error::Configuration(
            "projection matrices describe a zero baseline".to_string(),
        ));
    }

    let l_cx = p1[(0, 2)];
    let r_cx = p2[(0, 2)];
    let r_cy = p2[(1, 2)];

    Ok(Matrix4::new(
        1.0, 0.0, 0.0, -l_cx, //
        0.0, 1.0, 0.0, -r_cy, //
        0.0, 0.0, 0.0, r_fx, //
        0.0, 0.0, -1.0 / tx, (r_cx - l_cx) / tx,
    ))
}

/// Reproject a disparity map into 3D camera space.
///
/// Each valid pixel is transformed as `Q * [x, y, d, 1]` and
/// dehomogenized. Points with a degenerate homogeneous coordinate, a
/// non-finite component or a depth at or beyond `max_depth` are dropped.
pub fn reproject_to_3d(
    disparity: &DisparityMap,
    q: &Matrix4<f64>,
    params: &ReprojectionParams,
) -> Result<PointCloud> {
    params.validate()?;

    let mut points = Vec::new();
    for y in 0..disparity.height {
        for x in 0..disparity.width {
            let raw = disparity.get(x, y);
            if params.handle_missing_disparities && raw < 0 {
                continue;
            }
            let d = raw as f64 / DISPARITY_SCALE as f64;

            let v = q * Vector4::new(x as f64, y as f64, d, 1.0);
            if v[3].abs() <= params.depth_epsilon {
                continue;
            }
            let point = Point3::new(v[0] / v[3], v[1] / v[3], v[2] / v[3]);

            if !point.x.is_finite() || !point.y.is_finite() || !point.z.is_finite() {
                continue;
            }
            if (point.z - params.max_depth).abs() < params.depth_epsilon
                || point.z.abs() > params.max_depth
            {
                continue;
            }
            points.push(point);
        }
    }
    Ok(PointCloud { points })
}

/// Export a point cloud as an ASCII PLY file.
pub fn export_to_ply(cloud: &PointCloud, filename: &str) -> Result<()> {
    use std::fs::File;
    use std::io::Write;

    let io_err = |e: std::io::Error| Error::Computation {
        stage: Stage::Reprojection,
        message: format!("writing '{filename}': {e}"),
    };

    let mut file = File::create(filename).map_err(io_err)?;
    writeln!(file, "ply").map_err(io_err)?;
    writeln!(file, "format ascii 1.0").map_err(io_err)?;
    writeln!(file, "element vertex {}", cloud.len()).map_err(io_err)?;
    writeln!(file, "property float x").map_err(io_err)?;
    writeln!(file, "property float y").map_err(io_err)?;
    writeln!(file, "property float z").map_err(io_err)?;
    writeln!(file, "end_header").map_err(io_err)?;

    for p in &cloud.points {
        writeln!(file, "{} {} {}", p.x, p.y, p.z).map_err(io_err)?;
    }
    Ok(())
}
