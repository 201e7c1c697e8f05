//! Camera calibration data model
//!
//! Pure data consumed by the rectification engine: per-camera intrinsics
//! and distortion coefficients, plus the fixed extrinsic relation between
//! the two cameras of a rig. Calibration itself is computed elsewhere;
//! these types only carry its results.

use crate::{Error, Result};
use nalgebra::{Matrix3, Vector3};

use crate::rectification::RectificationTransforms;

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Build intrinsics from a 3x3 camera matrix.
    ///
    /// Fails if the matrix is degenerate (zero focal lengths), which is
    /// what an empty or uninitialized calibration stream looks like.
    pub fn from_matrix(m: &Matrix3<f64>) -> Result<Self> {
        let fx = m[(0, 0)];
        let fy = m[(1, 1)];
        if fx.abs() <= 1e-12 || fy.abs() <= 1e-12 {
            return Err(Error::Configuration(
                "camera matrix has zero focal length".to_string(),
            ));
        }
        Ok(Self {
            fx,
            fy,
            cx: m[(0, 2)],
            cy: m[(1, 2)],
        })
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.fx.abs() <= 1e-12 || self.fy.abs() <= 1e-12 {
            return Err(Error::Configuration(
                "camera intrinsics have zero focal length".to_string(),
            ));
        }
        Ok(())
    }
}

/// Radial-tangential lens distortion (k1, k2, p1, p2, k3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn new(k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) -> Self {
        Self { k1, k2, p1, p2, k3 }
    }

    pub fn none() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0, 0.0)
    }

    /// Build from a coefficient vector as persisted by calibration tools:
    /// `[k1, k2, p1, p2, k3]`, shorter vectors padded with zeros.
    pub fn from_coefficients(coeffs: &[f64]) -> Result<Self> {
        if coeffs.len() > 5 {
            return Err(Error::Configuration(format!(
                "expected at most 5 distortion coefficients, got {}",
                coeffs.len()
            )));
        }
        let c = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        Ok(Self::new(c(0), c(1), c(2), c(3), c(4)))
    }

    /// Distort normalized camera coordinates.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + dx, y * radial + dy)
    }

    /// Undistort normalized camera coordinates by fixed-point iteration.
    pub fn remove(&self, x: f64, y: f64) -> (f64, f64) {
        let mut xd = x;
        let mut yd = y;
        for _ in 0..10 {
            let (xu, yu) = self.apply(xd, yd);
            xd += x - xu;
            yd += y - yu;
        }
        (xd, yd)
    }
}

impl Default for Distortion {
    fn default() -> Self {
        Self::none()
    }
}

/// Per-camera calibration: intrinsic matrix plus distortion coefficients.
///
/// Immutable once read from the calibration stream for a given frame.
/// Compared by value so the rectification cache can detect changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationModel {
    pub intrinsics: CameraIntrinsics,
    pub distortion: Distortion,
}

impl CalibrationModel {
    pub fn new(intrinsics: CameraIntrinsics, distortion: Distortion) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }
}

/// Pose of the right camera relative to the left camera. Constant for a
/// fixed rig.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoExtrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl StereoExtrinsics {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Distance between the two camera centers.
    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }
}

impl Default for StereoExtrinsics {
    fn default() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }
}

/// Where the rectification matrices R1/P1/R2/P2 come from.
///
/// `Derived` computes them fresh from the calibration pair; `Fixed` uses
/// matrices persisted by an earlier calibration run. Remap tables are
/// built and cached the same way for both.
#[derive(Debug, Clone, PartialEq)]
pub enum RectificationSource {
    Derived,
    Fixed(RectificationTransforms),
}

impl Default for RectificationSource {
    fn default() -> Self {
        RectificationSource::Derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsics_matrix_roundtrip() {
        let k = CameraIntrinsics::new(820.0, 790.0, 320.0, 240.0);
        let restored = CameraIntrinsics::from_matrix(&k.matrix()).unwrap();
        assert_eq!(k, restored);
    }

    #[test]
    fn test_from_matrix_rejects_zero_focal_length() {
        let m = Matrix3::zeros();
        assert!(CameraIntrinsics::from_matrix(&m).is_err());
    }

    #[test]
    fn test_distortion_remove_inverts_apply() {
        let d = Distortion::new(-0.28, 0.07, 1e-4, -2e-4, 0.0);
        let (xd, yd) = d.apply(0.3, -0.2);
        let (xu, yu) = d.remove(xd, yd);
        assert!((xu - 0.3).abs() < 1e-6);
        assert!((yu + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_distortion_from_short_coefficient_vector() {
        let d = Distortion::from_coefficients(&[-0.3, 0.1]).unwrap();
        assert_eq!(d.k1, -0.3);
        assert_eq!(d.k2, 0.1);
        assert_eq!(d.k3, 0.0);
        assert!(Distortion::from_coefficients(&[0.0; 6]).is_err());
    }

    #[test]
    fn test_baseline() {
        let ext = StereoExtrinsics::new(Matrix3::identity(), Vector3::new(-0.12, 0.0, 0.0));
        assert!((ext.baseline() - 0.12).abs() < 1e-12);
    }
}
