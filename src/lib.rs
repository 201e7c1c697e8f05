//! Stereo depth estimation
//!
//! This crate turns a synchronized, calibrated stereo image pair into a
//! dense disparity/depth map, a geometrically rectified image pair and an
//! optional 3D point cloud.
//!
//! The pipeline is composed of three engines wired together by
//! [`DepthPipeline`]:
//!
//! - [`rectification`] computes row-aligning rectification transforms and
//!   per-pixel remap tables from the camera calibration, and caches them
//!   across frames,
//! - [`matcher`] computes a fixed-point disparity map from the rectified
//!   pair using a selectable dense-matching algorithm,
//! - [`reproject`] derives the disparity-to-depth Q matrix and lifts valid
//!   disparities into 3D camera space.

use std::fmt;

pub mod calibration;
pub mod matcher;
pub mod pipeline;
pub mod rectification;
pub mod reproject;

pub use calibration::*;
pub use matcher::*;
pub use pipeline::*;
pub use rectification::*;
pub use reproject::*;

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage a per-frame computation failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Rectification,
    Matching,
    Reprojection,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Rectification => write!(f, "rectification"),
            Stage::Matching => write!(f, "matching"),
            Stage::Reprojection => write!(f, "reprojection"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or missing parameters, uninitialized calibration or an
    /// unconfigured matcher. Surfaced by `configure`-style entry points.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Left/right inputs do not share dimensions, or an image does not
    /// match the size its remap tables were built for.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A per-frame computation failed. Caught at the pipeline boundary;
    /// the frame is skipped and pipeline state stays intact.
    #[error("{stage} failed: {message}")]
    Computation { stage: Stage, message: String },
}

impl Error {
    /// Tag an error with the pipeline stage it occurred in. Errors that
    /// already carry a stage are left as they are.
    pub(crate) fn at_stage(self, stage: Stage) -> Error {
        match self {
            Error::Computation { .. } => self,
            other => Error::Computation {
                stage,
                message: other.to_string(),
            },
        }
    }
}
