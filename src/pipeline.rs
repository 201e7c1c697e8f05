//! Pipeline orchestrator
//!
//! Wires the rectification, matching and reprojection engines together
//! and runs them in sequence per input frame pair. A failure at any stage
//! is tagged with that stage, logged and the frame is skipped; caches and
//! algorithm state survive for the next frame.

use crate::calibration::{CalibrationModel, RectificationSource, StereoExtrinsics};
use crate::matcher::{DisparityEngine, DisparityMap, MatcherKind, MatcherParams};
use crate::rectification::{RectificationTransforms, Rectifier};
use crate::reproject::{derive_q, reproject_to_3d, PointCloud, ReprojectionParams};
use crate::{Result, Stage};
use image::{DynamicImage, GrayImage};

/// Everything the pipeline needs besides the per-frame inputs: the rig
/// extrinsics, the matching algorithm and its parameters, and whether to
/// emit a point cloud. Camera calibration travels with each frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub extrinsics: StereoExtrinsics,
    pub rectification_source: RectificationSource,
    pub algorithm: MatcherKind,
    pub matcher_params: MatcherParams,
    /// `None` disables reprojection; no point cloud is produced.
    pub reprojection: Option<ReprojectionParams>,
}

impl PipelineConfig {
    pub fn new(extrinsics: StereoExtrinsics) -> Self {
        Self {
            extrinsics,
            rectification_source: RectificationSource::Derived,
            algorithm: MatcherKind::BlockMatching,
            matcher_params: MatcherParams::default(),
            reprojection: Some(ReprojectionParams::default()),
        }
    }

    pub fn with_rectification_source(mut self, source: RectificationSource) -> Self {
        self.rectification_source = source;
        self
    }

    pub fn with_algorithm(mut self, algorithm: MatcherKind) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_matcher_params(mut self, params: MatcherParams) -> Self {
        self.matcher_params = params;
        self
    }

    pub fn with_reprojection(mut self, params: Option<ReprojectionParams>) -> Self {
        self.reprojection = params;
        self
    }
}

/// A synchronized input pair with the calibration it was captured under.
/// The rectification cache compares calibration by value, so frames from
/// an unchanged rig reuse the cached remap tables.
#[derive(Debug, Clone)]
pub struct StereoFrame {
    pub left: DynamicImage,
    pub right: DynamicImage,
    pub left_calibration: CalibrationModel,
    pub right_calibration: CalibrationModel,
}

impl StereoFrame {
    pub fn new(
        left: DynamicImage,
        right: DynamicImage,
        left_calibration: CalibrationModel,
        right_calibration: CalibrationModel,
    ) -> Self {
        Self {
            left,
            right,
            left_calibration,
            right_calibration,
        }
    }
}

/// All outputs of one pipeline invocation.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    pub rectified_left: DynamicImage,
    pub rectified_right: DynamicImage,
    pub transforms: RectificationTransforms,
    pub disparity: DisparityMap,
    /// 8-bit depth visualization of the disparity map.
    pub depth_map: GrayImage,
    /// Present when reprojection is enabled in the configuration.
    pub point_cloud: Option<PointCloud>,
}

/// The assembled stereo depth pipeline.
///
/// Owns the rectification cache and the configured matcher; both are kept
/// across frames and across failed frames.
pub struct DepthPipeline {
    config: PipelineConfig,
    rectifier: Rectifier,
    engine: DisparityEngine,
}

impl DepthPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let mut engine = DisparityEngine::new();
        engine.configure(config.algorithm, &config.matcher_params)?;
        let rectifier = Rectifier::new(config.rectification_source.clone());
        Ok(Self {
            config,
            rectifier,
            engine,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Replace the configuration. Validation happens before anything is
    /// swapped, so a rejected configuration leaves the pipeline running
    /// on the previous one.
    pub fn reconfigure(&mut self, config: PipelineConfig) -> Result<()> {
        self.engine.configure(config.algorithm, &config.matcher_params)?;
        if config.rectification_source != self.config.rectification_source {
            self.rectifier = Rectifier::new(config.rectification_source.clone());
        }
        self.config = config;
        Ok(())
    }

    /// Run the full pipeline on one frame pair, returning the stage-tagged
    /// error on failure. Pipeline state is intact either way.
    pub fn try_process(&mut self, frame: &StereoFrame) -> Result<DepthFrame> {
        // The block-matching family operates on a single channel; convert
        // before rectifying so the remap runs on the cheaper format.
        let grayscale = self
            .engine
            .kind()
            .map(|k| k.requires_grayscale())
            .unwrap_or(false);
        let (left, right) = if grayscale {
            (
                DynamicImage::ImageLuma8(frame.left.to_luma8()),
                DynamicImage::ImageLuma8(frame.right.to_luma8()),
            )
        } else {
            (frame.left.clone(), frame.right.clone())
        };

        let (rectified_left, rectified_right, transforms) = self
            .rectifier
            .rectify_pair(
                &left,
                &right,
                &frame.left_calibration,
                &frame.right_calibration,
                &self.config.extrinsics,
            )
            .map_err(|e| e.at_stage(Stage::Rectification))?;

        let disparity = self
            .engine
            .compute(&rectified_left, &rectified_right)
            .map_err(|e| e.at_stage(Stage::Matching))?;

        let depth_map = match self.engine.kind() {
            Some(MatcherKind::Variational) => disparity.to_depth_image_normalized(),
            _ => disparity.to_depth_image(),
        };

        let point_cloud = match &self.config.reprojection {
            Some(params) => {
                let q = derive_q(&transforms.p1, &transforms.p2)
                    .map_err(|e| e.at_stage(Stage::Reprojection))?;
                Some(
                    reproject_to_3d(&disparity, &q, params)
                        .map_err(|e| e.at_stage(Stage::Reprojection))?,
                )
            }
            None => None,
        };

        Ok(DepthFrame {
            rectified_left,
            rectified_right,
            transforms,
            disparity,
            depth_map,
            point_cloud,
        })
    }

    /// Per-frame entry point with the skip-on-failure policy: a failed
    /// frame is logged and dropped, never fatal.
    pub fn process(&mut self, frame: &StereoFrame) -> Option<DepthFrame> {
        match self.try_process(frame) {
            Ok(output) => Some(output),
            Err(err) => {
                log::error!("frame skipped: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CameraIntrinsics, Distortion};
    use crate::Error;
    use image::Luma;
    use nalgebra::{Matrix3, Vector3};

    fn test_calibration() -> CalibrationModel {
        let k = CameraIntrinsics::new(1000.0, 1000.0, 32.0, 24.0);
        CalibrationModel::new(k, Distortion::none())
    }

    fn test_config() -> PipelineConfig {
        let ext = StereoExtrinsics::new(Matrix3::identity(), Vector3::new(-0.1, 0.0, 0.0));
        PipelineConfig::new(ext)
    }

    fn textured_frame(width: u32, height: u32, shift: u32) -> StereoFrame {
        let pattern = |x: u32, y: u32| ((x * 131 + y * 31) % 251) as u8;
        let mut left = GrayImage::new(width, height);
        let mut right = GrayImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                left.put_pixel(x, y, Luma([pattern(x, y)]));
                right.put_pixel(x, y, Luma([pattern(x + shift, y)]));
            }
        }
        StereoFrame::new(
            DynamicImage::ImageLuma8(left),
            DynamicImage::ImageLuma8(right),
            test_calibration(),
            test_calibration(),
        )
    }

    #[test]
    fn test_pipeline_rejects_invalid_matcher_params() {
        let config = test_config()
            .with_matcher_params(MatcherParams::new().with_num_disparities(50));
        assert!(matches!(
            DepthPipeline::new(config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_reconfigure_failure_keeps_previous_state() {
        let mut pipeline = DepthPipeline::new(test_config()).unwrap();
        let bad = test_config()
            .with_algorithm(MatcherKind::SemiGlobalBlockMatching)
            .with_matcher_params(MatcherParams::new().with_sad_window_size(4));
        assert!(pipeline.reconfigure(bad).is_err());
        assert_eq!(pipeline.engine.kind(), Some(MatcherKind::BlockMatching));
        assert_eq!(pipeline.config().algorithm, MatcherKind::BlockMatching);
    }

    #[test]
    fn test_mismatched_frame_tagged_and_pipeline_survives() {
        let mut pipeline = DepthPipeline::new(test_config()).unwrap();
        let frame = StereoFrame::new(
            DynamicImage::ImageLuma8(GrayImage::new(64, 48)),
            DynamicImage::ImageLuma8(GrayImage::new(32, 48)),
            test_calibration(),
            test_calibration(),
        );
        match pipeline.try_process(&frame) {
            Err(Error::Computation { stage, .. }) => {
                assert_eq!(stage, Stage::Rectification)
            }
            other => panic!("expected stage-tagged error, got {other:?}"),
        }

        // The failed frame must not poison the pipeline.
        let good = textured_frame(64, 48, 4);
        assert!(pipeline.try_process(&good).is_ok());
    }

    #[test]
    fn test_process_skips_failed_frames() {
        let mut pipeline = DepthPipeline::new(test_config()).unwrap();
        let frame = StereoFrame::new(
            DynamicImage::ImageLuma8(GrayImage::new(64, 48)),
            DynamicImage::ImageLuma8(GrayImage::new(32, 48)),
            test_calibration(),
            test_calibration(),
        );
        assert!(pipeline.process(&frame).is_none());
    }

    #[test]
    fn test_outputs_share_input_dimensions() {
        let config = test_config().with_matcher_params(
            MatcherParams::new()
                .with_num_disparities(16)
                .with_speckle_filter(0, 0),
        );
        let mut pipeline = DepthPipeline::new(config).unwrap();
        let output = pipeline.try_process(&textured_frame(64, 48, 4)).unwrap();

        assert_eq!(output.disparity.width, 64);
        assert_eq!(output.disparity.height, 48);
        assert_eq!(output.depth_map.dimensions(), (64, 48));
        assert!(output.point_cloud.is_some());
    }

    #[test]
    fn test_point_cloud_only_when_requested() {
        let config = test_config()
            .with_reprojection(None)
            .with_matcher_params(MatcherParams::new().with_num_disparities(16));
        let mut pipeline = DepthPipeline::new(config).unwrap();
        let output = pipeline.try_process(&textured_frame(64, 48, 4)).unwrap();
        assert!(output.point_cloud.is_none());
    }

    #[test]
    fn test_color_input_converted_for_block_matching() {
        let config = test_config()
            .with_matcher_params(MatcherParams::new().with_num_disparities(16));
        let mut pipeline = DepthPipeline::new(config).unwrap();

        let gray = textured_frame(64, 48, 4);
        let frame = StereoFrame::new(
            DynamicImage::ImageRgb8(gray.left.to_rgb8()),
            DynamicImage::ImageRgb8(gray.right.to_rgb8()),
            test_calibration(),
            test_calibration(),
        );
        let output = pipeline.try_process(&frame).unwrap();
        assert!(matches!(output.rectified_left, DynamicImage::ImageLuma8(_)));
    }
}
