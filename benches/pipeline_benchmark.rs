use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{DynamicImage, GrayImage, Luma};
use nalgebra::{Matrix3, Vector3};
use stereo_depth::*;

fn synthetic_calibration() -> CalibrationModel {
    let k = CameraIntrinsics::new(1000.0, 1000.0, 160.0, 120.0);
    CalibrationModel::new(k, Distortion::none())
}

fn synthetic_extrinsics() -> StereoExtrinsics {
    StereoExtrinsics::new(Matrix3::identity(), Vector3::new(-100.0, 0.0, 0.0))
}

fn synthetic_frame(width: u32, height: u32, shift: u32) -> StereoFrame {
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
        synthetic_calibration(),
        synthetic_calibration(),
    )
}

fn benchmark_rectification(c: &mut Criterion) {
    let calib = synthetic_calibration();
    let ext = synthetic_extrinsics();

    c.bench_function("stereo_rectify", |b| {
        b.iter(|| black_box(stereo_rectify(&calib, &calib, &ext, (320, 240))));
    });

    let transforms = stereo_rectify(&calib, &calib, &ext, (320, 240)).unwrap();
    c.bench_function("init_rectification_map_320x240", |b| {
        b.iter(|| {
            black_box(init_rectification_map(
                &calib,
                &transforms.r1,
                &transforms.p1,
                (320, 240),
            ))
        });
    });
}

fn benchmark_matchers(c: &mut Criterion) {
    let frame = synthetic_frame(320, 240, 8);
    let params = MatcherParams::new().with_num_disparities(32);

    let mut group = c.benchmark_group("disparity_320x240");
    for (name, kind) in [
        ("block_matching", MatcherKind::BlockMatching),
        ("sgbm", MatcherKind::SemiGlobalBlockMatching),
        ("sgbm_full_dp", MatcherKind::SemiGlobalBlockMatchingFullDp),
    ] {
        let mut engine = DisparityEngine::new();
        engine.configure(kind, &params).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| black_box(engine.compute(&frame.left, &frame.right)));
        });
    }
    group.finish();
}

fn benchmark_full_pipeline(c: &mut Criterion) {
    let config = PipelineConfig::new(synthetic_extrinsics())
        .with_matcher_params(MatcherParams::new().with_num_disparities(32));
    let mut pipeline = DepthPipeline::new(config).unwrap();
    let frame = synthetic_frame(320, 240, 8);

    c.bench_function("pipeline_320x240_bm", |b| {
        b.iter(|| black_box(pipeline.try_process(&frame)));
    });
}

criterion_group!(
    benches,
    benchmark_rectification,
    benchmark_matchers,
    benchmark_full_pipeline
);
criterion_main!(benches);
