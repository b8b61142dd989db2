use cgmath::prelude::*;
use cgmath::{AbsDiffEq, Point3};

use vid2cloud::camera::Pose;
use vid2cloud::config::{BundleConfig, Config, PoseConfig, TriangulationConfig};
use vid2cloud::features::FeatureProvider;
use vid2cloud::pipeline::{NullSink, Pipeline};
use vid2cloud::reconstruction::Reconstruction;
use vid2cloud::recovery_pose::{AbsolutePoseStatus, RecoveryPose, RelativePoseStatus};
use vid2cloud::synthetic::{SceneConfig, SyntheticScene};

#[test]
fn two_view_reconstruction() {
    let scene = SyntheticScene::generate(&SceneConfig::default());
    let mut provider = scene.provider();
    let f0 = scene.render(0);
    let f1 = scene.render(1);
    let corners = provider.corners(&f0);
    let (prev, curr) = provider.track(&f0, &f1, &corners);
    assert!(prev.len() > 100);

    let mut recovery = RecoveryPose::new(PoseConfig::default());
    let status = recovery.estimate_relative(&prev, &curr, &scene.camera, 50);
    assert_eq!(status, RelativePoseStatus::Recovered(prev.len()));

    // the first camera is the identity, so the relative motion is the second pose
    let truth = scene.poses[1];
    assert!(recovery.pose.rotation.abs_diff_eq(&truth.rotation, 1e-6));
    assert!(recovery
        .pose
        .translation
        .abs_diff_eq(&truth.translation.normalize(), 1e-6));

    let reconstruction =
        Reconstruction::new(TriangulationConfig::default(), BundleConfig::default());
    let triangulated = reconstruction.triangulate_cloud(
        &scene.camera,
        &prev,
        &curr,
        &f1,
        &Pose::identity(),
        &recovery.pose,
    );
    assert_eq!(triangulated.num_valid(), prev.len());

    // unit baseline, so the cloud is the ground truth scaled by 1 / step
    let scale = 1.0 / scene.config.step;
    for (x, p) in triangulated.points.iter().zip(&prev) {
        let i = scene.point_at(0, *p).unwrap();
        let expected = Point3::from_vec(scene.points[i].to_vec() * scale);
        assert!(x.distance(expected) < 1e-4 * scale, "{:?} {:?}", x, expected);
    }
}

#[test]
fn localization_against_known_points() {
    let scene = SyntheticScene::generate(&SceneConfig::default());
    let (points, pixels): (Vec<_>, Vec<_>) = scene.observations[3]
        .iter()
        .enumerate()
        .filter_map(|(i, u)| u.map(|u| (scene.points[i], u)))
        .unzip();

    let mut recovery = RecoveryPose::new(PoseConfig::default());
    let status = recovery.estimate_absolute(&points, &pixels, &scene.camera);
    assert_eq!(status, AbsolutePoseStatus::Recovered(points.len()));
    assert!(recovery.pose.rotation.abs_diff_eq(&scene.poses[3].rotation, 1e-6));
    assert!(recovery
        .pose
        .center()
        .abs_diff_eq(&scene.poses[3].center(), 1e-6));
}

#[test]
fn odometry_follows_the_trajectory() {
    let scene = SyntheticScene::generate(&SceneConfig::default());
    let mut config = Config::default();
    config.pipeline.min_flow_features = 100;
    config.pipeline.ba_interval = 0;
    let mut pipeline = Pipeline::new(scene.camera.clone(), config).unwrap();
    let summary = pipeline
        .run(&mut scene.source(), &mut scene.provider(), &mut NullSink)
        .unwrap();
    assert_eq!(summary.frames_integrated, scene.num_frames() - 1);

    let scale = 1.0 / scene.config.step;
    for (estimate, truth) in pipeline
        .context
        .camera_data
        .extrinsics
        .iter()
        .zip(&scene.poses)
    {
        let expected = Point3::from_vec(truth.center().to_vec() * scale);
        assert!(estimate.center().distance(expected) < 1e-3);
        assert!(estimate.rotation.abs_diff_eq(&truth.rotation, 1e-6));
    }
}

#[test]
fn noisy_sequence_with_refinement() {
    let scene = SyntheticScene::generate(&SceneConfig {
        pixel_noise: 0.3,
        seed: 7,
        ..SceneConfig::default()
    });
    let mut config = Config::default();
    config.pipeline.min_flow_features = 100;
    config.pipeline.ba_interval = 5;
    config.pipeline.filter_interval = 5;
    let mut pipeline = Pipeline::new(scene.camera.clone(), config).unwrap();
    let summary = pipeline
        .run(&mut scene.source(), &mut scene.provider(), &mut NullSink)
        .unwrap();

    assert_eq!(summary.frames_read, scene.num_frames());
    assert!(summary.frames_integrated >= 5);
    assert!(summary.bundle_adjustments >= 1);
    assert!(summary.active_points > 0);
    assert_eq!(
        summary.cloud_size - summary.active_points,
        summary.filtered_points
    );
    assert_eq!(pipeline.context.camera_data.extrinsics[0], Pose::identity());
}
