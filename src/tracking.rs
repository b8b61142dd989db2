//! Track history, camera pose chain growth and cloud integration.

use cgmath::{Point2, Point3};
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::camera::{CameraData, CameraParameters, Pose, PoseHandle};
use crate::config::TrackingConfig;
use crate::features::{FeatureMatcher, FeatureSet};
use crate::point_cloud::{Observation, PointCloud};
use crate::reconstruction::Triangulation;
use crate::recovery_pose::{AbsolutePoseStatus, RecoveryPose, MIN_ABSOLUTE_CORRESPONDENCES};
use crate::track_view::TrackView;

/// History of integrated track views. The oldest view is dropped once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct Tracking {
    history: VecDeque<TrackView>,
    capacity: usize,
    /// Number of views integrated so far.
    pub active_layer: usize,
}

impl Tracking {
    pub fn new(config: &TrackingConfig) -> Self {
        let capacity = config.history_capacity.max(1);
        Tracking {
            history: VecDeque::with_capacity(capacity),
            capacity,
            active_layer: 0,
        }
    }

    /// Views from oldest to newest.
    pub fn history(&self) -> impl DoubleEndedIterator<Item = &TrackView> {
        self.history.iter()
    }

    pub fn last_view(&self) -> Option<&TrackView> {
        self.history.back()
    }

    pub fn num_views(&self) -> usize {
        self.history.len()
    }

    pub fn push_view(&mut self, view: TrackView) {
        while self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(view);
        self.active_layer += 1;
    }

    /// Two-view relative motion. Returns whether it succeeded and the number of inliers.
    pub fn find_camera_pose(
        &self,
        recovery: &mut RecoveryPose,
        prev: &[Point2<f64>],
        curr: &[Point2<f64>],
        camera: &CameraParameters,
        min_inliers: usize,
    ) -> (bool, usize) {
        let status = recovery.estimate_relative(prev, curr, camera, min_inliers);
        (status.is_success(), status.inliers())
    }

    /// Absolute pose of the current frame from 2D-3D pairs found by matching the newest history
    /// views against `current`. Every pixel used is claimed in `out_track_view`, so each pixel
    /// contributes at most one pair.
    #[allow(clippy::too_many_arguments)]
    pub fn find_recovered_camera_pose(
        &self,
        matcher: &dyn FeatureMatcher,
        min_matches: usize,
        max_history_frames: usize,
        camera: &CameraParameters,
        current: &FeatureSet,
        recovery: &mut RecoveryPose,
        out_track_view: &mut TrackView,
        cloud: &PointCloud,
    ) -> AbsolutePoseStatus {
        let mut points: Vec<Point3<f64>> = Vec::new();
        let mut pixels: Vec<Point2<f64>> = Vec::new();

        for view in self.history.iter().rev().take(max_history_frames) {
            let matches = matcher.find_robust_matches(&view.descriptors, &current.descriptors);
            for m in matches {
                let handle = view.handles[m.query];
                let point = match cloud.get(handle) {
                    Some(p) if p.active => p,
                    _ => continue,
                };
                let pixel = current.keypoints[m.train];
                if !out_track_view.claim(pixel, handle) {
                    continue;
                }
                points.push(point.position);
                pixels.push(pixel);
            }
            if points.len() >= min_matches.max(MIN_ABSOLUTE_CORRESPONDENCES) {
                break;
            }
        }

        debug!("collected {} 2d-3d pairs", points.len());
        if points.len() < MIN_ABSOLUTE_CORRESPONDENCES {
            return AbsolutePoseStatus::InsufficientCorrespondences(points.len());
        }
        recovery.estimate_absolute(&points, &pixels, camera)
    }

    /// Integrate validated triangulated points into the cloud through `track_view`, then push the
    /// view into the history. `key_indices[i]` is the keypoint of `features` that produced
    /// triangulated point `i`. Returns the number of tracks added.
    pub fn add_track_view(
        &mut self,
        cloud: &mut PointCloud,
        mut track_view: TrackView,
        triangulated: &Triangulation,
        features: &FeatureSet,
        key_indices: &[usize],
        prev_pose: PoseHandle,
    ) -> usize {
        let mut added = 0;
        let mut created = 0;
        for (i, &key) in key_indices.iter().enumerate() {
            if !triangulated.mask.get(i).cloned().unwrap_or(false) {
                continue;
            }
            let keypoint = features.keypoints[key];
            let current = Observation {
                pose: track_view.pose,
                pixel: triangulated.curr_pixels[i],
            };
            let handle = match track_view.cloud_handle(keypoint) {
                Some(handle) => {
                    cloud.register_cloud_view(handle, current);
                    handle
                }
                None => {
                    let handle = cloud.add_cloud_point(
                        current,
                        triangulated.points[i],
                        triangulated.colors[i],
                    );
                    cloud.register_cloud_view(
                        handle,
                        Observation {
                            pose: prev_pose,
                            pixel: triangulated.prev_pixels[i],
                        },
                    );
                    created += 1;
                    handle
                }
            };
            track_view.add_track(keypoint, features.descriptor(key), handle);
            added += 1;
        }
        info!(
            "frame {}: {} tracks, {} new points, cloud size {}",
            track_view.frame_index,
            added,
            created,
            cloud.len()
        );
        self.push_view(track_view);
        added
    }
}

/// Append the pose reached by applying `relative` to the last pose of the chain.
pub fn compose_odometry(camera_data: &mut CameraData, relative: &Pose) -> PoseHandle {
    let next = match camera_data.last_pose() {
        Some(last) => last.compose(relative),
        None => *relative,
    };
    camera_data.push_pose(next)
}

/// Append an absolute pose to the chain.
pub fn push_pose(camera_data: &mut CameraData, pose: Pose) -> PoseHandle {
    camera_data.push_pose(pose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, PoseConfig};
    use crate::features::{Descriptor, HammingMatcher};
    use cgmath::prelude::*;
    use cgmath::{AbsDiffEq, Deg, Matrix3, Vector3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn camera() -> CameraParameters {
        CameraParameters::new(500.0, 500.0, 320.0, 240.0)
    }

    struct Scene {
        points: Vec<Point3<f64>>,
        descriptors: Vec<Descriptor>,
        cloud: PointCloud,
    }

    fn scene(n: usize) -> Scene {
        let mut rng = StdRng::seed_from_u64(3);
        let mut cloud = PointCloud::new(FilterConfig::default());
        let mut points = Vec::new();
        let mut descriptors = Vec::new();
        for _ in 0..n {
            let p = Point3::new(
                rng.gen_range(-2.0, 2.0),
                rng.gen_range(-1.5, 1.5),
                rng.gen_range(5.0, 9.0),
            );
            cloud.add_cloud_point(
                Observation {
                    pose: 0,
                    pixel: camera().project(p),
                },
                p,
                [0, 0, 0],
            );
            points.push(p);
            descriptors.push((0..32).map(|_| rng.gen::<u8>()).collect());
        }
        Scene {
            points,
            descriptors,
            cloud,
        }
    }

    fn view_of(scene: &Scene, ids: std::ops::Range<usize>, pose: PoseHandle) -> TrackView {
        let mut view = TrackView::new(pose, pose);
        for i in ids {
            view.add_track(
                camera().project(scene.points[i]),
                scene.descriptors[i].clone(),
                i,
            );
        }
        view
    }

    fn current_features(scene: &Scene, pose: &Pose) -> FeatureSet {
        FeatureSet::new(
            scene
                .points
                .iter()
                .map(|p| camera().project(pose.transform(*p)))
                .collect(),
            scene.descriptors.clone(),
        )
    }

    fn moved_pose() -> Pose {
        Pose::new(
            Matrix3::from_axis_angle(Vector3::unit_y(), Deg(4.0)),
            Vector3::new(-0.3, 0.05, 0.1),
        )
    }

    fn recovery(min_inliers: usize) -> RecoveryPose {
        RecoveryPose::new(PoseConfig {
            min_inliers,
            ..PoseConfig::default()
        })
    }

    #[test]
    fn test_history_is_deduplicated() {
        let s = scene(60);
        let mut tracking = Tracking::new(&TrackingConfig::default());
        tracking.push_view(view_of(&s, 0..40, 0));
        tracking.push_view(view_of(&s, 20..60, 1));
        let pose = moved_pose();
        let features = current_features(&s, &pose);

        let mut out = TrackView::new(2, 2);
        let mut rec = recovery(30);
        let status = tracking.find_recovered_camera_pose(
            &HammingMatcher::default(),
            1000,
            8,
            &camera(),
            &features,
            &mut rec,
            &mut out,
            &s.cloud,
        );
        assert_eq!(status, AbsolutePoseStatus::Recovered(60));
        assert_eq!(out.num_mapped(), 60);
        assert!(out.is_empty());
        assert!(rec.pose.rotation.abs_diff_eq(&pose.rotation, 1e-6));
        assert!(rec.pose.translation.abs_diff_eq(&pose.translation, 1e-6));
    }

    #[test]
    fn test_history_walk_stops_early() {
        let s = scene(60);
        let mut tracking = Tracking::new(&TrackingConfig::default());
        tracking.push_view(view_of(&s, 0..40, 0));
        tracking.push_view(view_of(&s, 20..60, 1));
        let features = current_features(&s, &moved_pose());

        let mut out = TrackView::new(2, 2);
        let status = tracking.find_recovered_camera_pose(
            &HammingMatcher::default(),
            10,
            8,
            &camera(),
            &features,
            &mut recovery(30),
            &mut out,
            &s.cloud,
        );
        assert_eq!(status, AbsolutePoseStatus::Recovered(40));
        assert_eq!(out.num_mapped(), 40);
    }

    #[test]
    fn test_history_walk_needs_enough_pairs_to_stop() {
        let s = scene(60);
        let mut tracking = Tracking::new(&TrackingConfig::default());
        tracking.push_view(view_of(&s, 0..40, 0));
        // the newest view has nothing to match
        tracking.push_view(TrackView::new(1, 1));
        let pose = moved_pose();
        let features = current_features(&s, &pose);

        let mut out = TrackView::new(2, 2);
        let mut rec = recovery(30);
        let status = tracking.find_recovered_camera_pose(
            &HammingMatcher::default(),
            0,
            8,
            &camera(),
            &features,
            &mut rec,
            &mut out,
            &s.cloud,
        );
        assert_eq!(status, AbsolutePoseStatus::Recovered(40));
        assert_eq!(out.num_mapped(), 40);
        assert!(rec.pose.rotation.abs_diff_eq(&pose.rotation, 1e-6));
    }

    #[test]
    fn test_inactive_points_are_skipped() {
        let mut s = scene(40);
        for _ in 0..3 {
            s.cloud.add_cloud_point(
                Observation {
                    pose: 0,
                    pixel: Point2::new(0.0, 0.0),
                },
                Point3::new(500.0, 0.0, 0.0),
                [0, 0, 0],
            );
        }
        // the far points are the only outliers
        s.cloud.filter_cloud();
        assert_eq!(s.cloud.num_active(), 40);

        let mut tracking = Tracking::new(&TrackingConfig::default());
        let mut view = view_of(&s, 0..5, 0);
        for h in 40..43 {
            view.add_track(Point2::new(h as f64, 0.0), vec![h as u8; 32], h);
        }
        tracking.push_view(view);
        let mut features = current_features(&s, &moved_pose());
        for h in 40..43 {
            features.keypoints.push(Point2::new(h as f64, 1.0));
            features.descriptors.push(vec![h as u8; 32]);
        }

        let mut out = TrackView::new(1, 1);
        let status = tracking.find_recovered_camera_pose(
            &HammingMatcher::default(),
            100,
            8,
            &camera(),
            &features,
            &mut recovery(3),
            &mut out,
            &s.cloud,
        );
        assert_eq!(status, AbsolutePoseStatus::InsufficientCorrespondences(5));
        assert_eq!(out.num_mapped(), 5);
    }

    fn triangulation(n: usize) -> Triangulation {
        Triangulation {
            points: (0..n).map(|i| Point3::new(i as f64, 0.0, 5.0)).collect(),
            colors: vec![[1, 2, 3]; n],
            mask: (0..n).map(|i| i != 1).collect(),
            prev_pixels: (0..n).map(|i| Point2::new(i as f64, 0.0)).collect(),
            curr_pixels: (0..n).map(|i| Point2::new(i as f64, 1.0)).collect(),
        }
    }

    #[test]
    fn test_add_track_view() {
        let mut cloud = PointCloud::new(FilterConfig::default());
        let mut tracking = Tracking::new(&TrackingConfig::default());
        let features =
            FeatureSet::from_corners((0..3).map(|i| Point2::new(i as f64, 1.0)).collect());

        let added = tracking.add_track_view(
            &mut cloud,
            TrackView::new(1, 1),
            &triangulation(3),
            &features,
            &[0, 1, 2],
            0,
        );
        assert_eq!(added, 2);
        assert_eq!(cloud.len(), 2);
        assert_eq!(tracking.active_layer, 1);
        let point = cloud.get(0).unwrap();
        assert_eq!(point.views.len(), 2);
        assert_eq!(point.views[0].pose, 1);
        assert_eq!(point.views[1].pose, 0);
        assert_eq!(point.color, [1, 2, 3]);

        let view = tracking.last_view().unwrap();
        assert_eq!(view.handles, vec![0, 1]);
        assert_eq!(view.cloud_handle(Point2::new(2.0, 1.0)), Some(1));
    }

    #[test]
    fn test_second_registration_adds_one_view() {
        let mut cloud = PointCloud::new(FilterConfig::default());
        let mut tracking = Tracking::new(&TrackingConfig::default());
        let features = FeatureSet::from_corners(vec![Point2::new(0.0, 1.0)]);
        let mut tri = triangulation(2);
        tri.mask = vec![true, true];

        // both triangulated points come from the same keypoint
        tracking.add_track_view(&mut cloud, TrackView::new(1, 1), &tri, &features, &[0, 0], 0);
        assert_eq!(cloud.len(), 1);
        assert_eq!(cloud.get(0).unwrap().views.len(), 3);
        assert_eq!(tracking.last_view().unwrap().handles, vec![0, 0]);
    }

    #[test]
    fn test_claimed_pixels_reuse_cloud_points() {
        let mut cloud = PointCloud::new(FilterConfig::default());
        let existing = cloud.add_cloud_point(
            Observation {
                pose: 0,
                pixel: Point2::new(0.0, 0.0),
            },
            Point3::new(0.0, 0.0, 4.0),
            [9, 9, 9],
        );
        let mut tracking = Tracking::new(&TrackingConfig::default());
        let features = FeatureSet::from_corners(vec![Point2::new(0.0, 1.0), Point2::new(2.0, 1.0)]);
        let mut view = TrackView::new(2, 2);
        view.claim(features.keypoints[0], existing);
        let mut tri = triangulation(2);
        tri.mask = vec![true, true];

        tracking.add_track_view(&mut cloud, view, &tri, &features, &[0, 1], 1);
        assert_eq!(cloud.len(), 2);
        let old = cloud.get(existing).unwrap();
        assert_eq!(old.views.len(), 2);
        assert_eq!(old.position, Point3::new(0.0, 0.0, 4.0));
        assert_eq!(old.views[1].pose, 2);
    }

    #[test]
    fn test_history_ring_buffer() {
        let mut tracking = Tracking::new(&TrackingConfig {
            history_capacity: 3,
            ..TrackingConfig::default()
        });
        for i in 0..5 {
            tracking.push_view(TrackView::new(i, i));
        }
        assert_eq!(tracking.num_views(), 3);
        assert_eq!(tracking.active_layer, 5);
        let frames: Vec<_> = tracking.history().map(|v| v.frame_index).collect();
        assert_eq!(frames, vec![2, 3, 4]);
    }

    #[test]
    fn test_compose_odometry() {
        let mut data = CameraData::new(camera());
        data.push_pose(Pose::identity());
        let rel = Pose::new(
            Matrix3::from_axis_angle(Vector3::unit_y(), Deg(2.0)),
            Vector3::new(-1.0, 0.0, 0.0),
        );
        let h1 = compose_odometry(&mut data, &rel);
        let h2 = compose_odometry(&mut data, &rel);
        assert_eq!((h1, h2), (1, 2));
        let expected = rel.compose(&rel);
        let p2 = data.pose(h2).unwrap();
        assert!(p2.rotation.abs_diff_eq(&expected.rotation, 1e-12));
        assert!(p2.translation.abs_diff_eq(&expected.translation, 1e-12));
    }
}
