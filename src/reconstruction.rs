//! Triangulation of new points and bundle adjustment of the whole reconstruction.

use cgmath::{Point2, Point3};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::camera::{CameraData, CameraParameters, Pose};
use crate::config::{BundleConfig, TriangulationConfig};
use crate::frame::Frame;
use crate::geometry::{
    pixel_projection_matrix, projection_matrix, reprojection_error, triangulate_point,
};
use crate::point_cloud::{CloudHandle, PointCloud};
use crate::solver::{solve, BundleProblem, Residual, SolverSummary};

/// Points triangulated from two views. All vectors are parallel to the input correspondences;
/// `mask[i]` tells whether point `i` passed validation. Pixels are undistorted.
#[derive(Debug, Clone, PartialEq)]
pub struct Triangulation {
    pub points: Vec<Point3<f64>>,
    pub colors: Vec<[u8; 3]>,
    pub mask: Vec<bool>,
    pub prev_pixels: Vec<Point2<f64>>,
    pub curr_pixels: Vec<Point2<f64>>,
}

impl Triangulation {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn num_valid(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }
}

/// Result of [Reconstruction::adjust_bundle].
#[derive(Debug, Clone)]
pub enum BundleOutcome {
    /// The refined cameras and points were written back.
    Adjusted(SolverSummary),
    /// The solution was worse than the input and discarded.
    Rejected(SolverSummary),
    /// Nothing to optimize.
    Degenerate,
}

impl BundleOutcome {
    pub fn is_adjusted(&self) -> bool {
        match self {
            BundleOutcome::Adjusted(_) => true,
            _ => false,
        }
    }

    pub fn summary(&self) -> Option<&SolverSummary> {
        match self {
            BundleOutcome::Adjusted(s) | BundleOutcome::Rejected(s) => Some(s),
            BundleOutcome::Degenerate => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub triangulation: TriangulationConfig,
    pub bundle: BundleConfig,
}

impl Reconstruction {
    pub fn new(triangulation: TriangulationConfig, bundle: BundleConfig) -> Self {
        Reconstruction {
            triangulation,
            bundle,
        }
    }

    /// Triangulate raw pixel correspondences between the cameras at `prev_pose` and `curr_pose`.
    /// A point is valid when its worse reprojection error is below `max_projection_error` and its
    /// depth in the current camera lies strictly between `min_distance` and `max_distance`.
    pub fn triangulate_cloud(
        &self,
        camera: &CameraParameters,
        prev_pts: &[Point2<f64>],
        curr_pts: &[Point2<f64>],
        color: &Frame,
        prev_pose: &Pose,
        curr_pose: &Pose,
    ) -> Triangulation {
        let config = &self.triangulation;
        let n = prev_pts.len().min(curr_pts.len());
        let (p0, p1) = if config.use_normalized_points {
            (projection_matrix(prev_pose), projection_matrix(curr_pose))
        } else {
            (
                pixel_projection_matrix(camera, prev_pose),
                pixel_projection_matrix(camera, curr_pose),
            )
        };

        let triangulated: Vec<(Point3<f64>, bool, Point2<f64>, Point2<f64>)> = (0..n)
            .into_par_iter()
            .map(|i| {
                let u0 = camera.undistort_pixel(prev_pts[i]);
                let u1 = camera.undistort_pixel(curr_pts[i]);
                let (x0, x1) = if config.use_normalized_points {
                    (camera.normalize(u0), camera.normalize(u1))
                } else {
                    (u0, u1)
                };
                match triangulate_point(config.method, &p0, &p1, x0, x1) {
                    Some(x) => {
                        let error = reprojection_error(camera, prev_pose, x, u0)
                            .max(reprojection_error(camera, curr_pose, x, u1));
                        let depth = curr_pose.depth(x);
                        let valid = error < config.max_projection_error
                            && depth > config.min_distance
                            && depth < config.max_distance;
                        (x, valid, u0, u1)
                    }
                    None => (Point3::new(0.0, 0.0, 0.0), false, u0, u1),
                }
            })
            .collect();

        let mut out = Triangulation {
            points: Vec::with_capacity(n),
            colors: Vec::with_capacity(n),
            mask: Vec::with_capacity(n),
            prev_pixels: Vec::with_capacity(n),
            curr_pixels: Vec::with_capacity(n),
        };
        for (i, (x, valid, u0, u1)) in triangulated.into_iter().enumerate() {
            out.points.push(x);
            out.colors.push(color.sample_color(curr_pts[i]));
            out.mask.push(valid);
            out.prev_pixels.push(u0);
            out.curr_pixels.push(u1);
        }
        debug!("triangulated {} of {} points", out.num_valid(), n);
        out
    }

    /// Jointly refine camera poses and active cloud points. The first referenced pose and the
    /// intrinsics stay fixed. The refinement is only written back if it lowers the reprojection
    /// RMSE and stays below `max_rmse`.
    pub fn adjust_bundle(
        &self,
        camera_data: &mut CameraData,
        cloud: &mut PointCloud,
    ) -> BundleOutcome {
        let num_poses = camera_data.num_poses();
        let mut handles: Vec<CloudHandle> = Vec::new();
        let mut points = Vec::new();
        let mut residuals = Vec::new();
        let mut referenced = vec![false; num_poses];
        for (handle, point) in cloud.iter_active() {
            let mut observed = false;
            for obs in point.views.iter().filter(|o| o.pose < num_poses) {
                residuals.push(Residual {
                    camera: obs.pose,
                    point: handles.len(),
                    pixel: obs.pixel,
                });
                referenced[obs.pose] = true;
                observed = true;
            }
            if observed {
                handles.push(handle);
                points.push(point.position);
            }
        }

        let first = match referenced.iter().position(|r| *r) {
            Some(first) => first,
            None => {
                debug!("bundle adjustment skipped: no residuals");
                return BundleOutcome::Degenerate;
            }
        };
        let constant: Vec<bool> = referenced
            .iter()
            .enumerate()
            .map(|(i, r)| !r || i == first)
            .collect();
        let intrinsics = &camera_data.intrinsics;
        let mut problem = BundleProblem {
            intrinsics: [intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy],
            cameras: camera_data.extrinsics.clone(),
            constant,
            points,
            residuals,
        };
        if problem.num_free_cameras() == 0 {
            debug!("bundle adjustment skipped: no free camera");
            return BundleOutcome::Degenerate;
        }

        debug!(
            "bundle adjustment: {} cameras ({} free), {} points, {} observations",
            num_poses,
            problem.num_free_cameras(),
            handles.len(),
            problem.residuals.len()
        );
        for handle in &handles {
            cloud.mark_updated(*handle);
        }
        let summary = solve(&mut problem, &self.bundle);
        let initial = summary.initial_rmse();
        let final_ = summary.final_rmse();
        if !summary.is_usable() || final_ > initial || final_ > self.bundle.max_rmse {
            warn!(
                "discarding bundle adjustment: {:?}, rmse {:.4} -> {:.4}",
                summary.termination, initial, final_
            );
            return BundleOutcome::Rejected(summary);
        }

        for (i, pose) in problem.cameras.iter().enumerate() {
            if !problem.constant[i] {
                camera_data.extrinsics[i] = *pose;
            }
        }
        for (handle, position) in handles.iter().zip(&problem.points) {
            cloud.set_position(*handle, *position);
        }
        camera_data.intrinsics.fx = problem.intrinsics[0];
        camera_data.intrinsics.fy = problem.intrinsics[1];
        let mut counter = vec![0; num_poses];
        for r in &problem.residuals {
            counter[r.camera] += 1;
        }
        camera_data.extrinsics_counter = counter;

        info!("bundle adjustment: {}", summary);
        BundleOutcome::Adjusted(summary)
    }
}
