//! Two-view and absolute pose estimation with a fixed configuration.

use cgmath::prelude::*;
use cgmath::{Point2, Point3, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::camera::{CameraParameters, Pose};
use crate::config::PoseConfig;
use crate::geometry::*;

/// Two-view estimation needs at least this many correspondences.
pub const MIN_RELATIVE_CORRESPONDENCES: usize = MIN_ESSENTIAL_POINTS;
/// Absolute pose estimation needs at least this many 3D-2D pairs.
pub const MIN_ABSOLUTE_CORRESPONDENCES: usize = 7;
/// Largest algebraic epipolar residual tolerated on the first correspondence.
pub const MAX_EPIPOLAR_RESIDUAL: f64 = 1e-3;

/// Outcome of [RecoveryPose::estimate_relative].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelativePoseStatus {
    /// Pose recovered with this many cheirality inliers.
    Recovered(usize),
    InsufficientCorrespondences(usize),
    DegenerateEssential,
    EpipolarResidual(f64),
    TooFewInliers(usize),
}

impl RelativePoseStatus {
    pub fn is_success(&self) -> bool {
        match self {
            RelativePoseStatus::Recovered(_) => true,
            _ => false,
        }
    }

    /// Inliers of the estimate, zero when no essential matrix was found.
    pub fn inliers(&self) -> usize {
        match *self {
            RelativePoseStatus::Recovered(n) | RelativePoseStatus::TooFewInliers(n) => n,
            _ => 0,
        }
    }
}

/// Outcome of [RecoveryPose::estimate_absolute].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbsolutePoseStatus {
    Recovered(usize),
    InsufficientCorrespondences(usize),
    SolverFailed,
    TooFewInliers(usize),
}

impl AbsolutePoseStatus {
    pub fn is_success(&self) -> bool {
        match self {
            AbsolutePoseStatus::Recovered(_) => true,
            _ => false,
        }
    }

    pub fn inliers(&self) -> usize {
        match *self {
            AbsolutePoseStatus::Recovered(n) | AbsolutePoseStatus::TooFewInliers(n) => n,
            _ => 0,
        }
    }
}

/// Pose estimator holding the latest estimate and its inlier mask.
///
/// After a successful [estimate_relative](RecoveryPose::estimate_relative) `pose` is the motion
/// from the previous to the current camera with a unit baseline. After a successful
/// [estimate_absolute](RecoveryPose::estimate_absolute) it is the world-to-camera pose.
#[derive(Debug, Clone)]
pub struct RecoveryPose {
    pub config: PoseConfig,
    pub pose: Pose,
    pub mask: Vec<bool>,
    rng: StdRng,
}

impl RecoveryPose {
    pub fn new(config: PoseConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        RecoveryPose {
            config,
            pose: Pose::identity(),
            mask: Vec::new(),
            rng,
        }
    }

    pub fn min_inliers(&self) -> usize {
        self.config.min_inliers
    }

    /// Relative motion between two views from pixel correspondences. Succeeds only with more
    /// than `min_inliers` cheirality inliers.
    pub fn estimate_relative(
        &mut self,
        prev: &[Point2<f64>],
        curr: &[Point2<f64>],
        camera: &CameraParameters,
        min_inliers: usize,
    ) -> RelativePoseStatus {
        let n = prev.len().min(curr.len());
        if n < MIN_RELATIVE_CORRESPONDENCES || prev.len() != curr.len() {
            debug!("relative pose: only {} correspondences", n);
            return RelativePoseStatus::InsufficientCorrespondences(n);
        }

        let prev_n: Vec<_> = prev.iter().map(|p| camera.undistort_normalized(*p)).collect();
        let curr_n: Vec<_> = curr.iter().map(|p| camera.undistort_normalized(*p)).collect();
        let (fx, fy) = camera.focal();
        let threshold = self.config.threshold / (0.5 * (fx + fy));

        let estimate = match find_essential_mat(
            &prev_n,
            &curr_n,
            self.config.method,
            self.config.prob,
            threshold,
            self.config.num_iter,
            &mut self.rng,
        ) {
            Some(e) => e,
            None => {
                debug!("relative pose: no essential matrix from {} points", n);
                return RelativePoseStatus::DegenerateEssential;
            }
        };
        if !is_rank_valid(&estimate.matrix) {
            debug!("relative pose: essential matrix is not rank valid");
            return RelativePoseStatus::DegenerateEssential;
        }

        let x0 = Vector3::new(prev_n[0].x, prev_n[0].y, 1.0);
        let x1 = Vector3::new(curr_n[0].x, curr_n[0].y, 1.0);
        let residual = x1.dot(estimate.matrix * x0).abs();
        if residual > MAX_EPIPOLAR_RESIDUAL {
            debug!("relative pose: epipolar residual {:.3e}", residual);
            return RelativePoseStatus::EpipolarResidual(residual);
        }

        let recovered = match recover_pose(&estimate.matrix, &prev_n, &curr_n, &estimate.inliers)
        {
            Some(r) => r,
            None => return RelativePoseStatus::DegenerateEssential,
        };
        if recovered.num_inliers <= min_inliers {
            debug!(
                "relative pose: {} inliers, need more than {}",
                recovered.num_inliers, min_inliers
            );
            return RelativePoseStatus::TooFewInliers(recovered.num_inliers);
        }

        self.pose = recovered.pose;
        self.mask = recovered.inliers;
        RelativePoseStatus::Recovered(recovered.num_inliers)
    }

    /// World-to-camera pose from 3D cloud points and the pixels they were observed at.
    pub fn estimate_absolute(
        &mut self,
        points: &[Point3<f64>],
        pixels: &[Point2<f64>],
        camera: &CameraParameters,
    ) -> AbsolutePoseStatus {
        let n = points.len().min(pixels.len());
        if n < MIN_ABSOLUTE_CORRESPONDENCES || points.len() != pixels.len() {
            debug!("absolute pose: only {} correspondences", n);
            return AbsolutePoseStatus::InsufficientCorrespondences(n);
        }

        let ideal: Vec<_> = pixels.iter().map(|p| camera.undistort_pixel(*p)).collect();
        let guess = if self.config.use_extrinsic_guess {
            Some(self.pose)
        } else {
            None
        };
        let params = PnpParams {
            method: self.config.pnp_method,
            threshold: self.config.pnp_threshold,
        };
        let estimate =
            match solve_pnp_ransac(camera, points, &ideal, guess.as_ref(), &params, &mut self.rng) {
                Some(e) => e,
                None => {
                    debug!("absolute pose: ransac found no hypothesis");
                    return AbsolutePoseStatus::SolverFailed;
                }
            };
        if estimate.num_inliers <= self.config.min_inliers {
            debug!(
                "absolute pose: {} inliers, need more than {}",
                estimate.num_inliers, self.config.min_inliers
            );
            return AbsolutePoseStatus::TooFewInliers(estimate.num_inliers);
        }

        self.pose = estimate.pose;
        self.mask = estimate.inliers;
        AbsolutePoseStatus::Recovered(estimate.num_inliers)
    }
}
