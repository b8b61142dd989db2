//! Per-frame reconstruction loop.
//!
//! All mutable reconstruction state lives in [Context]; the pipeline stages borrow the parts they
//! need. A frame is integrated only after a usable relative pose to the previous integrated frame
//! was found.

use cgmath::{Point2, Point3};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::camera::{CameraData, CameraParameters, Pose, PoseHandle};
use crate::config::{Config, Mode};
use crate::error::Result;
use crate::export::write_ply;
use crate::features::{FeatureMatcher, FeatureProvider, FeatureSet, HammingMatcher};
use crate::frame::{Frame, FrameSource, FrameStatus, FrameStore};
use crate::point_cloud::PointCloud;
use crate::reconstruction::{BundleOutcome, Reconstruction};
use crate::recovery_pose::RecoveryPose;
use crate::track_view::TrackView;
use crate::tracking::{compose_odometry, push_pose, Tracking};

/// Reconstruction state shared by the stages.
#[derive(Debug, Clone)]
pub struct Context {
    pub camera_data: CameraData,
    pub cloud: PointCloud,
    pub tracking: Tracking,
    pub frames: FrameStore,
}

impl Context {
    pub fn new(camera: CameraParameters, config: &Config) -> Self {
        Context {
            camera_data: CameraData::new(camera),
            cloud: PointCloud::new(config.filter.clone()),
            tracking: Tracking::new(&config.tracking),
            frames: FrameStore::new(config.pipeline.frame_capacity),
        }
    }
}

/// Read-only copy of the reconstruction handed to sinks.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub frame_index: usize,
    pub points: Vec<Point3<f64>>,
    pub colors: Vec<[u8; 3]>,
    pub cameras: Vec<Pose>,
}

impl Snapshot {
    pub fn new(frame_index: usize, context: &Context) -> Self {
        let (points, colors) = context
            .cloud
            .iter_active()
            .map(|(_, p)| (p.position, p.color))
            .unzip();
        Snapshot {
            frame_index,
            points,
            colors,
            cameras: context.camera_data.extrinsics.clone(),
        }
    }
}

/// Consumer of reconstruction snapshots.
pub trait Sink {
    fn consume(&mut self, snapshot: &Snapshot) -> Result<()>;
}

pub struct NullSink;

impl Sink for NullSink {
    fn consume(&mut self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }
}

/// Writes `<prefix>_<frame>.ply` into a directory for every snapshot.
pub struct PlySink {
    pub directory: PathBuf,
    pub prefix: String,
}

impl Sink for PlySink {
    fn consume(&mut self, snapshot: &Snapshot) -> Result<()> {
        let path = self
            .directory
            .join(format!("{}_{:05}.ply", self.prefix, snapshot.frame_index));
        let centers: Vec<_> = snapshot.cameras.iter().map(|c| c.center()).collect();
        write_ply(&path, &snapshot.points, Some(&snapshot.colors[..]), &centers)
    }
}

/// A frame that can be integrated together with its correspondences to the previous frame.
#[derive(Debug)]
pub struct FramePair {
    pub frame: Frame,
    pub prev_pts: Vec<Point2<f64>>,
    pub curr_pts: Vec<Point2<f64>>,
    /// Motion from the previous frame with unit baseline.
    pub relative: Pose,
    pub inlier_mask: Vec<bool>,
    pub inliers: usize,
}

#[derive(Debug)]
pub enum ImageFindState {
    Found(FramePair),
    /// `max_skipped_frames` frames were dropped without finding a usable pose.
    NotFound,
    SourceLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The first frame was stored as the reference.
    Initialized,
    Integrated {
        frame: usize,
        inliers: usize,
        tracks: usize,
    },
    /// No frame could be integrated in this step.
    Skipped,
    Finished,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub frames_read: usize,
    pub frames_integrated: usize,
    pub frames_skipped: usize,
    pub bundle_adjustments: usize,
    pub rejected_adjustments: usize,
    pub filtered_points: usize,
    pub cloud_size: usize,
    pub active_points: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Read {} frames, integrated {}, skipped {}. {} bundle adjustments ({} rejected). \
             Cloud has {} points ({} active, {} filtered)",
            self.frames_read,
            self.frames_integrated,
            self.frames_skipped,
            self.bundle_adjustments,
            self.rejected_adjustments,
            self.cloud_size,
            self.active_points,
            self.filtered_points
        )
    }
}

pub struct Pipeline {
    pub config: Config,
    pub context: Context,
    recovery: RecoveryPose,
    reconstruction: Reconstruction,
    matcher: HammingMatcher,
    corners: Vec<Point2<f64>>,
    prev_pose: PoseHandle,
    summary: RunSummary,
}

impl Pipeline {
    pub fn new(camera: CameraParameters, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Pipeline {
            context: Context::new(camera, &config),
            recovery: RecoveryPose::new(config.pose.clone()),
            reconstruction: Reconstruction::new(
                config.triangulation.clone(),
                config.bundle.clone(),
            ),
            matcher: HammingMatcher::default(),
            corners: Vec::new(),
            prev_pose: 0,
            summary: RunSummary::default(),
            config,
        })
    }

    pub fn with_matcher(mut self, matcher: HammingMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = self.summary.clone();
        summary.cloud_size = self.context.cloud.len();
        summary.active_points = self.context.cloud.num_active();
        summary
    }

    /// Acquire frames until one has a usable relative pose to the previous integrated frame.
    pub fn find_good_images(
        &mut self,
        source: &mut dyn FrameSource,
        provider: &mut dyn FeatureProvider,
    ) -> ImageFindState {
        let prev = match self.context.frames.latest() {
            Some(prev) => prev,
            None => return ImageFindState::SourceLost,
        };
        let camera = &self.context.camera_data.intrinsics;
        let min_inliers = self.config.pose.min_inliers;

        for _ in 0..=self.config.pipeline.max_skipped_frames {
            let frame = match source.next_frame() {
                FrameStatus::Frame(frame) => frame,
                FrameStatus::Exhausted => return ImageFindState::SourceLost,
            };
            self.summary.frames_read += 1;

            if self.corners.len() < self.config.pipeline.min_flow_features {
                self.corners = provider.corners(prev);
            }
            let (prev_pts, curr_pts) = provider.track(prev, &frame, &self.corners);
            let (found, inliers) = self.context.tracking.find_camera_pose(
                &mut self.recovery,
                &prev_pts,
                &curr_pts,
                camera,
                min_inliers,
            );
            if found {
                return ImageFindState::Found(FramePair {
                    frame,
                    prev_pts,
                    curr_pts,
                    relative: self.recovery.pose,
                    inlier_mask: self.recovery.mask.clone(),
                    inliers,
                });
            }
            debug!(
                "frame {}: no usable pose ({} tracked, {} inliers)",
                frame.index,
                prev_pts.len(),
                inliers
            );
            self.summary.frames_skipped += 1;
        }
        ImageFindState::NotFound
    }

    /// Process the next frame (or frames) from `source`.
    pub fn step(
        &mut self,
        source: &mut dyn FrameSource,
        provider: &mut dyn FeatureProvider,
        sink: &mut dyn Sink,
    ) -> Result<StepOutcome> {
        if self.context.frames.is_empty() {
            return Ok(match source.next_frame() {
                FrameStatus::Exhausted => StepOutcome::Finished,
                FrameStatus::Frame(frame) => {
                    self.summary.frames_read += 1;
                    self.prev_pose = push_pose(&mut self.context.camera_data, Pose::identity());
                    self.corners = provider.corners(&frame);
                    info!("frame {}: reference frame", frame.index);
                    self.context.frames.push(frame);
                    StepOutcome::Initialized
                }
            });
        }

        let pair = match self.find_good_images(source, provider) {
            ImageFindState::Found(pair) => pair,
            ImageFindState::NotFound => {
                warn!(
                    "no usable frame after {} attempts",
                    self.config.pipeline.max_skipped_frames + 1
                );
                self.corners.clear();
                return Ok(StepOutcome::Skipped);
            }
            ImageFindState::SourceLost => return Ok(StepOutcome::Finished),
        };

        let integrated = match self.config.pipeline.mode {
            Mode::Odometry => Some(self.integrate_odometry(&pair)),
            Mode::Localization => self.integrate_localization(&pair, provider),
        };
        let (pose, tracks) = match integrated {
            Some(result) => result,
            None => {
                self.summary.frames_skipped += 1;
                return Ok(StepOutcome::Skipped);
            }
        };

        self.corners = pair.curr_pts.clone();
        let frame_index = pair.frame.index;
        self.context.frames.push(pair.frame);
        self.prev_pose = pose;
        self.summary.frames_integrated += 1;
        self.periodic_refinement();

        sink.consume(&Snapshot::new(frame_index, &self.context))?;
        Ok(StepOutcome::Integrated {
            frame: frame_index,
            inliers: pair.inliers,
            tracks,
        })
    }

    /// Run until the source is exhausted.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        provider: &mut dyn FeatureProvider,
        sink: &mut dyn Sink,
    ) -> Result<RunSummary> {
        while self.step(source, provider, sink)? != StepOutcome::Finished {}
        let summary = self.summary();
        info!("{}", summary);
        Ok(summary)
    }

    fn periodic_refinement(&mut self) {
        let n = self.summary.frames_integrated;
        let pipeline = &self.config.pipeline;
        if pipeline.ba_interval > 0 && n % pipeline.ba_interval == 0 {
            self.summary.bundle_adjustments += 1;
            let outcome = self
                .reconstruction
                .adjust_bundle(&mut self.context.camera_data, &mut self.context.cloud);
            match outcome {
                BundleOutcome::Adjusted(_) => {}
                BundleOutcome::Rejected(_) => self.summary.rejected_adjustments += 1,
                BundleOutcome::Degenerate => self.summary.bundle_adjustments -= 1,
            }
        }
        if pipeline.filter_interval > 0 && n % pipeline.filter_interval == 0 {
            self.summary.filtered_points += self.context.cloud.filter_cloud();
        }
    }

    fn integrate_odometry(&mut self, pair: &FramePair) -> (PoseHandle, usize) {
        let ctx = &mut self.context;
        let pose = compose_odometry(&mut ctx.camera_data, &pair.relative);

        let (prev_pts, curr_pts): (Vec<_>, Vec<_>) = pair
            .prev_pts
            .iter()
            .zip(&pair.curr_pts)
            .zip(&pair.inlier_mask)
            .filter(|(_, inlier)| **inlier)
            .map(|((p, c), _)| (*p, *c))
            .unzip();
        let triangulated = self.reconstruction.triangulate_cloud(
            &ctx.camera_data.intrinsics,
            &prev_pts,
            &curr_pts,
            &pair.frame,
            &ctx.camera_data.extrinsics[self.prev_pose],
            &ctx.camera_data.extrinsics[pose],
        );
        let features = FeatureSet::from_corners(curr_pts);
        let keys: Vec<usize> = (0..features.len()).collect();
        let tracks = ctx.tracking.add_track_view(
            &mut ctx.cloud,
            TrackView::new(pair.frame.index, pose),
            &triangulated,
            &features,
            &keys,
            self.prev_pose,
        );
        (pose, tracks)
    }

    fn integrate_localization(
        &mut self,
        pair: &FramePair,
        provider: &mut dyn FeatureProvider,
    ) -> Option<(PoseHandle, usize)> {
        let ctx = &mut self.context;
        let prev_frame = ctx.frames.latest()?;
        let prev_features = provider.detect(prev_frame);
        let curr_features = provider.detect(&pair.frame);
        let matches = self
            .matcher
            .find_robust_matches(&prev_features.descriptors, &curr_features.descriptors);

        let next_handle = ctx.camera_data.num_poses();
        let mut view = TrackView::new(pair.frame.index, next_handle);
        let pose = if ctx.cloud.num_active() == 0 {
            compose_odometry(&mut ctx.camera_data, &pair.relative)
        } else {
            let status = ctx.tracking.find_recovered_camera_pose(
                &self.matcher,
                self.config.tracking.min_matches,
                self.config.tracking.max_history_frames,
                &ctx.camera_data.intrinsics,
                &curr_features,
                &mut self.recovery,
                &mut view,
                &ctx.cloud,
            );
            if !status.is_success() {
                warn!("frame {}: localization failed: {:?}", pair.frame.index, status);
                return None;
            }
            push_pose(&mut ctx.camera_data, self.recovery.pose)
        };

        let prev_pts: Vec<_> = matches
            .iter()
            .map(|m| prev_features.keypoints[m.query])
            .collect();
        let curr_pts: Vec<_> = matches
            .iter()
            .map(|m| curr_features.keypoints[m.train])
            .collect();
        let keys: Vec<usize> = matches.iter().map(|m| m.train).collect();
        let triangulated = self.reconstruction.triangulate_cloud(
            &ctx.camera_data.intrinsics,
            &prev_pts,
            &curr_pts,
            &pair.frame,
            &ctx.camera_data.extrinsics[self.prev_pose],
            &ctx.camera_data.extrinsics[pose],
        );
        let tracks = ctx.tracking.add_track_view(
            &mut ctx.cloud,
            view,
            &triangulated,
            &curr_features,
            &keys,
            self.prev_pose,
        );
        Some((pose, tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SceneConfig, SyntheticScene};

    fn scene() -> SyntheticScene {
        SyntheticScene::generate(&SceneConfig {
            num_frames: 6,
            num_points: 400,
            ..SceneConfig::default()
        })
    }

    fn config(mode: Mode) -> Config {
        let mut config = Config::default();
        config.pipeline.mode = mode;
        config.pipeline.min_flow_features = 100;
        config.pipeline.ba_interval = 3;
        config.pipeline.filter_interval = 0;
        config.pose.min_inliers = 30;
        config.tracking.min_matches = 30;
        config
    }

    #[test]
    fn test_odometry_run() {
        let scene = scene();
        let mut pipeline = Pipeline::new(scene.camera.clone(), config(Mode::Odometry)).unwrap();
        let summary = pipeline
            .run(&mut scene.source(), &mut scene.provider(), &mut NullSink)
            .unwrap();
        assert_eq!(summary.frames_read, 6);
        assert_eq!(summary.frames_integrated, 5);
        assert_eq!(summary.frames_skipped, 0);
        assert_eq!(pipeline.context.camera_data.num_poses(), 6);
        assert!(summary.active_points > 0);
        assert_eq!(pipeline.context.tracking.active_layer, 5);
        assert_eq!(
            pipeline.context.camera_data.extrinsics[0],
            Pose::identity()
        );
    }

    #[test]
    fn test_localization_run() {
        let scene = scene();
        let mut pipeline = Pipeline::new(scene.camera.clone(), config(Mode::Localization)).unwrap();
        let summary = pipeline
            .run(&mut scene.source(), &mut scene.provider(), &mut NullSink)
            .unwrap();
        assert_eq!(summary.frames_integrated, 5);
        assert_eq!(pipeline.context.camera_data.num_poses(), 6);
        // observations of earlier points are reused instead of duplicated
        assert!(pipeline.context.cloud.iter().any(|(_, p)| p.views.len() > 2));
    }

    #[test]
    fn test_static_camera_is_skipped() {
        let scene = SyntheticScene::generate(&SceneConfig {
            num_frames: 4,
            step: 0.0,
            yaw: 0.0,
            ..SceneConfig::default()
        });
        let mut cfg = config(Mode::Odometry);
        cfg.pipeline.max_skipped_frames = 1;
        let mut pipeline = Pipeline::new(scene.camera.clone(), cfg).unwrap();
        let mut source = scene.source();
        let mut provider = scene.provider();
        assert_eq!(
            pipeline.step(&mut source, &mut provider, &mut NullSink).unwrap(),
            StepOutcome::Initialized
        );
        assert_eq!(
            pipeline.step(&mut source, &mut provider, &mut NullSink).unwrap(),
            StepOutcome::Skipped
        );
        assert_eq!(
            pipeline.step(&mut source, &mut provider, &mut NullSink).unwrap(),
            StepOutcome::Finished
        );
        assert_eq!(pipeline.summary().frames_skipped, 3);
        assert!(pipeline.context.cloud.is_empty());
    }
}
