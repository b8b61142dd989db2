//! Deterministic synthetic image sequences with known geometry.
//!
//! A camera translates sideways (along +x) with a slight yaw in front of a slab of coloured points.
//! Frames are rendered by painting every visible point on a neutral background. Features are taken
//! from the ground truth projections, so no detector is needed.

use cgmath::prelude::*;
use cgmath::{Deg, Matrix3, Point2, Point3, Vector3};
use image::{Rgb, RgbImage};
use indicatif::ParallelProgressIterator;
use rand::distributions::{Distribution, Normal};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashMap;

use crate::camera::{CameraParameters, Pose};
use crate::features::{Descriptor, FeatureProvider, FeatureSet};
use crate::frame::{Frame, FrameSource, FrameStatus};
use crate::progress_bar;
use crate::track_view::PixelKey;

const DESCRIPTOR_BYTES: usize = 32;
const BACKGROUND: [u8; 3] = [128, 128, 128];

#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub num_frames: usize,
    pub num_points: usize,
    pub width: u32,
    pub height: u32,
    pub focal: f64,
    /// Distance the camera moves between consecutive frames.
    pub step: f64,
    /// Yaw change between consecutive frames in degrees.
    pub yaw: f64,
    /// Depth range of the point slab.
    pub min_depth: f64,
    pub max_depth: f64,
    /// Standard deviation of the Gaussian noise added to observed pixels.
    pub pixel_noise: f64,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        SceneConfig {
            num_frames: 10,
            num_points: 600,
            width: 640,
            height: 480,
            focal: 500.0,
            step: 0.25,
            yaw: 0.5,
            min_depth: 4.0,
            max_depth: 10.0,
            pixel_noise: 0.0,
            seed: 0,
        }
    }
}

/// Ground truth of a synthetic sequence plus the per-frame observations derived from it.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub config: SceneConfig,
    pub camera: CameraParameters,
    pub points: Vec<Point3<f64>>,
    pub colors: Vec<[u8; 3]>,
    pub descriptors: Vec<Descriptor>,
    /// World-to-camera pose of every frame.
    pub poses: Vec<Pose>,
    /// `observations[f][i]` is where frame `f` sees point `i`, if it does.
    pub observations: Vec<Vec<Option<Point2<f64>>>>,
    lookup: Vec<HashMap<PixelKey, usize>>,
}

impl SyntheticScene {
    pub fn generate(config: &SceneConfig) -> Self {
        Self::generate_verbose(config, false)
    }

    pub fn generate_verbose(config: &SceneConfig, verbose: bool) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let camera = CameraParameters::new(
            config.focal,
            config.focal,
            config.width as f64 / 2.0,
            config.height as f64 / 2.0,
        );

        let poses: Vec<Pose> = (0..config.num_frames)
            .map(|i| {
                Pose::from_center(
                    Matrix3::from_axis_angle(Vector3::unit_y(), Deg(-config.yaw * i as f64)),
                    Point3::new(config.step * i as f64, 0.0, 0.0),
                )
            })
            .collect();

        let half_w = 0.5 * config.width as f64 / config.focal * config.max_depth;
        let half_h = 0.5 * config.height as f64 / config.focal * config.max_depth;
        let travel = config.step * config.num_frames as f64;
        let mut points = Vec::with_capacity(config.num_points);
        let mut colors = Vec::with_capacity(config.num_points);
        let mut descriptors = Vec::with_capacity(config.num_points);
        for _ in 0..config.num_points {
            points.push(Point3::new(
                rng.gen_range(-half_w, half_w + travel),
                rng.gen_range(-half_h, half_h),
                rng.gen_range(config.min_depth, config.max_depth),
            ));
            colors.push([rng.gen(), rng.gen(), rng.gen()]);
            descriptors.push((0..DESCRIPTOR_BYTES).map(|_| rng.gen::<u8>()).collect());
        }

        let seeds: Vec<u64> = (0..config.num_frames).map(|_| rng.gen()).collect();
        let (width, height) = (config.width as f64, config.height as f64);
        let observations: Vec<Vec<Option<Point2<f64>>>> = poses
            .par_iter()
            .zip(seeds.par_iter())
            .progress_with(progress_bar(
                config.num_frames as u64,
                "Projecting points",
                verbose,
            ))
            .map(|(pose, seed)| {
                let mut frame_rng = StdRng::seed_from_u64(*seed);
                let noise = if config.pixel_noise > 0.0 {
                    Some(Normal::new(0.0, config.pixel_noise))
                } else {
                    None
                };
                points
                    .iter()
                    .map(|p| {
                        let pc = pose.transform(*p);
                        if pc.z <= 0.0 {
                            return None;
                        }
                        let mut u = camera.project(pc);
                        if let Some(n) = &noise {
                            u.x += n.sample(&mut frame_rng);
                            u.y += n.sample(&mut frame_rng);
                        }
                        if u.x >= 0.0 && u.x < width && u.y >= 0.0 && u.y < height {
                            Some(u)
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .collect();

        let lookup = observations
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .enumerate()
                    .filter_map(|(i, o)| o.map(|u| (PixelKey::new(u), i)))
                    .collect()
            })
            .collect();

        SyntheticScene {
            config: config.clone(),
            camera,
            points,
            colors,
            descriptors,
            poses,
            observations,
            lookup,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.poses.len()
    }

    /// Paint the points visible in frame `index`.
    pub fn render(&self, index: usize) -> Frame {
        let mut img = RgbImage::from_pixel(self.config.width, self.config.height, Rgb(BACKGROUND));
        if let Some(observed) = self.observations.get(index) {
            for (u, color) in observed.iter().zip(&self.colors) {
                if let Some(u) = u {
                    let x = (u.x.round() as u32).min(self.config.width - 1);
                    let y = (u.y.round() as u32).min(self.config.height - 1);
                    img.put_pixel(x, y, Rgb(*color));
                }
            }
        }
        Frame::new(index, img)
    }

    pub fn source(&self) -> SyntheticSource<'_> {
        SyntheticSource {
            scene: self,
            next: 0,
        }
    }

    pub fn provider(&self) -> SyntheticProvider<'_> {
        SyntheticProvider { scene: self }
    }

    /// Point seen at `pixel` in frame `index`.
    pub fn point_at(&self, index: usize, pixel: Point2<f64>) -> Option<usize> {
        self.lookup.get(index)?.get(&PixelKey::new(pixel)).cloned()
    }
}

/// Renders the frames of a scene in order.
pub struct SyntheticSource<'a> {
    scene: &'a SyntheticScene,
    next: usize,
}

impl<'a> FrameSource for SyntheticSource<'a> {
    fn next_frame(&mut self) -> FrameStatus {
        if self.next >= self.scene.num_frames() {
            return FrameStatus::Exhausted;
        }
        self.next += 1;
        FrameStatus::Frame(self.scene.render(self.next - 1))
    }
}

/// Feature detection and optical flow from the ground truth observations.
pub struct SyntheticProvider<'a> {
    scene: &'a SyntheticScene,
}

impl<'a> FeatureProvider for SyntheticProvider<'a> {
    fn detect(&mut self, frame: &Frame) -> FeatureSet {
        let mut features = FeatureSet::default();
        if let Some(observed) = self.scene.observations.get(frame.index) {
            for (i, u) in observed.iter().enumerate() {
                if let Some(u) = u {
                    features.keypoints.push(*u);
                    features.descriptors.push(self.scene.descriptors[i].clone());
                }
            }
        }
        features
    }

    fn corners(&mut self, frame: &Frame) -> Vec<Point2<f64>> {
        match self.scene.observations.get(frame.index) {
            Some(observed) => observed.iter().filter_map(|u| *u).collect(),
            None => Vec::new(),
        }
    }

    fn track(
        &mut self,
        prev: &Frame,
        curr: &Frame,
        corners: &[Point2<f64>],
    ) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
        let mut prev_pts = Vec::new();
        let mut curr_pts = Vec::new();
        let observed = match self.scene.observations.get(curr.index) {
            Some(observed) => observed,
            None => return (prev_pts, curr_pts),
        };
        for corner in corners {
            let next = self
                .scene
                .point_at(prev.index, *corner)
                .and_then(|i| observed[i]);
            if let Some(next) = next {
                prev_pts.push(*corner);
                curr_pts.push(next);
            }
        }
        (prev_pts, curr_pts)
    }
}
