//! Incremental monocular structure from motion.
//!
//! Frames are consumed one at a time. Each frame is tracked against the previous one, its pose is
//! recovered (two-view odometry or PnP against the existing cloud), new points are triangulated
//! and the poses and points are periodically refined by bundle adjustment.
//!
//! ```
//! use vid2cloud::config::Config;
//! use vid2cloud::pipeline::{NullSink, Pipeline};
//! use vid2cloud::synthetic::{SceneConfig, SyntheticScene};
//!
//! let scene = SyntheticScene::generate(&SceneConfig {
//!     num_frames: 4,
//!     ..SceneConfig::default()
//! });
//! let mut config = Config::default();
//! config.pipeline.min_flow_features = 100;
//! let mut pipeline = Pipeline::new(scene.camera.clone(), config).unwrap();
//! let summary = pipeline
//!     .run(&mut scene.source(), &mut scene.provider(), &mut NullSink)
//!     .unwrap();
//! assert_eq!(summary.frames_read, 4);
//! ```

extern crate nalgebra as na;

use indicatif::{ProgressBar, ProgressStyle};

pub mod camera;
pub mod config;
pub mod error;
pub mod export;
pub mod features;
pub mod frame;
pub mod geometry;
pub mod logger;
pub mod pipeline;
pub mod point_cloud;
pub mod reconstruction;
pub mod recovery_pose;
pub mod solver;
pub mod synthetic;
pub mod track_view;
pub mod tracking;

pub use error::{Error, Result};

/// Progress bar that is hidden unless `verbose` is set.
pub fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {percent}% ({eta})")
            .progress_chars("#-"),
    );
    pb.set_message(message);
    pb
}
