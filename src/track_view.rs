//! Per-frame record of which keypoints map to which cloud points.

use cgmath::Point2;
use std::collections::HashMap;

use crate::camera::PoseHandle;
use crate::features::Descriptor;
use crate::point_cloud::CloudHandle;

/// Pixel positions are compared at 1/64 pixel resolution.
const PIXEL_QUANTUM: f64 = 64.0;

/// Quantized pixel position used as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelKey(i64, i64);

impl PixelKey {
    pub fn new(p: Point2<f64>) -> Self {
        PixelKey(
            (p.x * PIXEL_QUANTUM).round() as i64,
            (p.y * PIXEL_QUANTUM).round() as i64,
        )
    }
}

/// Observations of one frame and their cloud handles.
///
/// `keypoints`, `descriptors` and `handles` are parallel arrays. Within a view a quantized pixel
/// refers to exactly one cloud handle.
#[derive(Debug, Clone)]
pub struct TrackView {
    pub frame_index: usize,
    /// Pose of the frame in the camera chain.
    pub pose: PoseHandle,
    pub keypoints: Vec<Point2<f64>>,
    pub descriptors: Vec<Descriptor>,
    pub handles: Vec<CloudHandle>,
    pixel_map: HashMap<PixelKey, CloudHandle>,
}

impl TrackView {
    pub fn new(frame_index: usize, pose: PoseHandle) -> Self {
        TrackView {
            frame_index,
            pose,
            keypoints: Vec::new(),
            descriptors: Vec::new(),
            handles: Vec::new(),
            pixel_map: HashMap::new(),
        }
    }

    /// Append an observation and map its pixel to `handle`.
    pub fn add_track(
        &mut self,
        keypoint: Point2<f64>,
        descriptor: Descriptor,
        handle: CloudHandle,
    ) {
        self.keypoints.push(keypoint);
        self.descriptors.push(descriptor);
        self.handles.push(handle);
        self.pixel_map.insert(PixelKey::new(keypoint), handle);
    }

    /// Cloud point already associated with `pixel` in this view.
    pub fn cloud_handle(&self, pixel: Point2<f64>) -> Option<CloudHandle> {
        self.pixel_map.get(&PixelKey::new(pixel)).cloned()
    }

    /// Reserve `pixel` for `handle` without adding an observation. Returns false if the pixel was
    /// already taken.
    pub fn claim(&mut self, pixel: Point2<f64>, handle: CloudHandle) -> bool {
        let key = PixelKey::new(pixel);
        if self.pixel_map.contains_key(&key) {
            return false;
        }
        self.pixel_map.insert(key, handle);
        true
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Number of distinct pixels mapped, including claimed ones.
    pub fn num_mapped(&self) -> usize {
        self.pixel_map.len()
    }
}

#[test]
fn test_pixel_quantization() {
    assert_eq!(
        PixelKey::new(Point2::new(10.0, 20.0)),
        PixelKey::new(Point2::new(10.001, 19.999))
    );
    assert_ne!(
        PixelKey::new(Point2::new(10.0, 20.0)),
        PixelKey::new(Point2::new(10.05, 20.0))
    );
}

#[test]
fn test_add_track_and_claim() {
    let mut view = TrackView::new(3, 1);
    let p = Point2::new(100.5, 42.25);
    assert_eq!(view.cloud_handle(p), None);
    view.add_track(p, vec![1, 2, 3], 7);
    assert_eq!(view.cloud_handle(p), Some(7));
    assert_eq!(view.len(), 1);

    let q = Point2::new(5.0, 5.0);
    assert!(view.claim(q, 9));
    assert!(!view.claim(q, 10));
    assert!(!view.claim(p, 11));
    assert_eq!(view.cloud_handle(q), Some(9));
    assert_eq!(view.len(), 1);
    assert_eq!(view.num_mapped(), 2);
}
