//! Keypoints, binary descriptors and descriptor matching.

use cgmath::Point2;
use rayon::prelude::*;

use crate::frame::Frame;

/// Binary descriptor compared by Hamming distance.
pub type Descriptor = Vec<u8>;

/// Keypoints of one frame with their descriptors. `descriptors` is either empty (plain corners)
/// or parallel to `keypoints`.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Point2<f64>>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<Point2<f64>>, descriptors: Vec<Descriptor>) -> Self {
        FeatureSet {
            keypoints,
            descriptors,
        }
    }

    pub fn from_corners(keypoints: Vec<Point2<f64>>) -> Self {
        FeatureSet {
            keypoints,
            descriptors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Descriptor of keypoint `i`, empty when the set carries none.
    pub fn descriptor(&self, i: usize) -> Descriptor {
        self.descriptors.get(i).cloned().unwrap_or_default()
    }
}

/// `query` indexes the first descriptor list, `train` the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

pub trait FeatureMatcher {
    /// Matches that survive the matcher's outlier tests.
    fn find_robust_matches(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<FeatureMatch>;
}

/// Detection, description and optical flow.
pub trait FeatureProvider {
    /// Keypoints with descriptors.
    fn detect(&mut self, frame: &Frame) -> FeatureSet;
    /// Corners to track with optical flow.
    fn corners(&mut self, frame: &Frame) -> Vec<Point2<f64>>;
    /// Track `corners` from `prev` into `curr`. Returns the surviving corners in both frames.
    fn track(
        &mut self,
        prev: &Frame,
        curr: &Frame,
        corners: &[Point2<f64>],
    ) -> (Vec<Point2<f64>>, Vec<Point2<f64>>);
}

pub fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

// best and second best distance with the index of the best
fn two_nearest(d: &[u8], candidates: &[Descriptor]) -> Option<(usize, u32, Option<u32>)> {
    let mut best: Option<(usize, u32)> = None;
    let mut second: Option<u32> = None;
    for (i, c) in candidates.iter().enumerate() {
        let dist = hamming(d, c);
        match best {
            Some((_, b)) if dist >= b => {
                if second.map_or(true, |s| dist < s) {
                    second = Some(dist);
                }
            }
            _ => {
                second = best.map(|(_, b)| b);
                best = Some((i, dist));
            }
        }
    }
    best.map(|(i, b)| (i, b, second))
}

/// Brute force matcher with Lowe's ratio test and a symmetric (cross) check.
#[derive(Debug, Clone)]
pub struct HammingMatcher {
    pub ratio: f64,
    pub max_distance: u32,
}

impl Default for HammingMatcher {
    fn default() -> Self {
        HammingMatcher {
            ratio: 0.8,
            max_distance: 64,
        }
    }
}

impl HammingMatcher {
    fn ratio_matches(
        &self,
        query: &[Descriptor],
        train: &[Descriptor],
    ) -> Vec<Option<(usize, u32)>> {
        query
            .par_iter()
            .map(|q| {
                let (i, best, second) = two_nearest(q, train)?;
                if best > self.max_distance {
                    return None;
                }
                match second {
                    Some(s) if best as f64 >= self.ratio * s as f64 => None,
                    _ => Some((i, best)),
                }
            })
            .collect()
    }
}

impl FeatureMatcher for HammingMatcher {
    fn find_robust_matches(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<FeatureMatch> {
        let forward = self.ratio_matches(query, train);
        let backward = self.ratio_matches(train, query);
        forward
            .into_iter()
            .enumerate()
            .filter_map(|(q, m)| {
                let (t, distance) = m?;
                match backward[t] {
                    Some((back, _)) if back == q => Some(FeatureMatch {
                        query: q,
                        train: t,
                        distance,
                    }),
                    _ => None,
                }
            })
            .collect()
    }
}
