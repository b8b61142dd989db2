//! Arena of reconstructed points addressed by stable handles.

use cgmath::prelude::*;
use cgmath::{Point2, Point3};
use rayon::prelude::*;
use rstar::RTree;
use tracing::debug;

use crate::camera::PoseHandle;
use crate::config::FilterConfig;

/// Index of a point in the cloud. Valid for the lifetime of the cloud.
pub type CloudHandle = usize;

/// A point seen by the camera at `pose` at (ideal pinhole) pixel `pixel`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub pose: PoseHandle,
    pub pixel: Point2<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloudPoint {
    pub position: Point3<f64>,
    pub color: [u8; 3],
    /// Every observation of the point, in insertion order. Never shrinks.
    pub views: Vec<Observation>,
    pub active: bool,
    /// How many bundle adjustments refined this point.
    pub updates: usize,
}

// wrapper to store points in the rtree
#[derive(Debug, PartialEq, Clone, Copy)]
struct IndexedPoint {
    id: CloudHandle,
    p: Point3<f64>,
}

impl rstar::Point for IndexedPoint {
    type Scalar = f64;
    const DIMENSIONS: usize = 3;

    fn generate(generator: impl Fn(usize) -> Self::Scalar) -> Self {
        IndexedPoint {
            id: usize::max_value(),
            p: Point3::new(generator(0), generator(1), generator(2)),
        }
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        match index {
            0 => self.p.x,
            1 => self.p.y,
            2 => self.p.z,
            _ => unreachable!(),
        }
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        match index {
            0 => &mut self.p.x,
            1 => &mut self.p.y,
            2 => &mut self.p.z,
            _ => unreachable!(),
        }
    }
}

/// Canonical store of reconstructed points. Entries are never removed or moved; filtering only
/// clears their `active` flag.
#[derive(Debug, Clone)]
pub struct PointCloud {
    points: Vec<CloudPoint>,
    num_active: usize,
    config: FilterConfig,
}

impl PointCloud {
    pub fn new(config: FilterConfig) -> Self {
        PointCloud {
            points: Vec::new(),
            num_active: 0,
            config,
        }
    }

    /// Allocate a new active point first seen at `observation`.
    pub fn add_cloud_point(
        &mut self,
        observation: Observation,
        position: Point3<f64>,
        color: [u8; 3],
    ) -> CloudHandle {
        self.points.push(CloudPoint {
            position,
            color,
            views: vec![observation],
            active: true,
            updates: 0,
        });
        self.num_active += 1;
        self.points.len() - 1
    }

    /// Record another observation of an existing point. Returns false for an unknown handle.
    pub fn register_cloud_view(&mut self, handle: CloudHandle, observation: Observation) -> bool {
        match self.points.get_mut(handle) {
            Some(point) => {
                point.views.push(observation);
                true
            }
            None => false,
        }
    }

    /// Statistical outlier removal over the active points. A point is deactivated when the mean
    /// distance to its `mean_k` nearest neighbours exceeds `mean + std_mul * std` of that
    /// quantity over all active points. Returns the number of deactivated points.
    pub fn filter_cloud(&mut self) -> usize {
        let k = self.config.mean_k;
        let active: Vec<IndexedPoint> = self
            .points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.active)
            .map(|(id, p)| IndexedPoint {
                id,
                p: p.position,
            })
            .collect();
        if k == 0 || active.len() <= k {
            return 0;
        }

        let tree = RTree::bulk_load(active.clone());
        let mean_distances: Vec<f64> = active
            .par_iter()
            .map(|q| {
                tree.nearest_neighbor_iter(q)
                    .skip(1)
                    .take(k)
                    .map(|n| n.p.distance(q.p))
                    .sum::<f64>()
                    / k as f64
            })
            .collect();

        let n = mean_distances.len() as f64;
        let sum = mean_distances.iter().sum::<f64>();
        let sum_sq = mean_distances.iter().map(|d| d * d).sum::<f64>();
        let mean = sum / n;
        let variance = ((sum_sq - sum * sum / n) / (n - 1.0)).max(0.0);
        let threshold = mean + self.config.std_mul * variance.sqrt();

        let mut removed = 0;
        for (q, d) in active.iter().zip(&mean_distances) {
            if *d > threshold {
                self.points[q.id].active = false;
                removed += 1;
            }
        }
        self.num_active -= removed;
        debug!(
            "filtered {} of {} points (threshold {:.3})",
            removed,
            active.len(),
            threshold
        );
        removed
    }

    pub fn get(&self, handle: CloudHandle) -> Option<&CloudPoint> {
        self.points.get(handle)
    }

    pub fn is_active(&self, handle: CloudHandle) -> bool {
        self.points.get(handle).map_or(false, |p| p.active)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn num_active(&self) -> usize {
        self.num_active
    }

    pub fn num_observations(&self) -> usize {
        self.points.iter().map(|p| p.views.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CloudHandle, &CloudPoint)> {
        self.points.iter().enumerate()
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (CloudHandle, &CloudPoint)> {
        self.iter().filter(|(_, p)| p.active)
    }

    /// Copy of every position, indexed by handle.
    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.points.iter().map(|p| p.position).collect()
    }

    pub(crate) fn set_position(&mut self, handle: CloudHandle, position: Point3<f64>) {
        self.points[handle].position = position;
    }

    pub(crate) fn mark_updated(&mut self, handle: CloudHandle) {
        self.points[handle].updates += 1;
    }
}
