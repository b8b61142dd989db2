//! Geometric estimation kernels: essential matrices, relative pose recovery, triangulation and
//! absolute pose (PnP).
//!
//! Image points handed to the essential matrix and PnP solvers are normalized camera
//! coordinates unless stated otherwise. The heavy linear algebra is done with `nalgebra`; results
//! are returned as `cgmath` types like the rest of the crate. Threshold based consensus runs on
//! `arrsac` through the `sample_consensus` estimator traits.

use arrsac::{Arrsac, Config as ArrsacConfig};
use cgmath::prelude::*;
use cgmath::{Matrix3, Point2, Point3, Vector3};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::Rng;
use rand_pcg::Pcg64;
use sample_consensus::{Consensus, Estimator, Model};
use std::cmp::Ordering;

use crate::camera::{from_na, from_rodrigues, to_na, CameraParameters, Pose};
use crate::config::{EssentialMethod, PnpMethod, TriangulationMethod};

/// Points farther than this many baselines are not counted as cheirality inliers.
const CHEIRALITY_DISTANCE: f64 = 50.0;

/// Fewest correspondences an essential matrix is estimated from.
pub const MIN_ESSENTIAL_POINTS: usize = 6;
const EIGHT_POINT_SAMPLE: usize = 8;
const PNP_SAMPLE: usize = 6;
const CONSENSUS_STREAM: u128 = 0x0a02_bdbf_7bb3_c0a7_ac28_fa16_a64a_bf96;

pub(crate) fn p3_to_na(p: Point3<f64>) -> na::Vector3<f64> {
    na::Vector3::new(p.x, p.y, p.z)
}

pub(crate) fn skew_na(v: &na::Vector3<f64>) -> na::Matrix3<f64> {
    na::Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// Derivative of the pinhole pixel projection with respect to the camera-space point.
pub(crate) fn projection_jacobian(fx: f64, fy: f64, p: &na::Vector3<f64>) -> na::Matrix2x3<f64> {
    let iz = 1.0 / p[2];
    let iz2 = iz * iz;
    na::Matrix2x3::new(
        fx * iz,
        0.0,
        -fx * p[0] * iz2,
        0.0,
        fy * iz,
        -fy * p[1] * iz2,
    )
}

/// Eigenvector of `A^T A` with the smallest eigenvalue.
fn null_vector(a: &na::DMatrix<f64>) -> na::DVector<f64> {
    let ata = a.transpose() * a;
    let eigen = ata.symmetric_eigen();
    let (imin, _) = eigen.eigenvalues.iter().enumerate().fold(
        (0, std::f64::INFINITY),
        |(bi, bv), (i, v)| if *v < bv { (i, *v) } else { (bi, bv) },
    );
    eigen.eigenvectors.column(imin).into_owned()
}

/// Eigenvectors of `A^T A` for the `count` smallest eigenvalues.
fn null_space(a: &na::DMatrix<f64>, count: usize) -> Vec<na::DVector<f64>> {
    let eigen = (a.transpose() * a).symmetric_eigen();
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|i, j| {
        eigen.eigenvalues[*i]
            .partial_cmp(&eigen.eigenvalues[*j])
            .unwrap_or(Ordering::Equal)
    });
    order
        .into_iter()
        .take(count)
        .map(|i| eigen.eigenvectors.column(i).into_owned())
        .collect()
}

/// SVD with singular values in decreasing order.
fn sorted_svd(
    m: &na::Matrix3<f64>,
) -> Option<(na::Matrix3<f64>, na::Vector3<f64>, na::Matrix3<f64>)> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let s = svd.singular_values;
    let mut order = [0usize, 1, 2];
    order.sort_by(|a, b| s[*b].partial_cmp(&s[*a]).unwrap_or(Ordering::Equal));

    let mut u_sorted = na::Matrix3::zeros();
    let mut v_t_sorted = na::Matrix3::zeros();
    let mut s_sorted = na::Vector3::zeros();
    for (k, i) in order.iter().enumerate() {
        u_sorted.set_column(k, &u.column(*i));
        v_t_sorted.set_row(k, &v_t.row(*i));
        s_sorted[k] = s[*i];
    }
    Some((u_sorted, s_sorted, v_t_sorted))
}

/// Number of iterations for a RANSAC loop to reach confidence `prob`.
fn ransac_iterations(prob: f64, inlier_ratio: f64, sample_size: usize, max_iter: usize) -> usize {
    let w = inlier_ratio.powi(sample_size as i32);
    if w <= 0.0 {
        return max_iter;
    }
    if w >= 1.0 {
        return 1;
    }
    let n = (1.0 - prob).ln() / (1.0 - w).ln();
    if n.is_finite() {
        (n.ceil().max(1.0) as usize).min(max_iter)
    } else {
        max_iter
    }
}

/// Seed a consensus generator from the estimator's own generator.
fn consensus_rng(rng: &mut StdRng) -> Pcg64 {
    let state = (u128::from(rng.gen::<u64>()) << 64) | u128::from(rng.gen::<u64>());
    Pcg64::new(state, CONSENSUS_STREAM)
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    sorted[sorted.len() / 2]
}

/// Translate to the centroid and scale to a mean distance of sqrt(2).
fn hartley_normalize(pts: &[Point2<f64>]) -> Option<(Vec<Point2<f64>>, na::Matrix3<f64>)> {
    let n = pts.len() as f64;
    let mx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let my = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - mx).powi(2) + (p.y - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist <= 1e-12 {
        return None;
    }
    let s = 2f64.sqrt() / mean_dist;
    let t = na::Matrix3::new(s, 0.0, -s * mx, 0.0, s, -s * my, 0.0, 0.0, 1.0);
    let out = pts
        .iter()
        .map(|p| Point2::new(s * (p.x - mx), s * (p.y - my)))
        .collect();
    Some((out, t))
}

/// Sampson distance of a correspondence to the epipolar geometry `x2^T E x1 = 0`.
fn sampson_error(e: &na::Matrix3<f64>, p1: Point2<f64>, p2: Point2<f64>) -> f64 {
    let x1 = na::Vector3::new(p1.x, p1.y, 1.0);
    let x2 = na::Vector3::new(p2.x, p2.y, 1.0);
    let ex1 = e * x1;
    let etx2 = e.transpose() * x2;
    let x2tex1 = x2.dot(&ex1);
    let denom = ex1[0] * ex1[0] + ex1[1] * ex1[1] + etx2[0] * etx2[0] + etx2[1] * etx2[1];
    if denom <= 1e-18 {
        std::f64::INFINITY
    } else {
        x2tex1 * x2tex1 / denom
    }
}

/// Project onto the essential manifold (two equal singular values, one zero) with unit norm.
fn enforce_essential(e: &na::Matrix3<f64>) -> Option<na::Matrix3<f64>> {
    let (u, _, v_t) = sorted_svd(e)?;
    let sigma = na::Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0);
    let projected = u * sigma * v_t;
    let norm = projected.norm();
    if norm.is_finite() && norm > 0.0 {
        Some(projected / norm)
    } else {
        None
    }
}

// coefficients of the row-major essential matrix in `p2^T E p1`
fn epipolar_row(p1: Point2<f64>, p2: Point2<f64>) -> [f64; 9] {
    let (x1, y1, x2, y2) = (p1.x, p1.y, p2.x, p2.y);
    [x2 * x1, x2 * y1, x2, y2 * x1, y2 * y1, y2, x1, y1, 1.0]
}

fn matrix_from_vec(v: &na::DVector<f64>) -> na::Matrix3<f64> {
    na::Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8])
}

/// Normalized eight point algorithm over the correspondences in `idx`.
fn essential_from_samples(
    prev: &[Point2<f64>],
    curr: &[Point2<f64>],
    idx: &[usize],
) -> Option<na::Matrix3<f64>> {
    let p1: Vec<_> = idx.iter().map(|i| prev[*i]).collect();
    let p2: Vec<_> = idx.iter().map(|i| curr[*i]).collect();
    let (n1, t1) = hartley_normalize(&p1)?;
    let (n2, t2) = hartley_normalize(&p2)?;

    let a = na::DMatrix::from_fn(idx.len(), 9, |r, c| epipolar_row(n1[r], n2[r])[c]);
    let e = matrix_from_vec(&null_vector(&a));
    enforce_essential(&(t2.transpose() * e * t1))
}

// det(E) of E = sum x_i E_i is the sum over ordered triples of this trilinear form
fn mixed_det(a: &na::Matrix3<f64>, b: &na::Matrix3<f64>, c: &na::Matrix3<f64>) -> f64 {
    const PERMUTATIONS: [([usize; 3], f64); 6] = [
        ([0, 1, 2], 1.0),
        ([1, 2, 0], 1.0),
        ([2, 0, 1], 1.0),
        ([0, 2, 1], -1.0),
        ([2, 1, 0], -1.0),
        ([1, 0, 2], -1.0),
    ];
    PERMUTATIONS
        .iter()
        .map(|(s, sign)| sign * a[(0, s[0])] * b[(1, s[1])] * c[(2, s[2])])
        .sum()
}

/// Essential matrix from six or seven correspondences.
///
/// The epipolar constraints leave a three (six points) or two (seven points) dimensional space
/// `E = sum x_i E_i`. The cubic constraints `det(E) = 0` and `2 E E^T E - tr(E E^T) E = 0` are
/// linear in the degree three monomials of `x`, so the monomial vector is the null vector of a
/// 10 x m system and the coefficients are read off as ratios.
fn essential_from_few(prev: &[Point2<f64>], curr: &[Point2<f64>]) -> Option<na::Matrix3<f64>> {
    let n = prev.len();
    if n < MIN_ESSENTIAL_POINTS || n >= EIGHT_POINT_SAMPLE || curr.len() != n {
        return None;
    }
    let a = na::DMatrix::from_fn(n, 9, |r, c| epipolar_row(prev[r], curr[r])[c]);
    let dim = 9 - n;
    let basis: Vec<na::Matrix3<f64>> = null_space(&a, dim).iter().map(matrix_from_vec).collect();

    let mut monomials = Vec::new();
    for i in 0..dim {
        for j in i..dim {
            for k in j..dim {
                monomials.push([i, j, k]);
            }
        }
    }
    let column = |mut key: [usize; 3]| {
        key.sort();
        monomials.iter().position(|m| *m == key)
    };

    let mut system = na::DMatrix::<f64>::zeros(10, monomials.len());
    for i in 0..dim {
        for j in 0..dim {
            for k in 0..dim {
                let col = column([i, j, k])?;
                let (ei, ej, ek) = (basis[i], basis[j], basis[k]);
                let eet = ei * ej.transpose();
                let trace = eet * ek * 2.0 - ek * eet.trace();
                for r in 0..9 {
                    system[(r, col)] += trace[(r / 3, r % 3)];
                }
                system[(9, col)] += mixed_det(&ei, &ej, &ek);
            }
        }
    }
    let v = null_vector(&system);

    let cubes = (0..dim)
        .map(|i| column([i, i, i]))
        .collect::<Option<Vec<_>>>()?;
    let pivot = (0..dim).fold(0, |best, i| {
        if v[cubes[i]].abs() > v[cubes[best]].abs() {
            i
        } else {
            best
        }
    });
    let denom = v[cubes[pivot]];
    if denom.abs() < 1e-300 {
        return None;
    }
    let mut e = na::Matrix3::zeros();
    for i in 0..dim {
        let x = if i == pivot {
            1.0
        } else {
            v[column([i, pivot, pivot])?] / denom
        };
        e += basis[i] * x;
    }
    enforce_essential(&e)
}

/// Essential matrix hypothesis scored by the Sampson distance.
#[derive(Debug, Clone, Copy)]
pub struct EssentialModel(pub na::Matrix3<f64>);

impl Model<(Point2<f64>, Point2<f64>)> for EssentialModel {
    fn residual(&self, data: &(Point2<f64>, Point2<f64>)) -> f32 {
        sampson_error(&self.0, data.0, data.1).sqrt() as f32
    }
}

/// Normalized eight point estimator over (previous, current) pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EightPoint;

impl Estimator<(Point2<f64>, Point2<f64>)> for EightPoint {
    type Model = EssentialModel;
    type ModelIter = Option<EssentialModel>;
    const MIN_SAMPLES: usize = EIGHT_POINT_SAMPLE;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = (Point2<f64>, Point2<f64>)> + Clone,
    {
        let (prev, curr): (Vec<_>, Vec<_>) = data.unzip();
        let idx: Vec<usize> = (0..prev.len()).collect();
        essential_from_samples(&prev, &curr, &idx).map(EssentialModel)
    }
}

/// Whether a matrix has the singular value structure of an essential matrix.
pub fn is_rank_valid(e: &Matrix3<f64>) -> bool {
    match sorted_svd(&to_na(e)) {
        Some((_, s, _)) => {
            s.iter().all(|x| x.is_finite())
                && s[0] > 1e-12
                && (s[0] - s[1]).abs() / s[0] < 1e-6
                && s[2] / s[0] < 1e-6
        }
        None => false,
    }
}

/// Essential matrix with its inlier mask.
#[derive(Debug, Clone)]
pub struct EssentialEstimate {
    /// Unit Frobenius norm, `curr^T E prev = 0`.
    pub matrix: Matrix3<f64>,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

fn lmeds_threshold(median: f64, n: usize, sample: usize) -> f64 {
    let sigma = 1.4826 * (1.0 + 5.0 / (n + 1 - sample) as f64) * median.sqrt();
    (2.5 * sigma).powi(2).max(1e-12)
}

/// Robustly estimate the essential matrix between normalized correspondences. `threshold` is the
/// Sampson distance in normalized units. Six or seven correspondences are solved directly; from
/// eight on, RANSAC runs ARRSAC over eight point hypotheses and LMedS draws up to `max_iter`
/// samples. Returns `None` with fewer than six correspondences or when every sample is degenerate.
pub fn find_essential_mat(
    prev: &[Point2<f64>],
    curr: &[Point2<f64>],
    method: EssentialMethod,
    prob: f64,
    threshold: f64,
    max_iter: usize,
    rng: &mut StdRng,
) -> Option<EssentialEstimate> {
    let n = prev.len();
    if n < MIN_ESSENTIAL_POINTS || curr.len() != n {
        return None;
    }
    let thr2 = threshold * threshold;
    let errors_of = |e: &na::Matrix3<f64>| -> Vec<f64> {
        prev.iter()
            .zip(curr)
            .map(|(p1, p2)| sampson_error(e, *p1, *p2))
            .collect()
    };

    let (mut e, inlier_thr) = if n < EIGHT_POINT_SAMPLE {
        let e = essential_from_few(prev, curr)?;
        let thr = match method {
            EssentialMethod::Ransac => thr2,
            EssentialMethod::LMedS => lmeds_threshold(median(&errors_of(&e)), n, n),
        };
        (e, thr)
    } else {
        match method {
            EssentialMethod::Ransac => {
                let mut arrsac =
                    Arrsac::new(ArrsacConfig::new(threshold as f32), consensus_rng(rng));
                let data = prev.iter().cloned().zip(curr.iter().cloned());
                let model = arrsac.model(&EightPoint, data)?;
                (model.0, thr2)
            }
            EssentialMethod::LMedS => {
                let mut best: Option<(na::Matrix3<f64>, f64)> = None;
                let iterations = ransac_iterations(prob, 0.5, EIGHT_POINT_SAMPLE, max_iter);
                for _ in 0..iterations {
                    let sample = (0..n).choose_multiple(rng, EIGHT_POINT_SAMPLE);
                    let e = match essential_from_samples(prev, curr, &sample) {
                        Some(e) => e,
                        None => continue,
                    };
                    let med = median(&errors_of(&e));
                    if best.as_ref().map_or(true, |(_, s)| med < *s) {
                        best = Some((e, med));
                        if med < 1e-24 {
                            break;
                        }
                    }
                }
                let (e, med) = best?;
                (e, lmeds_threshold(med, n, EIGHT_POINT_SAMPLE))
            }
        }
    };
    let mut inliers: Vec<bool> = errors_of(&e).iter().map(|x| *x <= inlier_thr).collect();
    let mut num_inliers = inliers.iter().filter(|x| **x).count();

    // refit on the consensus set
    if num_inliers >= EIGHT_POINT_SAMPLE {
        let idx: Vec<usize> = (0..n).filter(|i| inliers[*i]).collect();
        if let Some(refit) = essential_from_samples(prev, curr, &idx) {
            let refit_inliers: Vec<bool> =
                errors_of(&refit).iter().map(|x| *x <= inlier_thr).collect();
            let refit_count = refit_inliers.iter().filter(|x| **x).count();
            if refit_count >= num_inliers {
                e = refit;
                inliers = refit_inliers;
                num_inliers = refit_count;
            }
        }
    }

    Some(EssentialEstimate {
        matrix: from_na(&e),
        inliers,
        num_inliers,
    })
}

/// Projection matrix `[R | t]` for normalized coordinates.
pub fn projection_matrix(pose: &Pose) -> na::Matrix3x4<f64> {
    let r = to_na(&pose.rotation);
    let mut p = na::Matrix3x4::zeros();
    for i in 0..3 {
        for j in 0..3 {
            p[(i, j)] = r[(i, j)];
        }
        p[(i, 3)] = pose.translation[i];
    }
    p
}

/// Projection matrix `K [R | t]` for pixel coordinates.
pub fn pixel_projection_matrix(camera: &CameraParameters, pose: &Pose) -> na::Matrix3x4<f64> {
    to_na(&camera.k()) * projection_matrix(pose)
}

fn row_dot(p: &na::Matrix3x4<f64>, row: usize, x: &na::Vector4<f64>) -> f64 {
    (0..4).map(|c| p[(row, c)] * x[c]).sum()
}

/// Weighted linear triangulation. Rows of each view are divided by the view's weight.
fn triangulate_linear(
    p0: &na::Matrix3x4<f64>,
    p1: &na::Matrix3x4<f64>,
    x0: Point2<f64>,
    x1: Point2<f64>,
    w0: f64,
    w1: f64,
) -> Option<na::Vector4<f64>> {
    let a = na::DMatrix::from_fn(4, 4, |r, c| match r {
        0 => (x0.x * p0[(2, c)] - p0[(0, c)]) / w0,
        1 => (x0.y * p0[(2, c)] - p0[(1, c)]) / w0,
        2 => (x1.x * p1[(2, c)] - p1[(0, c)]) / w1,
        _ => (x1.y * p1[(2, c)] - p1[(1, c)]) / w1,
    });
    let v = null_vector(&a);
    if v[3].abs() < 1e-14 {
        return None;
    }
    Some(na::Vector4::new(v[0] / v[3], v[1] / v[3], v[2] / v[3], 1.0))
}

/// Triangulate one correspondence. `x0` and `x1` must be in the coordinates `p0` and `p1`
/// project to.
pub fn triangulate_point(
    method: TriangulationMethod,
    p0: &na::Matrix3x4<f64>,
    p1: &na::Matrix3x4<f64>,
    x0: Point2<f64>,
    x1: Point2<f64>,
) -> Option<Point3<f64>> {
    let mut x = triangulate_linear(p0, p1, x0, x1, 1.0, 1.0)?;
    if method == TriangulationMethod::Iterative {
        let (mut w0, mut w1) = (1.0, 1.0);
        for _ in 0..10 {
            let nw0 = row_dot(p0, 2, &x);
            let nw1 = row_dot(p1, 2, &x);
            if (nw0 - w0).abs() <= 1e-9 && (nw1 - w1).abs() <= 1e-9 {
                break;
            }
            if nw0.abs() < 1e-12 || nw1.abs() < 1e-12 {
                break;
            }
            w0 = nw0;
            w1 = nw1;
            x = triangulate_linear(p0, p1, x0, x1, w0, w1)?;
        }
    }
    if x.iter().all(|v| v.is_finite()) {
        Some(Point3::new(x[0], x[1], x[2]))
    } else {
        None
    }
}

/// Relative motion `x_curr = R x_prev + t` with `|t| = 1` and the correspondences that passed
/// the cheirality check.
#[derive(Debug, Clone)]
pub struct RecoveredPose {
    pub pose: Pose,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Decompose an essential matrix and keep the candidate that places the most masked
/// correspondences in front of both cameras.
pub fn recover_pose(
    essential: &Matrix3<f64>,
    prev: &[Point2<f64>],
    curr: &[Point2<f64>],
    mask: &[bool],
) -> Option<RecoveredPose> {
    let (mut u, _, mut v_t) = sorted_svd(&to_na(essential))?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = na::Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = from_na(&(u * w * v_t));
    let r2 = from_na(&(u * w.transpose() * v_t));
    let t = Vector3::new(u[(0, 2)], u[(1, 2)], u[(2, 2)]);

    let p0 = projection_matrix(&Pose::identity());
    let mut best: Option<RecoveredPose> = None;
    for candidate in &[
        Pose::new(r1, t),
        Pose::new(r1, -t),
        Pose::new(r2, t),
        Pose::new(r2, -t),
    ] {
        let p1 = projection_matrix(candidate);
        let inliers: Vec<bool> = (0..prev.len())
            .map(|i| {
                if !mask[i] {
                    return false;
                }
                match triangulate_point(TriangulationMethod::Dlt, &p0, &p1, prev[i], curr[i]) {
                    Some(x) => {
                        let z1 = candidate.depth(x);
                        x.z > 0.0
                            && z1 > 0.0
                            && x.z < CHEIRALITY_DISTANCE
                            && z1 < CHEIRALITY_DISTANCE
                    }
                    None => false,
                }
            })
            .collect();
        let num_inliers = inliers.iter().filter(|x| **x).count();
        if best.as_ref().map_or(true, |b| num_inliers > b.num_inliers) {
            best = Some(RecoveredPose {
                pose: *candidate,
                inliers,
                num_inliers,
            });
        }
    }
    best
}

/// Pixel distance between the projection of `x` and the observation `pixel`. Points behind the
/// camera have infinite error.
pub fn reprojection_error(
    camera: &CameraParameters,
    pose: &Pose,
    x: Point3<f64>,
    pixel: Point2<f64>,
) -> f64 {
    let pc = pose.transform(x);
    if pc.z <= 0.0 {
        return std::f64::INFINITY;
    }
    camera.project(pc).distance(pixel)
}

/// Linear absolute pose from at least six 3D points and their normalized observations.
pub fn solve_pnp_dlt(points: &[Point3<f64>], observed: &[Point2<f64>]) -> Option<Pose> {
    let n = points.len();
    if n < PNP_SAMPLE || observed.len() != n {
        return None;
    }
    // condition the 3D points: X = s X' + c
    let c = points
        .iter()
        .fold(Vector3::new(0.0, 0.0, 0.0), |acc, p| acc + p.to_vec())
        / n as f64;
    let s = points
        .iter()
        .map(|p| (p.to_vec() - c).magnitude())
        .sum::<f64>()
        / n as f64;
    if s <= 1e-12 {
        return None;
    }
    let xs: Vec<Vector3<f64>> = points.iter().map(|p| (p.to_vec() - c) / s).collect();

    let a = na::DMatrix::from_fn(2 * n, 12, |r, col| {
        let i = r / 2;
        let (x, u) = (xs[i], observed[i]);
        let hom = [x.x, x.y, x.z, 1.0];
        let obs = if r % 2 == 0 { u.x } else { u.y };
        let block = col / 4;
        let k = col % 4;
        match (r % 2, block) {
            (0, 0) | (1, 1) => hom[k],
            (_, 2) => -obs * hom[k],
            _ => 0.0,
        }
    });
    let v = null_vector(&a);
    let mut m = na::Matrix3::new(v[0], v[1], v[2], v[4], v[5], v[6], v[8], v[9], v[10]);
    let mut p4 = na::Vector3::new(v[3], v[7], v[11]);
    if m.determinant() < 0.0 {
        m = -m;
        p4 = -p4;
    }
    let (u, sv, v_t) = sorted_svd(&m)?;
    let r = u * v_t;
    if r.determinant() <= 0.0 {
        return None;
    }
    let lambda = (sv[0] + sv[1] + sv[2]) / 3.0 / s;
    if !(lambda > 1e-12) {
        return None;
    }
    let rotation = from_na(&r);
    let translation = Vector3::new(p4[0], p4[1], p4[2]) / lambda - rotation * c;
    Some(Pose::new(rotation, translation))
}

/// Levenberg-Marquardt refinement of a pose over the given correspondences. `pixels` are ideal
/// pinhole pixels.
pub fn refine_pose(
    camera: &CameraParameters,
    pose: &Pose,
    points: &[Point3<f64>],
    pixels: &[Point2<f64>],
    iterations: usize,
) -> Pose {
    let cost = |pose: &Pose| -> f64 {
        points
            .iter()
            .zip(pixels)
            .map(|(x, u)| {
                let pc = pose.transform(*x);
                if pc.z <= 0.0 {
                    return 1e12;
                }
                let p = camera.project(pc);
                (p.x - u.x).powi(2) + (p.y - u.y).powi(2)
            })
            .sum()
    };

    let mut current = *pose;
    let mut current_cost = cost(&current);
    let mut lambda = 1e-3;
    for _ in 0..iterations {
        let mut h = na::Matrix6::<f64>::zeros();
        let mut g = na::Vector6::<f64>::zeros();
        for (x, u) in points.iter().zip(pixels) {
            let rx = to_na(&current.rotation) * p3_to_na(*x);
            let pc = rx + na::Vector3::new(
                current.translation.x,
                current.translation.y,
                current.translation.z,
            );
            if pc[2] <= 0.0 {
                continue;
            }
            let jp = projection_jacobian(camera.fx, camera.fy, &pc);
            let jw = jp * (-skew_na(&rx));
            let mut j = na::Matrix2x6::<f64>::zeros();
            for r in 0..2 {
                for c in 0..3 {
                    j[(r, c)] = jw[(r, c)];
                    j[(r, c + 3)] = jp[(r, c)];
                }
            }
            let residual = na::Vector2::new(
                camera.fx * pc[0] / pc[2] + camera.cx - u.x,
                camera.fy * pc[1] / pc[2] + camera.cy - u.y,
            );
            h += j.transpose() * j;
            g += j.transpose() * residual;
        }

        let mut damped = h;
        for i in 0..6 {
            damped[(i, i)] += lambda * h[(i, i)].max(1e-9);
        }
        let delta = match damped.cholesky() {
            Some(chol) => chol.solve(&(-g)),
            None => break,
        };
        let candidate = Pose::new(
            from_rodrigues(Vector3::new(delta[0], delta[1], delta[2])) * current.rotation,
            current.translation + Vector3::new(delta[3], delta[4], delta[5]),
        );
        let candidate_cost = cost(&candidate);
        if candidate_cost < current_cost {
            let improvement = (current_cost - candidate_cost) / current_cost.max(1e-300);
            current = candidate;
            current_cost = candidate_cost;
            lambda = (lambda * 0.1).max(1e-9);
            if improvement < 1e-12 || delta.norm() < 1e-12 {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e8 {
                break;
            }
        }
    }
    current
}

/// Absolute pose with its inlier mask.
#[derive(Debug, Clone)]
pub struct PnpEstimate {
    pub pose: Pose,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Settings of [solve_pnp_ransac].
#[derive(Debug, Clone)]
pub struct PnpParams {
    pub method: PnpMethod,
    /// Reprojection threshold in pixels.
    pub threshold: f64,
}

/// A cloud point with the ideal pixel it was observed at and the matching normalized coordinates.
#[derive(Debug, Clone, Copy)]
pub struct PnpCorrespondence {
    pub point: Point3<f64>,
    pub pixel: Point2<f64>,
    pub normalized: Point2<f64>,
}

/// Pose hypothesis scored by its pixel reprojection error.
#[derive(Debug, Clone)]
pub struct PoseModel {
    pub pose: Pose,
    camera: CameraParameters,
}

impl Model<PnpCorrespondence> for PoseModel {
    fn residual(&self, data: &PnpCorrespondence) -> f32 {
        reprojection_error(&self.camera, &self.pose, data.point, data.pixel) as f32
    }
}

/// Six point DLT estimator.
#[derive(Debug, Clone)]
pub struct DltPnp {
    pub camera: CameraParameters,
}

impl Estimator<PnpCorrespondence> for DltPnp {
    type Model = PoseModel;
    type ModelIter = Option<PoseModel>;
    const MIN_SAMPLES: usize = PNP_SAMPLE;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PnpCorrespondence> + Clone,
    {
        let (points, normalized): (Vec<_>, Vec<_>) = data.map(|c| (c.point, c.normalized)).unzip();
        solve_pnp_dlt(&points, &normalized).map(|pose| PoseModel {
            pose,
            camera: self.camera.clone(),
        })
    }
}

/// ARRSAC over six point DLT hypotheses, then a linear refit and, for `PnpMethod::Iterative`, a
/// nonlinear refinement on the inliers. `pixels` are ideal pinhole pixels. A `guess` competes
/// with the consensus hypothesis.
pub fn solve_pnp_ransac(
    camera: &CameraParameters,
    points: &[Point3<f64>],
    pixels: &[Point2<f64>],
    guess: Option<&Pose>,
    params: &PnpParams,
    rng: &mut StdRng,
) -> Option<PnpEstimate> {
    let n = points.len();
    if n < PNP_SAMPLE || pixels.len() != n {
        return None;
    }
    let normalized: Vec<Point2<f64>> = pixels.iter().map(|p| camera.normalize(*p)).collect();
    let score = |pose: &Pose| -> Vec<bool> {
        points
            .iter()
            .zip(pixels)
            .map(|(x, u)| reprojection_error(camera, pose, *x, *u) <= params.threshold)
            .collect()
    };

    let mut best: Option<(Pose, Vec<bool>, usize)> = None;
    let consider = |pose: Pose, best: &mut Option<(Pose, Vec<bool>, usize)>| {
        let inliers = score(&pose);
        let count = inliers.iter().filter(|x| **x).count();
        if best.as_ref().map_or(true, |b| count > b.2) {
            *best = Some((pose, inliers, count));
        }
    };

    if let Some(g) = guess {
        consider(*g, &mut best);
    }
    let data: Vec<PnpCorrespondence> = (0..n)
        .map(|i| PnpCorrespondence {
            point: points[i],
            pixel: pixels[i],
            normalized: normalized[i],
        })
        .collect();
    let estimator = DltPnp {
        camera: camera.clone(),
    };
    let mut arrsac = Arrsac::new(
        ArrsacConfig::new(params.threshold as f32),
        consensus_rng(rng),
    );
    if let Some(model) = arrsac.model(&estimator, data.iter().cloned()) {
        consider(model.pose, &mut best);
    }

    let (mut pose, mut inliers, mut num_inliers) = best?;
    if num_inliers < PNP_SAMPLE {
        return None;
    }

    let idx: Vec<usize> = (0..n).filter(|i| inliers[*i]).collect();
    let ip: Vec<_> = idx.iter().map(|i| points[*i]).collect();
    let iu: Vec<_> = idx.iter().map(|i| pixels[*i]).collect();
    let in_: Vec<_> = idx.iter().map(|i| normalized[*i]).collect();
    let mut candidates = Vec::new();
    if let Some(linear) = solve_pnp_dlt(&ip, &in_) {
        candidates.push(linear);
    }
    if params.method == PnpMethod::Iterative {
        candidates.push(refine_pose(camera, &pose, &ip, &iu, 20));
    }
    for candidate in candidates {
        let c_inliers = score(&candidate);
        let count = c_inliers.iter().filter(|x| **x).count();
        if count >= num_inliers {
            pose = candidate;
            inliers = c_inliers;
            num_inliers = count;
        }
    }

    Some(PnpEstimate {
        pose,
        inliers,
        num_inliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{AbsDiffEq, Deg};
    use rand::{Rng, SeedableRng};

    fn scene(rng: &mut StdRng, n: usize) -> Vec<Point3<f64>> {
        (0..n)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-3.0, 3.0),
                    rng.gen_range(-2.0, 2.0),
                    rng.gen_range(4.0, 10.0),
                )
            })
            .collect()
    }

    fn observe(pose: &Pose, points: &[Point3<f64>]) -> Vec<Point2<f64>> {
        points
            .iter()
            .map(|p| {
                let c = pose.transform(*p);
                Point2::new(c.x / c.z, c.y / c.z)
            })
            .collect()
    }

    fn motion() -> Pose {
        let r = Matrix3::from_angle_y(Deg(4.0)) * Matrix3::from_angle_x(Deg(-2.0));
        Pose::new(r, Vector3::new(-0.6, 0.1, 0.05).normalize())
    }

    #[test]
    fn test_essential_and_recover_pose() {
        let mut rng = StdRng::seed_from_u64(3);
        let points = scene(&mut rng, 60);
        let motion = motion();
        let prev = observe(&Pose::identity(), &points);
        let curr = observe(&motion, &points);

        for method in &[EssentialMethod::Ransac, EssentialMethod::LMedS] {
            let e = find_essential_mat(&prev, &curr, *method, 0.999, 1e-3, 250, &mut rng)
                .unwrap();
            assert_eq!(e.num_inliers, points.len());
            assert!(is_rank_valid(&e.matrix));

            let recovered = recover_pose(&e.matrix, &prev, &curr, &e.inliers).unwrap();
            assert_eq!(recovered.num_inliers, points.len());
            assert!(recovered
                .pose
                .rotation
                .abs_diff_eq(&motion.rotation, 1e-6));
            assert!(recovered
                .pose
                .translation
                .abs_diff_eq(&motion.translation, 1e-6));
        }
    }

    #[test]
    fn test_six_and_seven_points() {
        let mut rng = StdRng::seed_from_u64(1);
        let points = scene(&mut rng, 7);
        let motion = motion();
        let prev = observe(&Pose::identity(), &points);
        let curr = observe(&motion, &points);

        for n in &[6, 7] {
            for method in &[EssentialMethod::Ransac, EssentialMethod::LMedS] {
                let e = find_essential_mat(
                    &prev[..*n],
                    &curr[..*n],
                    *method,
                    0.99,
                    1e-3,
                    100,
                    &mut rng,
                )
                .unwrap();
                assert_eq!(e.num_inliers, *n);
                assert!(is_rank_valid(&e.matrix));

                let recovered = recover_pose(&e.matrix, &prev[..*n], &curr[..*n], &e.inliers)
                    .unwrap();
                assert_eq!(recovered.num_inliers, *n);
                assert!(recovered
                    .pose
                    .rotation
                    .abs_diff_eq(&motion.rotation, 1e-5));
                assert!(recovered
                    .pose
                    .translation
                    .abs_diff_eq(&motion.translation, 1e-5));
            }
        }

        assert!(find_essential_mat(
            &prev[..5],
            &curr[..5],
            EssentialMethod::Ransac,
            0.99,
            1e-3,
            100,
            &mut rng
        )
        .is_none());
    }

    #[test]
    fn test_consensus_rejects_outliers() {
        let mut rng = StdRng::seed_from_u64(5);
        let points = scene(&mut rng, 50);
        let motion = motion();
        let prev = observe(&Pose::identity(), &points);
        let mut curr = observe(&motion, &points);
        for i in &[3, 17, 31] {
            curr[*i].y += 0.05;
        }

        let e = find_essential_mat(
            &prev,
            &curr,
            EssentialMethod::Ransac,
            0.999,
            1e-3,
            250,
            &mut rng,
        )
        .unwrap();
        assert_eq!(e.num_inliers, 47);
        assert!(!e.inliers[3] && !e.inliers[17] && !e.inliers[31]);
        let recovered = recover_pose(&e.matrix, &prev, &curr, &e.inliers).unwrap();
        assert!(recovered
            .pose
            .rotation
            .abs_diff_eq(&motion.rotation, 1e-6));
    }

    #[test]
    fn test_triangulation_methods_agree() {
        let camera = CameraParameters::new(500.0, 500.0, 320.0, 240.0);
        let pose0 = Pose::identity();
        let pose1 = motion();
        let x = Point3::new(0.4, -0.3, 6.0);
        let p0 = pixel_projection_matrix(&camera, &pose0);
        let p1 = pixel_projection_matrix(&camera, &pose1);
        let u0 = camera.project(pose0.transform(x));
        let u1 = camera.project(pose1.transform(x));
        for method in &[TriangulationMethod::Dlt, TriangulationMethod::Iterative] {
            let t = triangulate_point(*method, &p0, &p1, u0, u1).unwrap();
            assert!(t.abs_diff_eq(&x, 1e-8), "{:?} {:?}", method, t);
        }
    }

    #[test]
    fn test_pnp_recovers_pose() {
        let camera = CameraParameters::new(500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(11);
        let points = scene(&mut rng, 40);
        let pose = Pose::new(
            Matrix3::from_angle_z(Deg(3.0)) * Matrix3::from_angle_y(Deg(-5.0)),
            Vector3::new(0.3, -0.1, 0.2),
        );
        let mut pixels: Vec<Point2<f64>> = points
            .iter()
            .map(|p| camera.project(pose.transform(*p)))
            .collect();
        // a few gross outliers
        pixels[0].x += 80.0;
        pixels[5].y -= 60.0;

        let params = PnpParams {
            method: PnpMethod::Iterative,
            threshold: 2.0,
        };
        let estimate =
            solve_pnp_ransac(&camera, &points, &pixels, None, &params, &mut rng).unwrap();
        assert_eq!(estimate.num_inliers, points.len() - 2);
        assert!(!estimate.inliers[0] && !estimate.inliers[5]);
        assert!(estimate.pose.rotation.abs_diff_eq(&pose.rotation, 1e-6));
        assert!(estimate
            .pose
            .translation
            .abs_diff_eq(&pose.translation, 1e-6));
    }

    #[test]
    fn test_reprojection_error_behind_camera() {
        let camera = CameraParameters::new(500.0, 500.0, 320.0, 240.0);
        let e = reprojection_error(
            &camera,
            &Pose::identity(),
            Point3::new(0.0, 0.0, -1.0),
            Point2::new(320.0, 240.0),
        );
        assert!(e.is_infinite());
    }
}
