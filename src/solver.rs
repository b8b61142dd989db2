//! Levenberg-Marquardt bundle adjustment over the reduced camera system.
//!
//! Cameras are parameterized by an angle-axis increment applied on the left of the rotation plus a
//! translation, points by their world position. Point blocks are eliminated with the Schur
//! complement and the remaining camera system is solved either by a dense Cholesky factorization
//! or by preconditioned conjugate gradients.

use cgmath::{Point2, Point3, Vector3};
use rayon::prelude::*;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::camera::{from_rodrigues, to_na, Pose};
use crate::config::{BundleConfig, BundleSolver, LossFunction};
use crate::geometry::{p3_to_na, projection_jacobian, skew_na};

/// Points closer to the image plane than this are treated as invalid.
const MIN_DEPTH: f64 = 1e-9;
const MIN_DIAGONAL: f64 = 1e-6;
const MAX_LAMBDA: f64 = 1e16;
const GRADIENT_TOLERANCE: f64 = 1e-10;
const CG_MAX_ITERATIONS: usize = 500;
const CG_TOLERANCE: f64 = 1e-10;

/// Camera `camera` observes point `point` at ideal pinhole pixel `pixel`.
#[derive(Debug, Clone, Copy)]
pub struct Residual {
    pub camera: usize,
    pub point: usize,
    pub pixel: Point2<f64>,
}

/// Reprojection problem with shared pinhole intrinsics.
#[derive(Debug, Clone)]
pub struct BundleProblem {
    /// `fx, fy, cx, cy`, held constant.
    pub intrinsics: [f64; 4],
    pub cameras: Vec<Pose>,
    /// Cameras flagged here are not optimized.
    pub constant: Vec<bool>,
    pub points: Vec<Point3<f64>>,
    pub residuals: Vec<Residual>,
}

impl BundleProblem {
    /// Number of scalar residuals.
    pub fn num_residuals(&self) -> usize {
        2 * self.residuals.len()
    }

    pub fn num_free_cameras(&self) -> usize {
        self.constant.iter().filter(|c| !**c).count()
    }

    fn evaluate(&self, r: &Residual) -> Option<(na::Vector2<f64>, na::Vector3<f64>)> {
        let pc = self.cameras[r.camera].transform(self.points[r.point]);
        if !(pc.z > MIN_DEPTH) {
            return None;
        }
        let [fx, fy, cx, cy] = self.intrinsics;
        Some((
            na::Vector2::new(
                fx * pc.x / pc.z + cx - r.pixel.x,
                fy * pc.y / pc.z + cy - r.pixel.y,
            ),
            p3_to_na(pc),
        ))
    }

    /// `0.5 * sum(loss(|r|^2))`, infinite if any point is behind its camera.
    pub fn cost(&self, loss: &LossFunction) -> f64 {
        0.5 * self
            .residuals
            .par_iter()
            .map(|r| match self.evaluate(r) {
                Some((res, _)) => loss.evaluate(res.norm_squared()).0,
                None => std::f64::INFINITY,
            })
            .sum::<f64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Termination {
    Converged,
    /// Iteration cap reached.
    NoConvergence,
    Failure,
}

#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub termination: Termination,
    pub num_residuals: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub elapsed: Duration,
}

pub fn rmse(cost: f64, num_residuals: usize) -> f64 {
    if num_residuals == 0 {
        return 0.0;
    }
    (cost / num_residuals as f64).sqrt()
}

impl SolverSummary {
    pub fn is_usable(&self) -> bool {
        self.termination != Termination::Failure && self.final_cost.is_finite()
    }

    pub fn initial_rmse(&self) -> f64 {
        rmse(self.initial_cost, self.num_residuals)
    }

    pub fn final_rmse(&self) -> f64 {
        rmse(self.final_cost, self.num_residuals)
    }
}

impl fmt::Display for SolverSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} after {} iterations ({:.3}s): cost {:.6e} -> {:.6e}, rmse {:.4} -> {:.4} over {} residuals",
            self.termination,
            self.iterations,
            self.elapsed.as_secs_f64(),
            self.initial_cost,
            self.final_cost,
            self.initial_rmse(),
            self.final_rmse(),
            self.num_residuals
        )
    }
}

// Weighted residual with its camera and point jacobians.
struct Linearized {
    camera: usize,
    point: usize,
    r: na::Vector2<f64>,
    jc: na::Matrix2x6<f64>,
    jp: na::Matrix2x3<f64>,
}

// Gauss-Newton system split into camera and point blocks.
struct NormalEquations {
    u: Vec<na::Matrix6<f64>>,
    gc: Vec<na::Vector6<f64>>,
    v: Vec<na::Matrix3<f64>>,
    gp: Vec<na::Vector3<f64>>,
    // per point: (free camera index, W block)
    w: Vec<Vec<(usize, na::Matrix6x3<f64>)>>,
}

impl NormalEquations {
    fn max_gradient(&self) -> f64 {
        self.gc
            .iter()
            .flat_map(|g| g.iter().cloned())
            .chain(self.gp.iter().flat_map(|g| g.iter().cloned()))
            .fold(0.0f64, |m, g| m.max(g.abs()))
    }
}

fn linearize(problem: &BundleProblem, loss: &LossFunction) -> Option<Vec<Linearized>> {
    let (fx, fy) = (problem.intrinsics[0], problem.intrinsics[1]);
    problem
        .residuals
        .par_iter()
        .map(|res| {
            let (r, pc) = problem.evaluate(res)?;
            let pose = &problem.cameras[res.camera];
            let rotation = to_na(&pose.rotation);
            let translation = na::Vector3::new(
                pose.translation.x,
                pose.translation.y,
                pose.translation.z,
            );
            let dproj = projection_jacobian(fx, fy, &pc);

            let mut jc = na::Matrix2x6::zeros();
            let drot = dproj * (-skew_na(&(pc - translation)));
            for i in 0..2 {
                for j in 0..3 {
                    jc[(i, j)] = drot[(i, j)];
                    jc[(i, j + 3)] = dproj[(i, j)];
                }
            }
            let jp = dproj * rotation;

            let (_, weight) = loss.evaluate(r.norm_squared());
            let w = weight.max(0.0).sqrt();
            Some(Linearized {
                camera: res.camera,
                point: res.point,
                r: r * w,
                jc: jc * w,
                jp: jp * w,
            })
        })
        .collect()
}

fn normal_equations(
    problem: &BundleProblem,
    free: &[Option<usize>],
    num_free: usize,
    blocks: &[Linearized],
) -> NormalEquations {
    let mut eq = NormalEquations {
        u: vec![na::Matrix6::zeros(); num_free],
        gc: vec![na::Vector6::zeros(); num_free],
        v: vec![na::Matrix3::zeros(); problem.points.len()],
        gp: vec![na::Vector3::zeros(); problem.points.len()],
        w: vec![Vec::new(); problem.points.len()],
    };
    for b in blocks {
        eq.v[b.point] += b.jp.transpose() * b.jp;
        eq.gp[b.point] += b.jp.transpose() * b.r;
        if let Some(c) = free[b.camera] {
            eq.u[c] += b.jc.transpose() * b.jc;
            eq.gc[c] += b.jc.transpose() * b.r;
            let wb = b.jc.transpose() * b.jp;
            match eq.w[b.point].iter_mut().find(|(i, _)| *i == c) {
                Some((_, m)) => *m += wb,
                None => eq.w[b.point].push((c, wb)),
            }
        }
    }
    eq
}

fn conjugate_gradient(a: &na::DMatrix<f64>, b: &na::DVector<f64>) -> na::DVector<f64> {
    let n = b.len();
    let precond = na::DVector::from_fn(n, |i, _| {
        let d = a[(i, i)];
        if d.abs() > 0.0 {
            1.0 / d
        } else {
            1.0
        }
    });
    let mut x = na::DVector::zeros(n);
    let b_norm = b.norm();
    if b_norm == 0.0 {
        return x;
    }
    let mut r = b.clone();
    let mut z = r.component_mul(&precond);
    let mut p = z.clone();
    let mut rz = r.dot(&z);
    for _ in 0..CG_MAX_ITERATIONS {
        let ap = a * &p;
        let alpha = rz / p.dot(&ap);
        if !alpha.is_finite() {
            break;
        }
        x += &p * alpha;
        r -= &ap * alpha;
        if r.norm() <= CG_TOLERANCE * b_norm {
            break;
        }
        z = r.component_mul(&precond);
        let rz_next = r.dot(&z);
        p = &z + &p * (rz_next / rz);
        rz = rz_next;
    }
    x
}

// Solve the damped system. Returns camera and point increments.
fn solve_step(
    eq: &NormalEquations,
    lambda: f64,
    solver: BundleSolver,
) -> Option<(Vec<na::Vector6<f64>>, Vec<na::Vector3<f64>>)> {
    let v_inv = eq
        .v
        .iter()
        .map(|v| {
            let mut d = *v;
            for k in 0..3 {
                d[(k, k)] += lambda * v[(k, k)].max(MIN_DIAGONAL);
            }
            d.try_inverse()
        })
        .collect::<Option<Vec<_>>>()?;

    let num_free = eq.u.len();
    let n = 6 * num_free;
    let mut dc = vec![na::Vector6::zeros(); num_free];
    if n > 0 {
        let mut s = na::DMatrix::zeros(n, n);
        let mut b = na::DVector::zeros(n);
        for (c, u) in eq.u.iter().enumerate() {
            for i in 0..6 {
                for j in 0..6 {
                    s[(6 * c + i, 6 * c + j)] = u[(i, j)];
                }
                s[(6 * c + i, 6 * c + i)] += lambda * u[(i, i)].max(MIN_DIAGONAL);
                b[6 * c + i] = -eq.gc[c][i];
            }
        }
        for (j, blocks) in eq.w.iter().enumerate() {
            for (a, wa) in blocks {
                let wv = wa * v_inv[j];
                let rhs = wv * eq.gp[j];
                for i in 0..6 {
                    b[6 * a + i] += rhs[i];
                }
                for (c, wc) in blocks {
                    let m = wv * wc.transpose();
                    for i in 0..6 {
                        for k in 0..6 {
                            s[(6 * a + i, 6 * c + k)] -= m[(i, k)];
                        }
                    }
                }
            }
        }

        let x = match solver {
            BundleSolver::DenseSchur => s.cholesky()?.solve(&b),
            BundleSolver::IterativeSchur => conjugate_gradient(&s, &b),
        };
        if x.iter().any(|v| !v.is_finite()) {
            return None;
        }
        for c in 0..num_free {
            dc[c] = na::Vector6::from_fn(|i, _| x[6 * c + i]);
        }
    }

    let dp = eq
        .w
        .iter()
        .enumerate()
        .map(|(j, blocks)| {
            let mut rhs = -eq.gp[j];
            for (c, wc) in blocks {
                rhs -= wc.transpose() * dc[*c];
            }
            v_inv[j] * rhs
        })
        .collect();
    Some((dc, dp))
}

fn apply_step(
    problem: &BundleProblem,
    free: &[Option<usize>],
    dc: &[na::Vector6<f64>],
    dp: &[na::Vector3<f64>],
) -> BundleProblem {
    let mut next = problem.clone();
    for (i, camera) in next.cameras.iter_mut().enumerate() {
        if let Some(c) = free[i] {
            let d = &dc[c];
            camera.rotation = from_rodrigues(Vector3::new(d[0], d[1], d[2])) * camera.rotation;
            camera.translation += Vector3::new(d[3], d[4], d[5]);
        }
    }
    for (point, d) in next.points.iter_mut().zip(dp) {
        *point += Vector3::new(d[0], d[1], d[2]);
    }
    next
}

fn parameter_norm(problem: &BundleProblem, free: &[Option<usize>]) -> f64 {
    let cameras = problem
        .cameras
        .iter()
        .zip(free)
        .filter(|(_, f)| f.is_some())
        .map(|(c, _)| c.to_params().iter().map(|x| x * x).sum::<f64>())
        .sum::<f64>();
    let points = problem
        .points
        .iter()
        .map(|p| p.x * p.x + p.y * p.y + p.z * p.z)
        .sum::<f64>();
    (cameras + points).sqrt()
}

/// Minimize the reprojection cost of `problem` in place. On `Failure` the problem is left
/// untouched.
pub fn solve(problem: &mut BundleProblem, config: &BundleConfig) -> SolverSummary {
    let start = Instant::now();
    let num_residuals = problem.num_residuals();
    let mut summary = SolverSummary {
        termination: Termination::Failure,
        num_residuals,
        initial_cost: std::f64::INFINITY,
        final_cost: std::f64::INFINITY,
        iterations: 0,
        elapsed: Duration::from_secs(0),
    };
    if problem.residuals.is_empty() {
        return summary;
    }

    let mut num_free = 0;
    let free: Vec<Option<usize>> = problem
        .constant
        .iter()
        .map(|constant| {
            if *constant {
                None
            } else {
                num_free += 1;
                Some(num_free - 1)
            }
        })
        .collect();

    let loss = config.loss;
    let mut cost = problem.cost(&loss);
    summary.initial_cost = cost;
    summary.final_cost = cost;
    if !cost.is_finite() {
        summary.elapsed = start.elapsed();
        return summary;
    }

    let mut lambda = config.initial_lambda;
    let mut eq = match linearize(problem, &loss) {
        Some(blocks) => normal_equations(problem, &free, num_free, &blocks),
        None => {
            summary.elapsed = start.elapsed();
            return summary;
        }
    };
    let mut termination = Termination::NoConvergence;

    while summary.iterations < config.max_iterations {
        if eq.max_gradient() <= GRADIENT_TOLERANCE {
            termination = Termination::Converged;
            break;
        }
        summary.iterations += 1;

        let step = solve_step(&eq, lambda, config.solver);
        let (dc, dp) = match step {
            Some(s) => s,
            None => {
                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    termination = Termination::Converged;
                    break;
                }
                continue;
            }
        };

        let step_norm = dc
            .iter()
            .map(|d| d.norm_squared())
            .chain(dp.iter().map(|d| d.norm_squared()))
            .sum::<f64>()
            .sqrt();
        let x_norm = parameter_norm(problem, &free);

        let candidate = apply_step(problem, &free, &dc, &dp);
        let new_cost = candidate.cost(&loss);
        debug!(
            "iteration {}: cost {:.6e} -> {:.6e}, lambda {:.2e}, |dx| {:.3e}",
            summary.iterations, cost, new_cost, lambda, step_norm
        );

        if new_cost.is_finite() && new_cost < cost {
            let decrease = (cost - new_cost) / cost;
            *problem = candidate;
            cost = new_cost;
            lambda = (lambda / 10.0).max(1e-12);
            if decrease < config.function_tolerance
                || step_norm <= config.parameter_tolerance * (x_norm + config.parameter_tolerance)
            {
                termination = Termination::Converged;
                break;
            }
            eq = match linearize(problem, &loss) {
                Some(blocks) => normal_equations(problem, &free, num_free, &blocks),
                None => break,
            };
        } else {
            if step_norm <= config.parameter_tolerance * (x_norm + config.parameter_tolerance) {
                termination = Termination::Converged;
                break;
            }
            lambda *= 10.0;
            if lambda > MAX_LAMBDA {
                termination = Termination::Converged;
                break;
            }
        }
    }

    summary.termination = termination;
    summary.final_cost = cost;
    summary.elapsed = start.elapsed();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::prelude::*;
    use cgmath::{Deg, Matrix3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn problem(seed: u64) -> (BundleProblem, BundleProblem) {
        let mut rng = StdRng::seed_from_u64(seed);
        let cameras: Vec<Pose> = (0..4)
            .map(|i| {
                Pose::from_center(
                    Matrix3::from_axis_angle(Vector3::unit_y(), Deg(-2.0 * i as f64)),
                    Point3::new(0.5 * i as f64, 0.0, 0.0),
                )
            })
            .collect();
        let points: Vec<Point3<f64>> = (0..60)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0, 3.5),
                    rng.gen_range(-1.5, 1.5),
                    rng.gen_range(5.0, 9.0),
                )
            })
            .collect();
        let intrinsics = [500.0, 500.0, 320.0, 240.0];
        let mut residuals = Vec::new();
        for (ci, c) in cameras.iter().enumerate() {
            for (pi, p) in points.iter().enumerate() {
                let pc = c.transform(*p);
                residuals.push(Residual {
                    camera: ci,
                    point: pi,
                    pixel: Point2::new(
                        500.0 * pc.x / pc.z + 320.0,
                        500.0 * pc.y / pc.z + 240.0,
                    ),
                });
            }
        }
        let truth = BundleProblem {
            intrinsics,
            cameras,
            constant: vec![true, true, false, false],
            points,
            residuals,
        };

        let mut noisy = truth.clone();
        for c in noisy.cameras.iter_mut().skip(2) {
            c.translation += Vector3::new(0.02, -0.01, 0.03);
        }
        for p in noisy.points.iter_mut() {
            *p += Vector3::new(
                rng.gen_range(-0.05, 0.05),
                rng.gen_range(-0.05, 0.05),
                rng.gen_range(-0.05, 0.05),
            );
        }
        (truth, noisy)
    }

    #[test]
    fn test_dense_schur_reduces_cost() {
        let (truth, mut noisy) = problem(5);
        let config = BundleConfig::default();
        let summary = solve(&mut noisy, &config);
        assert!(summary.is_usable());
        assert!(summary.final_cost < summary.initial_cost);
        assert!(summary.final_rmse() < 1e-3);
        assert_eq!(noisy.cameras[0], truth.cameras[0]);
        assert_eq!(noisy.cameras[1], truth.cameras[1]);
    }

    #[test]
    fn test_iterative_schur_reduces_cost() {
        let (_, mut noisy) = problem(6);
        let config = BundleConfig {
            solver: BundleSolver::IterativeSchur,
            ..BundleConfig::default()
        };
        let summary = solve(&mut noisy, &config);
        assert!(summary.is_usable());
        assert!(summary.final_rmse() < 1e-3);
    }

    #[test]
    fn test_robust_loss_tolerates_outlier() {
        let (_, mut noisy) = problem(7);
        noisy.residuals[5].pixel.x += 80.0;
        let config = BundleConfig {
            loss: LossFunction::Huber(1.0),
            ..BundleConfig::default()
        };
        let summary = solve(&mut noisy, &config);
        assert!(summary.is_usable());
        assert!(summary.final_cost < summary.initial_cost);
    }

    #[test]
    fn test_empty_problem_fails() {
        let mut empty = BundleProblem {
            intrinsics: [1.0, 1.0, 0.0, 0.0],
            cameras: vec![Pose::identity()],
            constant: vec![false],
            points: Vec::new(),
            residuals: Vec::new(),
        };
        let summary = solve(&mut empty, &BundleConfig::default());
        assert_eq!(summary.termination, Termination::Failure);
        assert!(!summary.is_usable());
    }
}
