//! Run configuration. Every method choice is a closed enum parsed once when the configuration is
//! built; the processing stages only ever match on the variants.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Robust estimator used around the essential matrix solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EssentialMethod {
    Ransac,
    LMedS,
}

/// Refinement applied to the RANSAC absolute pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PnpMethod {
    /// Gauss-Newton refinement of the reprojection error over the inliers.
    Iterative,
    /// Linear estimate on the inliers only.
    Dlt,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriangulationMethod {
    /// Iteratively reweighted linear triangulation.
    Iterative,
    Dlt,
}

/// Linear solver for the reduced camera system of bundle adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BundleSolver {
    DenseSchur,
    IterativeSchur,
}

/// Robust loss applied to squared reprojection residuals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossFunction {
    None,
    Huber(f64),
    Cauchy(f64),
}

fn unknown(kind: &str, name: &str) -> Error {
    Error::InvalidConfig(format!("unknown {} '{}'", kind, name))
}

impl FromStr for EssentialMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RANSAC" => Ok(EssentialMethod::Ransac),
            "LMEDS" => Ok(EssentialMethod::LMedS),
            _ => Err(unknown("pose estimation method", s)),
        }
    }
}

impl FromStr for PnpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ITERATIVE" => Ok(PnpMethod::Iterative),
            "DLT" => Ok(PnpMethod::Dlt),
            _ => Err(unknown("pnp method", s)),
        }
    }
}

impl FromStr for TriangulationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ITERATIVE" => Ok(TriangulationMethod::Iterative),
            "DLT" => Ok(TriangulationMethod::Dlt),
            _ => Err(unknown("triangulation method", s)),
        }
    }
}

impl FromStr for BundleSolver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DENSE_SCHUR" => Ok(BundleSolver::DenseSchur),
            "ITERATIVE_SCHUR" => Ok(BundleSolver::IterativeSchur),
            _ => Err(unknown("bundle adjustment solver", s)),
        }
    }
}

impl LossFunction {
    /// Resolve a loss function by name with its scale parameter.
    pub fn from_name(name: &str, scale: f64) -> Result<Self, Error> {
        if !(scale > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "loss scale must be positive, got {}",
                scale
            )));
        }
        match name.to_ascii_uppercase().as_str() {
            "NONE" => Ok(LossFunction::None),
            "HUBER" => Ok(LossFunction::Huber(scale)),
            "CAUCHY" => Ok(LossFunction::Cauchy(scale)),
            _ => Err(unknown("loss function", name)),
        }
    }

    /// Loss value and its derivative with respect to the squared residual `s`.
    pub fn evaluate(&self, s: f64) -> (f64, f64) {
        match *self {
            LossFunction::None => (s, 1.0),
            LossFunction::Huber(a) => {
                let b = a * a;
                if s > b {
                    let r = s.sqrt();
                    (2.0 * a * r - b, a / r)
                } else {
                    (s, 1.0)
                }
            }
            LossFunction::Cauchy(a) => {
                let b = a * a;
                let sum = 1.0 + s / b;
                (b * sum.ln(), 1.0 / sum)
            }
        }
    }
}

impl fmt::Display for LossFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossFunction::None => write!(f, "NONE"),
            LossFunction::Huber(a) => write!(f, "HUBER({})", a),
            LossFunction::Cauchy(a) => write!(f, "CAUCHY({})", a),
        }
    }
}

/// Relative and absolute pose estimation.
#[derive(Debug, Clone)]
pub struct PoseConfig {
    pub method: EssentialMethod,
    /// Desired confidence of the LMedS sampler.
    pub prob: f64,
    /// Epipolar (Sampson) distance threshold in pixels.
    pub threshold: f64,
    /// Reprojection threshold in pixels for absolute pose inliers.
    pub pnp_threshold: f64,
    /// Minimum number of inliers a pose needs to be accepted (exclusive).
    pub min_inliers: usize,
    /// Sample cap of the LMedS estimator. ARRSAC bounds its own hypotheses.
    pub num_iter: usize,
    pub pnp_method: PnpMethod,
    /// Let the last recovered pose compete with the absolute pose hypotheses.
    pub use_extrinsic_guess: bool,
    pub seed: u64,
}

impl Default for PoseConfig {
    fn default() -> Self {
        PoseConfig {
            method: EssentialMethod::LMedS,
            prob: 0.999,
            threshold: 1.0,
            pnp_threshold: 8.0,
            min_inliers: 50,
            num_iter: 250,
            pnp_method: PnpMethod::Iterative,
            use_extrinsic_guess: false,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriangulationConfig {
    pub method: TriangulationMethod,
    /// Minimum depth along the current camera's optical axis.
    pub min_distance: f64,
    /// Maximum depth along the current camera's optical axis.
    pub max_distance: f64,
    /// Reprojection error ceiling in pixels.
    pub max_projection_error: f64,
    /// Triangulate from normalized camera coordinates instead of pixels.
    pub use_normalized_points: bool,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        TriangulationConfig {
            method: TriangulationMethod::Iterative,
            min_distance: 1.0,
            max_distance: 100.0,
            max_projection_error: 100.0,
            use_normalized_points: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub solver: BundleSolver,
    pub max_iterations: usize,
    pub loss: LossFunction,
    /// Solutions whose RMSE in pixels exceeds this are discarded.
    pub max_rmse: f64,
    /// Relative cost decrease below which the solver reports convergence.
    pub function_tolerance: f64,
    /// Relative step size below which the solver reports convergence.
    pub parameter_tolerance: f64,
    pub initial_lambda: f64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        BundleConfig {
            solver: BundleSolver::DenseSchur,
            max_iterations: 50,
            loss: LossFunction::None,
            max_rmse: 10.0,
            function_tolerance: 1e-6,
            parameter_tolerance: 1e-8,
            initial_lambda: 1e-4,
        }
    }
}

/// Statistical outlier removal.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Number of nearest neighbours used for the mean distance of a point.
    pub mean_k: usize,
    /// Points farther than `mean + std_mul * std` are deactivated.
    pub std_mul: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            mean_k: 8,
            std_mul: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Number of track views kept for absolute pose correspondence search.
    pub history_capacity: usize,
    /// How many of the most recent track views are searched.
    pub max_history_frames: usize,
    /// Stop searching older views once this many 3D-2D pairs are collected. Never fewer than
    /// the seven absolute pose estimation needs.
    pub min_matches: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            history_capacity: 32,
            max_history_frames: 8,
            min_matches: 50,
        }
    }
}

/// How camera poses are obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Compose each pose from the previous one and the two-view relative motion.
    Odometry,
    /// Recover each pose by PnP against the cloud built so far.
    Localization,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VO" | "ODOMETRY" => Ok(Mode::Odometry),
            "PNP" | "LOCALIZATION" => Ok(Mode::Localization),
            _ => Err(unknown("mode", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: Mode,
    /// Frames that may be dropped while looking for a usable pair before giving up on a segment.
    pub max_skipped_frames: usize,
    /// Re-detect flow corners once fewer than this many survive tracking.
    pub min_flow_features: usize,
    /// Bounded frame store capacity.
    pub frame_capacity: usize,
    /// Run bundle adjustment every this many integrated frames; 0 disables it.
    pub ba_interval: usize,
    /// Filter the cloud every this many integrated frames; 0 disables it.
    pub filter_interval: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            mode: Mode::Odometry,
            max_skipped_frames: 10,
            min_flow_features: 500,
            frame_capacity: 100,
            ba_interval: 5,
            filter_interval: 10,
        }
    }
}

/// Complete configuration, fixed for the whole run.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pose: PoseConfig,
    pub triangulation: TriangulationConfig,
    pub bundle: BundleConfig,
    pub filter: FilterConfig,
    pub tracking: TrackingConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Check cross-field constraints that the individual types cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.pose.prob > 0.0 && self.pose.prob < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "confidence must be in (0, 1), got {}",
                self.pose.prob
            )));
        }
        if self.triangulation.min_distance >= self.triangulation.max_distance {
            return Err(Error::InvalidConfig(format!(
                "triangulation distance range [{}, {}] is empty",
                self.triangulation.min_distance, self.triangulation.max_distance
            )));
        }
        if self.tracking.max_history_frames > self.tracking.history_capacity {
            return Err(Error::InvalidConfig(format!(
                "cannot search {} history frames with a capacity of {}",
                self.tracking.max_history_frames, self.tracking.history_capacity
            )));
        }
        if self.filter.mean_k == 0 {
            return Err(Error::InvalidConfig("mean_k must be at least 1".to_string()));
        }
        if self.pipeline.frame_capacity < 2 {
            return Err(Error::InvalidConfig(
                "the frame store must hold at least two frames".to_string(),
            ));
        }
        Ok(())
    }
}

#[test]
fn test_parse_methods() {
    assert_eq!(
        "lmeds".parse::<EssentialMethod>().unwrap(),
        EssentialMethod::LMedS
    );
    assert_eq!(
        "DENSE_SCHUR".parse::<BundleSolver>().unwrap(),
        BundleSolver::DenseSchur
    );
    assert_eq!(
        "Dlt".parse::<TriangulationMethod>().unwrap(),
        TriangulationMethod::Dlt
    );
    assert!("SPARSE".parse::<BundleSolver>().is_err());
    assert_eq!(
        LossFunction::from_name("huber", 2.0).unwrap(),
        LossFunction::Huber(2.0)
    );
    assert!(LossFunction::from_name("cauchy", 0.0).is_err());
}

#[test]
fn test_loss_is_continuous() {
    let huber = LossFunction::Huber(1.5);
    let (below, _) = huber.evaluate(1.5 * 1.5 - 1e-9);
    let (above, _) = huber.evaluate(1.5 * 1.5 + 1e-9);
    assert!((below - above).abs() < 1e-6);

    let cauchy = LossFunction::Cauchy(1.0);
    let (rho, w) = cauchy.evaluate(0.0);
    assert!(rho.abs() < 1e-12);
    assert!((w - 1.0).abs() < 1e-12);
}

#[test]
fn test_default_config_is_valid() {
    assert!(Config::default().validate().is_ok());
    let mut config = Config::default();
    config.triangulation.min_distance = 200.0;
    assert!(config.validate().is_err());
}
