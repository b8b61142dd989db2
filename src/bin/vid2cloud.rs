use structopt::StructOpt;

use vid2cloud::config::{BundleSolver, Config, LossFunction, Mode, TriangulationMethod};
use vid2cloud::export::BalProblem;
use vid2cloud::pipeline::{NullSink, Pipeline, PlySink, Sink, StepOutcome};
use vid2cloud::synthetic::{SceneConfig, SyntheticScene};
use vid2cloud::*;

#[derive(StructOpt, Debug)]
struct SyntheticOpt {
    /// Number of frames in the generated sequence.
    #[structopt(long = "frames", default_value = "20")]
    num_frames: usize,

    /// Number of points in the scene.
    #[structopt(long = "points", default_value = "600")]
    num_points: usize,

    /// Distance the camera moves between frames.
    #[structopt(long = "step", default_value = "0.25")]
    step: f64,

    /// Yaw between frames in degrees.
    #[structopt(long = "yaw", default_value = "0.5", allow_hyphen_values = true)]
    yaw: f64,

    /// Standard deviation of the pixel noise added to tracked features.
    #[structopt(long = "pixel-noise", default_value = "0.0")]
    pixel_noise: f64,

    #[structopt(long = "seed", default_value = "0")]
    seed: u64,

    /// `odometry` or `localization`.
    #[structopt(long = "mode", default_value = "odometry")]
    mode: Mode,

    /// `DLT` or `ITERATIVE`.
    #[structopt(long = "triangulation", default_value = "ITERATIVE")]
    triangulation: TriangulationMethod,

    /// `DENSE_SCHUR` or `ITERATIVE_SCHUR`.
    #[structopt(long = "solver", default_value = "DENSE_SCHUR")]
    solver: BundleSolver,

    /// `NONE`, `HUBER` or `CAUCHY`.
    #[structopt(long = "loss", default_value = "NONE")]
    loss: String,

    #[structopt(long = "loss-scale", default_value = "1.0")]
    loss_scale: f64,

    /// Run bundle adjustment every this many integrated frames. 0 disables it.
    #[structopt(long = "ba-interval", default_value = "5")]
    ba_interval: usize,

    /// Filter outliers from the cloud every this many integrated frames. 0 disables it.
    #[structopt(long = "filter-interval", default_value = "10")]
    filter_interval: usize,

    #[structopt(long = "min-flow-features", default_value = "100")]
    min_flow_features: usize,

    #[structopt(long = "min-inliers", default_value = "50")]
    min_inliers: usize,

    /// Write a .ply snapshot per integrated frame into this directory.
    #[structopt(long = "snapshots", parse(from_os_str))]
    snapshots: Option<std::path::PathBuf>,

    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    /// Output file. `.ply` writes the cloud, `.bal`/`.bbal` a bundle adjustment problem.
    #[structopt(name = "OUT", parse(from_os_str))]
    output: std::path::PathBuf,
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "vid2cloud",
    about = "Incremental monocular reconstruction."
)]
enum Opt {
    /// Reconstruct a generated image sequence.
    Synthetic(SyntheticOpt),
}

fn run_synthetic(opt: SyntheticOpt) -> Result<()> {
    let scene = SyntheticScene::generate_verbose(
        &SceneConfig {
            num_frames: opt.num_frames,
            num_points: opt.num_points,
            step: opt.step,
            yaw: opt.yaw,
            pixel_noise: opt.pixel_noise,
            seed: opt.seed,
            ..SceneConfig::default()
        },
        opt.verbose,
    );

    let mut config = Config::default();
    config.pipeline.mode = opt.mode;
    config.pipeline.ba_interval = opt.ba_interval;
    config.pipeline.filter_interval = opt.filter_interval;
    config.pipeline.min_flow_features = opt.min_flow_features;
    config.pose.min_inliers = opt.min_inliers;
    config.triangulation.method = opt.triangulation;
    config.bundle.solver = opt.solver;
    config.bundle.loss = LossFunction::from_name(&opt.loss, opt.loss_scale)?;

    let mut pipeline = Pipeline::new(scene.camera.clone(), config)?;
    let mut sink: Box<dyn Sink> = match opt.snapshots {
        Some(directory) => {
            std::fs::create_dir_all(&directory)?;
            Box::new(PlySink {
                directory,
                prefix: "cloud".to_string(),
            })
        }
        None => Box::new(NullSink),
    };

    let pb = progress_bar(scene.num_frames() as u64, "Reconstructing", opt.verbose);
    let mut source = scene.source();
    let mut provider = scene.provider();
    loop {
        let outcome = pipeline.step(&mut source, &mut provider, sink.as_mut())?;
        if outcome == StepOutcome::Finished {
            break;
        }
        pb.set_position(pipeline.summary().frames_read as u64);
    }
    pb.finish();

    let summary = pipeline.summary();
    println!("{}", summary);

    let context = &pipeline.context;
    let is_ply = opt
        .output
        .extension()
        .map(|e| e == "ply")
        .unwrap_or(false);
    if is_ply {
        let points = context
            .cloud
            .iter_active()
            .map(|(_, p)| p.position)
            .collect::<Vec<_>>();
        let colors = context
            .cloud
            .iter_active()
            .map(|(_, p)| p.color)
            .collect::<Vec<_>>();
        let centers = context
            .camera_data
            .extrinsics
            .iter()
            .map(|p| p.center())
            .collect::<Vec<_>>();
        export::write_ply(&opt.output, &points, Some(&colors[..]), &centers)
    } else {
        let bal = BalProblem::from_reconstruction(&context.camera_data, &context.cloud);
        println!("{}", bal);
        bal.write(&opt.output)
    }
}

fn main() -> std::result::Result<(), vid2cloud::Error> {
    logger::init_logger();

    match Opt::from_args() {
        Opt::Synthetic(opt) => run_synthetic(opt),
    }
}
