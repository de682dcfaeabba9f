use std::{env, path::PathBuf};

use anyhow::Result;
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    optim::{momentum::MomentumConfig, SgdConfig},
};
use clap::Parser;
use model::ModelConfig;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};
use training::{train, RunPaths, TrainingConfig};

pub mod augment;
pub mod data;
pub mod eval;
pub mod loss;
pub mod metric;
pub mod mixup;
pub mod model;
pub mod module;
pub mod schedule;
pub mod summary;
pub mod training;

const CLASS_NAMES: [&str; 20] = [
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

#[derive(Parser, Debug)]
#[command(name = "caffenet-mixup", about = "Train CaffeNet on PASCAL VOC 2007 with mixup")]
struct Args {
    /// Input batch size for training.
    #[arg(long, default_value_t = 20)]
    batch_size: usize,
    /// Number of epochs to train.
    #[arg(long, default_value_t = 60)]
    epochs: usize,
    /// Initial learning rate.
    #[arg(long, default_value_t = 0.001)]
    lr: f64,
    /// Random seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,
    /// Steps between training loss records.
    #[arg(long, default_value_t = 50)]
    log_interval: usize,
    /// Steps between test set evaluations.
    #[arg(long, default_value_t = 250)]
    eval_interval: usize,
    /// Directory for scalar logs; each run gets a timestamped subdirectory.
    #[arg(long, default_value = "tb")]
    log_dir: PathBuf,
    /// Path to the VOC2007 directory.
    #[arg(long, default_value = "./data/VOCdevkit/VOC2007")]
    data_dir: PathBuf,
    /// Directory for checkpoints and the saved config.
    #[arg(long, default_value = "pascal_caffenet_mixup")]
    checkpoint_dir: PathBuf,
    /// Mixup Beta distribution parameter.
    #[arg(long, default_value_t = 0.2)]
    alpha: f32,
    /// Data loader workers for the test set.
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<()> {
    let filter = EnvFilter::from_default_env();
    let filter = if env::var("RUST_LOG").is_err() {
        filter.add_directive(LevelFilter::INFO.into())
    } else {
        filter
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).compact())
        .init();

    let args = Args::parse();

    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    let device = WgpuDevice::default();
    let paths = RunPaths {
        data_dir: args.data_dir,
        log_dir: args.log_dir,
        checkpoint_dir: args.checkpoint_dir,
    };

    let momentum = MomentumConfig::new()
        .with_momentum(0.9)
        .with_dampening(0.0)
        .with_nesterov(false);
    let config = TrainingConfig::new(
        ModelConfig::new(CLASS_NAMES.len()),
        SgdConfig::new().with_momentum(Some(momentum)),
    )
    .with_epoch_count(args.epochs)
    .with_batch_size(args.batch_size)
    .with_learning_rate(args.lr)
    .with_seed(args.seed)
    .with_log_interval(args.log_interval)
    .with_eval_interval(args.eval_interval)
    .with_mixup_alpha(args.alpha)
    .with_worker_count(args.workers);

    train::<AutodiffBackend>(&paths, config, device)?;

    Ok(())
}
