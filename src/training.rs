use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, ensure, Context, Result};
use burn::{
    config::Config,
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::{transform::MapperDataset, Dataset},
    },
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use chrono::Local;
use ndarray::Array2;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    augment::{self, center_crop_size, CenterCrop, CENTER_FRACTION},
    data::{Split, VocBatcher, VocDataset},
    eval::{evaluate, EvalReport},
    loss::WeightedSigmoidCrossEntropy,
    metric::{MeanAveragePrecision, RunningMean},
    mixup::MixupSampler,
    model::{Model, ModelConfig},
    schedule::StepDecayConfig,
    summary::SummaryWriter,
    CLASS_NAMES,
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,

    pub optimizer: SgdConfig,

    #[config(default = 60)]
    pub epoch_count: usize,

    #[config(default = 20)]
    pub batch_size: usize,

    #[config(default = 1)]
    pub seed: u64,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    #[config(default = 5000)]
    pub decay_steps: usize,

    #[config(default = 0.5)]
    pub decay_rate: f64,

    #[config(default = 0.2)]
    pub mixup_alpha: f32,

    /// Side length images are resized to when loaded.
    #[config(default = 256)]
    pub image_size: u32,

    #[config(default = 50)]
    pub log_interval: usize,

    #[config(default = 250)]
    pub eval_interval: usize,

    /// Epochs between checkpoints.
    #[config(default = 2)]
    pub checkpoint_interval: usize,

    #[config(default = 4)]
    pub worker_count: usize,
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
}

/// Mutable state threaded through the training loop.
#[derive(Debug)]
pub struct TrainingContext {
    pub epoch: usize,
    pub global_step: usize,
    pub epoch_loss: RunningMean,
    pub rng: StdRng,
}

impl TrainingContext {
    pub fn new(seed: u64) -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            epoch_loss: RunningMean::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_loss = RunningMean::default();
    }

    /// Records the loss of a finished step and returns the new global step.
    pub fn finish_step(&mut self, loss: f64) -> usize {
        self.epoch_loss.update(loss);
        self.global_step += 1;
        self.global_step
    }
}

#[derive(Debug, Clone)]
pub struct FinalReport {
    pub test: EvalReport,
    pub random: MeanAveragePrecision,
    pub ground_truth: MeanAveragePrecision,
}

fn create_checkpoint_dir(checkpoint_dir: &Path) -> Result<()> {
    fs::create_dir_all(checkpoint_dir)
        .with_context(|| format!("failed to create {}", checkpoint_dir.display()))
}

fn save_checkpoint<B, O>(
    checkpoint_dir: &Path,
    epoch: usize,
    model: &Model<B>,
    optim: &O,
) -> Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
{
    let recorder = CompactRecorder::new();
    let prefix = format!("ckpt-{epoch}");

    model
        .clone()
        .save_file(checkpoint_dir.join(format!("{prefix}-model")), &recorder)
        .map_err(|err| anyhow!("failed to save model checkpoint {prefix}: {err}"))?;
    <CompactRecorder as Recorder<B>>::record(
        &recorder,
        optim.to_record(),
        checkpoint_dir.join(format!("{prefix}-optim")),
    )
    .map_err(|err| anyhow!("failed to save optimizer checkpoint {prefix}: {err}"))?;

    debug!("saved checkpoint {prefix} to {}", checkpoint_dir.display());
    Ok(())
}

pub fn train<B: AutodiffBackend>(
    paths: &RunPaths,
    config: TrainingConfig,
    device: B::Device,
) -> Result<FinalReport> {
    ensure!(config.batch_size > 0, "batch size must be positive");
    ensure!(
        config.log_interval > 0 && config.eval_interval > 0 && config.checkpoint_interval > 0,
        "log, eval and checkpoint intervals must be positive"
    );
    ensure!(
        config.model.feature_size().is_some(),
        "a {}px model input is too small for the network, at least {}px are needed",
        config.model.input_size,
        ModelConfig::MIN_INPUT_SIZE
    );
    let crop_size = config.model.input_size as u32;
    ensure!(
        center_crop_size(config.image_size, CENTER_FRACTION) == crop_size,
        "center crop of {}px images does not match the {crop_size}px model input",
        config.image_size
    );

    create_checkpoint_dir(&paths.checkpoint_dir)?;
    config
        .save(paths.checkpoint_dir.join("config.json"))
        .context("failed to save training config")?;

    B::seed(config.seed);
    let mut context = TrainingContext::new(config.seed);

    info!("loading dataset from {}", paths.data_dir.display());
    let train_set = VocDataset::load(
        &paths.data_dir,
        &CLASS_NAMES,
        Split::Trainval,
        config.image_size,
    )?;
    let test_set = VocDataset::load(&paths.data_dir, &CLASS_NAMES, Split::Test, config.image_size)?;
    info!(
        train = train_set.len(),
        test = test_set.len(),
        "dataset loaded"
    );
    ensure!(!train_set.is_empty(), "training split is empty");
    let (test_labels, test_weights) = test_set.targets();

    let batcher_train = VocBatcher::<B>::new(device.clone());
    let batcher_valid = VocBatcher::<B::InnerBackend>::new(device.clone());

    let builder = DataLoaderBuilder::new(batcher_valid).batch_size(config.batch_size);
    let builder = if config.worker_count > 0 {
        builder.num_workers(config.worker_count)
    } else {
        builder
    };
    let dataloader_test =
        builder.build(MapperDataset::new(test_set, CenterCrop::new(CENTER_FRACTION)));

    let mut summary = SummaryWriter::create(&paths.log_dir, Local::now())?;
    info!("logging scalars to {}", summary.run_dir().display());

    let mut model = config.model.init::<B>(&device);
    let mut optim = config.optimizer.init();
    let schedule = StepDecayConfig::new(config.learning_rate)
        .with_decay_steps(config.decay_steps)
        .with_decay_rate(config.decay_rate)
        .init();
    let mixup = MixupSampler::new(config.mixup_alpha)?;
    let criterion = WeightedSigmoidCrossEntropy::new();

    for epoch in 0..config.epoch_count {
        context.start_epoch(epoch);

        let mut order: Vec<usize> = (0..train_set.len()).collect();
        order.shuffle(&mut context.rng);

        for indices in order.chunks(config.batch_size) {
            let rng = &mut context.rng;
            let items = indices
                .iter()
                .filter_map(|&index| train_set.get(index))
                .map(|item| augment::train_transform(item, crop_size, rng))
                .collect::<Vec<_>>();
            let batch = batcher_train.batch(items);
            let batch = mixup.sample(rng, indices.len()).apply(batch);

            let lr = schedule.learning_rate(context.global_step);
            let logits = model.forward(batch.images);
            let loss = criterion.forward(logits, batch.labels, batch.weights);
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);

            let step = context.finish_step(loss_value);

            if !loss_value.is_finite() {
                warn!(step, "training loss is {loss_value}");
            }

            if step % config.log_interval == 0 {
                info!(
                    "Epoch: {}/{} Iteration: {} Training Loss: {:.4}",
                    context.epoch,
                    config.epoch_count,
                    step,
                    context.epoch_loss.value()
                );
                summary.scalar("Training Loss", step, loss_value)?;
                // rate that applies from this step on
                summary.scalar("LR", step, schedule.learning_rate(step))?;
            }

            if step % config.eval_interval == 0 {
                let report = evaluate(&model.valid(), dataloader_test.iter(), CLASS_NAMES.len())?;
                info!(
                    step,
                    loss = report.loss,
                    accuracy = report.accuracy,
                    "mAP: {:.4}",
                    report.ap.mean
                );
                summary.scalar("Test mAP", step, report.ap.mean)?;
                summary.scalar("Test Loss", step, report.loss)?;
                summary.scalar("Test Accuracy", step, report.accuracy)?;
            }
        }

        if epoch % config.checkpoint_interval == 0 {
            save_checkpoint(&paths.checkpoint_dir, epoch, &model, &optim)?;
        }
    }

    model
        .clone()
        .save_file(paths.checkpoint_dir.join("model"), &CompactRecorder::new())
        .map_err(|err| anyhow!("failed to save trained model: {err}"))?;
    info!(parameters = model.num_params(), "training finished");

    let test = evaluate(&model.valid(), dataloader_test.iter(), CLASS_NAMES.len())?;
    let evaluated_last_step =
        context.global_step > 0 && context.global_step % config.eval_interval == 0;
    if !evaluated_last_step {
        summary.scalar("Test mAP", context.global_step, test.ap.mean)?;
    }

    let random_scores = Array2::from_shape_fn(test_labels.dim(), |_| context.rng.gen::<f32>());
    let random = MeanAveragePrecision::from_matrices(
        test_labels.view(),
        random_scores.view(),
        test_weights.view(),
    );
    let ground_truth = MeanAveragePrecision::from_matrices(
        test_labels.view(),
        test_labels.view(),
        test_weights.view(),
    );

    let report = FinalReport {
        test,
        random,
        ground_truth,
    };
    print_report(&report);

    Ok(report)
}

fn print_report(report: &FinalReport) {
    println!("Random AP: {} mAP", report.random.mean);
    println!("GT AP: {} mAP", report.ground_truth.mean);
    println!("Obtained {} mAP", report.test.ap.mean);
    println!("Per class:");
    for (name, ap) in CLASS_NAMES.iter().zip(&report.test.ap.per_class) {
        match ap {
            Some(ap) => println!("{name}: {ap}"),
            None => println!("{name}: undefined (no positive examples)"),
        }
    }
    if report.test.ap.undefined_classes() > 0 {
        warn!(
            "{} classes without positives were left out of the mAP",
            report.test.ap.undefined_classes()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::tests::write_fixture, summary::read_scalars};
    use burn::{
        backend::{Autodiff, NdArray},
        optim::momentum::MomentumConfig,
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn context_counts_steps_and_resets_epoch_loss() {
        let mut context = TrainingContext::new(3);
        assert_eq!(context.finish_step(2.0), 1);
        assert_eq!(context.finish_step(4.0), 2);
        assert_eq!(context.epoch_loss.value(), 3.0);

        context.start_epoch(1);
        assert_eq!(context.epoch, 1);
        assert_eq!(context.epoch_loss.value(), 0.0);
        assert_eq!(context.global_step, 2);
    }

    #[test]
    fn rejects_mismatched_crop() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths {
            data_dir: dir.path().join("voc"),
            log_dir: dir.path().join("tb"),
            checkpoint_dir: dir.path().join("ckpt"),
        };
        let config = TrainingConfig::new(ModelConfig::new(CLASS_NAMES.len()), SgdConfig::new())
            .with_image_size(100);

        assert!(train::<TestBackend>(&paths, config, Default::default()).is_err());
        assert!(!paths.checkpoint_dir.exists());
    }

    #[test]
    fn rejects_inputs_below_the_network_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths {
            data_dir: dir.path().join("voc"),
            log_dir: dir.path().join("tb"),
            checkpoint_dir: dir.path().join("ckpt"),
        };
        // center crop of 56px is 50px, so only the size check can fail
        let config = TrainingConfig::new(
            ModelConfig::new(CLASS_NAMES.len()).with_input_size(50),
            SgdConfig::new(),
        )
        .with_image_size(56);

        let err = train::<TestBackend>(&paths, config, Default::default())
            .err()
            .expect("undersized input must fail");
        assert!(format!("{err}").contains("too small"), "{err}");
        assert!(!paths.checkpoint_dir.exists());
    }

    #[test]
    fn trains_on_a_tiny_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("voc");
        write_fixture(&data_dir, &CLASS_NAMES, "trainval", 80);
        write_fixture(&data_dir, &CLASS_NAMES, "test", 80);

        let paths = RunPaths {
            data_dir,
            log_dir: dir.path().join("tb"),
            checkpoint_dir: dir.path().join("ckpt"),
        };
        let momentum = MomentumConfig::new().with_momentum(0.9).with_dampening(0.0);
        let config = TrainingConfig::new(
            ModelConfig::new(CLASS_NAMES.len())
                .with_hidden(16)
                .with_input_size(70),
            SgdConfig::new().with_momentum(Some(momentum)),
        )
        .with_epoch_count(2)
        .with_batch_size(2)
        .with_image_size(80)
        .with_decay_steps(2)
        .with_log_interval(1)
        .with_eval_interval(2)
        .with_worker_count(0);

        let report = train::<TestBackend>(&paths, config, Default::default()).unwrap();

        for file in ["config.json", "ckpt-0-model.mpk", "ckpt-0-optim.mpk", "model.mpk"] {
            assert!(paths.checkpoint_dir.join(file).exists(), "missing {file}");
        }
        assert!(!paths.checkpoint_dir.join("ckpt-1-model.mpk").exists());

        assert_eq!(report.test.ap.per_class.len(), CLASS_NAMES.len());
        assert!(report.test.loss.is_finite());
        assert!((0.0..=1.0).contains(&report.test.accuracy));
        for ap in report.ground_truth.per_class.iter().flatten() {
            assert_eq!(*ap, 1.0);
        }

        let run_dir = fs::read_dir(&paths.log_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let events = read_scalars(&run_dir).unwrap();
        let tagged = |tag: &str| -> Vec<(i64, f32)> {
            events
                .iter()
                .filter(|e| e.tag == tag)
                .map(|e| (e.step, e.value))
                .collect()
        };

        // 3 images, batch size 2: two steps per epoch
        assert_eq!(tagged("Training Loss").len(), 4);
        // the rate logged at a step is the one the next update uses
        assert_eq!(
            tagged("LR"),
            vec![(1, 1.0e-3), (2, 5.0e-4), (3, 5.0e-4), (4, 2.5e-4)]
        );
        // the final evaluation falls on step 4, already logged in the loop
        let maps: Vec<i64> = tagged("Test mAP").into_iter().map(|(step, _)| step).collect();
        assert_eq!(maps, vec![2, 4]);
    }
}
