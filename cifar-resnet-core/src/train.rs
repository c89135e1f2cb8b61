use crate::{
    data::CifarBatcher,
    dataset::{CifarDataset, CifarSplit},
    evaluate::evaluate,
    model::{AnyClassifier, Architecture, ModelConfig, ResNet18},
    visualize::{save_activations, save_filters, ActivationSource, DEFAULT_ACTIVATION_LAYER},
    weights::{self, ResNet18Weights},
};
use anyhow::{anyhow, ensure, Context, Result};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    lr_scheduler::linear::LinearLrSchedulerConfig,
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{
            store::{Aggregate, Direction, Split},
            AccuracyMetric, CpuMemory, CpuUse, LearningRateMetric, LossMetric,
        },
        renderer::{MetricState, MetricsRenderer, TrainingProgress},
        LearnerBuilder, MetricEarlyStoppingStrategy, StoppingCondition,
    },
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub(crate) const TRAIN_CONFIG: &str = "train_config.json";
pub(crate) const MODEL_FILE: &str = "model";

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
    /// Root of the CIFAR-10 download
    pub data_dir: PathBuf,
    /// torchvision `resnet18` weights; fetched into the cache directory when absent
    pub pretrained_weights: Option<PathBuf>,
    #[config(default = 5)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Learning rate reached at the last iteration, constant when absent
    pub final_learning_rate: Option<f64>,
    /// Stop after this many epochs without validation accuracy improvement
    pub early_stopping: Option<usize>,
    /// Terminal dashboard while fitting, progress goes to the log otherwise
    #[config(default = true)]
    pub dashboard: bool,
}

impl TrainingConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.num_epochs > 0, "num_epochs must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(
            self.learning_rate > 0.0 && self.learning_rate <= 1.0,
            "learning_rate must be in (0, 1], got {}",
            self.learning_rate
        );
        if let Some(final_lr) = self.final_learning_rate {
            ensure!(
                (0.0..=1.0).contains(&final_lr),
                "final_learning_rate must be in [0, 1], got {final_lr}"
            );
        }
        ensure!(
            !self.model.pretrained() || self.model.architecture() == Architecture::ResNet18,
            "pretrained weights are only available for resnet18"
        );
        ensure!(
            self.model.trainable_stages() <= 4,
            "ResNet-18 has 4 residual stages, cannot train {}",
            self.model.trainable_stages()
        );
        Ok(())
    }

    /// Optimizer steps over the whole run, the horizon of the learning rate schedule.
    fn num_iterations(&self, train_len: usize) -> usize {
        (self.num_epochs * train_len.div_ceil(self.batch_size)).max(1)
    }
}

fn create_artifact_dir(artifact_dir: &Path) -> Result<()> {
    // Remove existing artifacts before to get an accurate learner summary
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir)
        .with_context(|| format!("failed to create {}", artifact_dir.display()))
}

/// Reports fitting progress through `tracing`, for runs without a terminal.
struct LogRenderer;

impl LogRenderer {
    fn metric(split: &str, state: MetricState) {
        let entry = match state {
            MetricState::Generic(entry) | MetricState::Numeric(entry, _) => entry,
        };
        debug!(split, metric = %entry.name, "{}", entry.formatted);
    }

    fn progress(split: &str, item: TrainingProgress) {
        if item.progress.items_processed == item.progress.items_total {
            info!(
                split,
                epoch = item.epoch,
                epochs = item.epoch_total,
                iteration = item.iteration,
                "epoch done"
            );
        }
    }
}

impl MetricsRenderer for LogRenderer {
    fn update_train(&mut self, state: MetricState) {
        Self::metric("train", state);
    }

    fn update_valid(&mut self, state: MetricState) {
        Self::metric("valid", state);
    }

    fn render_train(&mut self, item: TrainingProgress) {
        Self::progress("train", item);
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        Self::progress("valid", item);
    }
}

/// Fits the learner on `$model`, then saves the trained weights as the run's model file.
macro_rules! fit {
    ($backend:ty, $model:expr, $config:expr, $artifact_dir:expr, $device:expr, $lr:expr, $train:expr, $valid:expr) => {{
        let mut builder = LearnerBuilder::new($artifact_dir)
            .metric_train_numeric(AccuracyMetric::new())
            .metric_valid_numeric(AccuracyMetric::new())
            .metric_train_numeric(LossMetric::new())
            .metric_valid_numeric(LossMetric::new())
            .metric_train(LearningRateMetric::new())
            .metric_train(CpuUse::new())
            .metric_train(CpuMemory::new())
            .with_file_checkpointer(CompactRecorder::new())
            .devices(vec![$device.clone()])
            .num_epochs($config.num_epochs)
            // The process already has a global tracing subscriber
            .with_application_logger(None)
            .summary();
        if !$config.dashboard {
            builder = builder.renderer(LogRenderer);
        }
        if let Some(n_epochs) = $config.early_stopping {
            builder = builder.early_stopping(MetricEarlyStoppingStrategy::new::<
                AccuracyMetric<$backend>,
            >(
                Aggregate::Mean,
                Direction::Highest,
                Split::Valid,
                StoppingCondition::NoImprovementSince { n_epochs },
            ));
        }
        let learner = builder.build($model, $config.optimizer.init(), $lr);
        learner
            .fit($train, $valid)
            .save_file($artifact_dir.join(MODEL_FILE), &CompactRecorder::new())
            .map_err(|err| anyhow!("failed to save the trained model: {err:?}"))?;
    }};
}

/// ImageNet ResNet-18 with a new head for `config`'s classes and a frozen backbone.
fn pretrained_resnet18<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<ResNet18<B>> {
    let path = match &config.pretrained_weights {
        Some(path) => path.clone(),
        None => weights::fetch(ResNet18Weights::ImageNet1kV1, weights::default_cache_dir()?)?,
    };
    let model = ResNet18::<B>::load_pretrained(&path, device)?
        .freeze(config.model.trainable_stages())
        .with_classes(config.model.num_classes());
    info!(
        weights = %path.display(),
        trainable_stages = config.model.trainable_stages(),
        "replaced the classification head of the pretrained ResNet-18"
    );
    Ok(model)
}

/// Trains a network on CIFAR-10, then evaluates it and renders its filters into `artifact_dir`.
pub fn train<B: AutodiffBackend>(
    artifact_dir: impl AsRef<Path>,
    config: TrainingConfig,
    device: B::Device,
) -> Result<()> {
    let artifact_dir = artifact_dir.as_ref();
    config.validate()?;
    create_artifact_dir(artifact_dir)?;

    B::seed(config.seed);

    config
        .save(artifact_dir.join(TRAIN_CONFIG))
        .context("Config should be saved successfully")?;

    let train_set = CifarDataset::new(&config.data_dir, CifarSplit::Train)
        .context("Training set failed to be loaded")?;
    // The test split doubles as validation set
    let test_set = CifarDataset::new(&config.data_dir, CifarSplit::Test)
        .context("Test set failed to be loaded")?;

    let lr_scheduler = LinearLrSchedulerConfig::new(
        config.learning_rate,
        config.final_learning_rate.unwrap_or(config.learning_rate),
        config.num_iterations(train_set.len()),
    )
    .init();

    let dataloader_train = DataLoaderBuilder::new(CifarBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train_set);
    let dataloader_valid =
        DataLoaderBuilder::new(CifarBatcher::<B::InnerBackend>::new(device.clone()))
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .build(test_set);

    info!(
        architecture = ?config.model.architecture(),
        pretrained = config.model.pretrained(),
        epochs = config.num_epochs,
        batch_size = config.batch_size,
        "training started"
    );
    match config.model.architecture() {
        Architecture::MiniResNet => {
            let model = config.model.mini_resnet().init::<B>(&device);
            fit!(B, model, config, artifact_dir, device, lr_scheduler, dataloader_train, dataloader_valid);
        }
        Architecture::ResNet18 if config.model.pretrained() => {
            let model = pretrained_resnet18::<B>(&config, &device)?;
            fit!(B, model, config, artifact_dir, device, lr_scheduler, dataloader_train, dataloader_valid);
        }
        Architecture::ResNet18 => {
            let model = config.model.resnet18().init::<B>(&device);
            fit!(B, model, config, artifact_dir, device, lr_scheduler, dataloader_train, dataloader_valid);
        }
    }
    info!(artifact_dir = %artifact_dir.display(), "training finished");

    evaluate::<B::InnerBackend>(artifact_dir, &device)?;
    save_filters::<B::InnerBackend>(artifact_dir, &device)?;
    if config.model.pretrained() {
        save_activations::<B::InnerBackend>(
            artifact_dir,
            &ActivationSource::TestImage(Some(0)),
            DEFAULT_ACTIVATION_LAYER,
            16,
            &device,
        )?;
    }
    Ok(())
}

/// Reads back the configuration and final model of a finished run.
pub(crate) fn load_trained<B: Backend>(
    artifact_dir: impl AsRef<Path>,
    device: &B::Device,
) -> Result<(TrainingConfig, AnyClassifier<B>)> {
    let artifact_dir = artifact_dir.as_ref();
    let config_path = artifact_dir.join(TRAIN_CONFIG);
    let config = TrainingConfig::load(&config_path)
        .map_err(|err| anyhow!("failed to read {}: {err:?}", config_path.display()))?;
    let model = config.model.load::<B>(artifact_dir.join(MODEL_FILE), device)?;
    Ok((config, model))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        dataset::tests::write_batches,
        evaluate::{EvaluationReport, EVALUATION_FILE},
        model::ImageClassifier,
        visualize::{ACTIVATIONS_FILE, FILTERS_FILE},
    };
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;

    fn config(architecture: Architecture) -> TrainingConfig {
        TrainingConfig::new(ModelConfig::new(architecture), AdamConfig::new(), "data".into())
    }

    #[test]
    fn test_defaults_match_the_reference_run() {
        let config = config(Architecture::MiniResNet);
        assert_eq!(config.num_epochs, 5);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.learning_rate, 1.0e-3);
        assert!(config.final_learning_rate.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_num_iterations() {
        let config = config(Architecture::MiniResNet);
        // 50 000 / 64 = 781.25 batches per epoch
        assert_eq!(config.num_iterations(50_000), 5 * 782);
        assert_eq!(config.num_iterations(0), 1);
    }

    #[test]
    fn test_validate_rejects_pretrained_mini_resnet() {
        let config = TrainingConfig::new(
            ModelConfig::new(Architecture::MiniResNet).with_pretrained(true),
            AdamConfig::new(),
            "data".into(),
        );
        assert!(config.validate().is_err());
        assert!(config.with_learning_rate(0.0).validate().is_err());
    }

    /// Lays out a finished, untrained MiniResNet run in `artifact_dir` with a tiny dataset under
    /// `artifact_dir/data`: two training images per batch file and test labels 3, 3, 7.
    pub(crate) fn saved_run(artifact_dir: &Path) -> TrainingConfig {
        let data_dir = artifact_dir.join("data");
        write_batches(&data_dir, &[0, 1], &[3, 3, 7]);
        let config = TrainingConfig::new(
            ModelConfig::new(Architecture::MiniResNet),
            AdamConfig::new(),
            data_dir,
        )
        .with_batch_size(2)
        .with_num_workers(1);
        config.save(artifact_dir.join(TRAIN_CONFIG)).unwrap();
        let AnyClassifier::MiniResNet(model) = config.model.init::<TestBackend>(&Default::default())
        else {
            unreachable!()
        };
        model
            .save_file(artifact_dir.join(MODEL_FILE), &CompactRecorder::new())
            .unwrap();
        config
    }

    #[test]
    fn test_load_trained() {
        let dir = tempfile::tempdir().unwrap();
        saved_run(dir.path());

        let (loaded_config, loaded) =
            load_trained::<TestBackend>(dir.path(), &Default::default()).unwrap();
        assert_eq!(loaded_config.batch_size, 2);
        assert_eq!(loaded_config.data_dir, dir.path().join("data"));
        assert_eq!(loaded.layer_names().len(), 7);
    }

    #[test]
    fn test_train_writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        write_batches(&data_dir, &[0, 1], &[1, 2]);
        let artifact_dir = dir.path().join("run");
        let config = TrainingConfig::new(
            ModelConfig::new(Architecture::MiniResNet),
            AdamConfig::new(),
            data_dir,
        )
        .with_num_epochs(1)
        .with_batch_size(4)
        .with_num_workers(1)
        .with_final_learning_rate(Some(1.0e-4))
        .with_dashboard(false);

        train::<Autodiff<TestBackend>>(&artifact_dir, config, Default::default()).unwrap();

        for file in [TRAIN_CONFIG, "model.mpk", EVALUATION_FILE, FILTERS_FILE] {
            assert!(artifact_dir.join(file).is_file(), "{file} is missing");
        }
        // Only fine-tuning renders activations
        assert!(!artifact_dir.join(ACTIVATIONS_FILE).exists());
        // Logs go to the process subscriber, not to a learner log file
        assert!(!artifact_dir.join("experiment.log").exists());

        let report: EvaluationReport =
            serde_json::from_reader(std::fs::File::open(artifact_dir.join(EVALUATION_FILE)).unwrap())
                .unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.per_class.len(), 10);

        let (config, _) = load_trained::<TestBackend>(&artifact_dir, &Default::default()).unwrap();
        assert_eq!(config.num_epochs, 1);
        assert!(!config.dashboard);
    }

    #[test]
    fn test_load_trained_without_run() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_trained::<TestBackend>(dir.path(), &Default::default()).is_err());
    }
}
