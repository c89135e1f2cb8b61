use crate::{
    evaluate, predict, train,
    visualize::{save_activations, save_filters, ActivationSource, DEFAULT_ACTIVATION_LAYER},
    Architecture, ModelConfig, Output, PredictConfig, TrainingConfig,
};
use anyhow::Result;
use burn::{backend::Autodiff, optim::AdamConfig};
use clap::{ArgAction, Args, CommandFactory as _, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    subcmd: SubCmd,
    /// Device inside the compiled backend, GPU when the backend has one by default
    #[arg(long, global = true)]
    device: Option<DeviceKind>,
    /// More logs, repeat for trace level (RUST_LOG takes precedence)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceKind {
    Cpu,
    Gpu,
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// Directory to save artifacts (The directory will be recreated if it exists)
    #[arg(short, long, default_value = "cifar_resnet_artifact")]
    artifact_dir: PathBuf,
    /// Where CIFAR-10 is stored, downloaded there when missing
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    #[arg(short, long, default_value = "5")]
    num_epochs: usize,
    #[arg(short, long, default_value = "64")]
    batch_size: usize,
    /// Number of workers for data loading
    #[arg(short = 'w', long, default_value = "4")]
    num_workers: usize,
    /// Learning rate for the Adam optimizer
    #[arg(short, long, default_value = "1.0e-3")]
    learning_rate: f64,
    /// Decay the learning rate linearly to this value over the run
    #[arg(long)]
    final_learning_rate: Option<f64>,
    /// Stop when validation accuracy has not improved for this many epochs
    #[arg(short, long)]
    early_stopping: Option<usize>,
    /// Random seed for reproducibility
    #[arg(short, long, default_value = "42")]
    seed: u64,
    /// Log training progress instead of showing the terminal dashboard
    #[arg(long)]
    no_dashboard: bool,
}

impl TrainArgs {
    fn config(self, model: ModelConfig) -> (PathBuf, TrainingConfig) {
        let config = TrainingConfig::new(model, AdamConfig::new(), self.data_dir)
            .with_num_epochs(self.num_epochs)
            .with_batch_size(self.batch_size)
            .with_num_workers(self.num_workers)
            .with_learning_rate(self.learning_rate)
            .with_final_learning_rate(self.final_learning_rate)
            .with_early_stopping(self.early_stopping)
            .with_seed(self.seed)
            .with_dashboard(!self.no_dashboard);
        (self.artifact_dir, config)
    }
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Train a residual network from scratch on CIFAR-10
    Train {
        /// Model type
        #[arg(short, long, default_value = Architecture::default())]
        model: Architecture,
        #[command(flatten)]
        args: TrainArgs,
    },
    /// Fine-tune an ImageNet ResNet-18 on CIFAR-10 with a new classification head
    Finetune {
        /// torchvision resnet18 `.pth` file, downloaded into the cache directory when omitted
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Residual stages to train along with the head, counted from the last (0 to 4)
        #[arg(short, long, default_value = "0")]
        trainable_stages: usize,
        #[command(flatten)]
        args: TrainArgs,
    },
    /// Print the test accuracy of a trained model
    Evaluate {
        #[arg(short, long, default_value = "cifar_resnet_artifact")]
        artifact_dir: PathBuf,
    },
    /// Draw the first convolution layer's filters into `filters.png`
    Filters {
        #[arg(short, long, default_value = "cifar_resnet_artifact")]
        artifact_dir: PathBuf,
    },
    /// Draw the feature maps of one layer for one image into `activations.png`
    Activations {
        #[arg(short, long, default_value = "cifar_resnet_artifact")]
        artifact_dir: PathBuf,
        /// Layer name, such as `stem` or `layer1.0`
        #[arg(short, long, default_value = DEFAULT_ACTIVATION_LAYER)]
        layer: String,
        /// Test image index, random when neither this nor --image is given
        #[arg(short, long, conflicts_with = "image")]
        index: Option<usize>,
        /// Use this image file instead of a test image
        #[arg(long)]
        image: Option<PathBuf>,
        /// Number of feature maps to draw
        #[arg(short, long, default_value = "16")]
        channels: usize,
    },
    /// Classify images with a trained model
    Predict {
        #[arg(short, long, default_value = "cifar_resnet_artifact")]
        artifact_dir: PathBuf,
        /// Method to output the predictions
        #[arg(short, long, default_value = "tty")]
        output: Output,
        /// Number of most probable classes reported per image
        #[arg(short = 'k', long, default_value = "3")]
        top_k: usize,
        #[arg(short, long, default_value = "32")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        /// Image file or root of images directory
        input: PathBuf,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32, i8>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, u8>;
#[cfg(not(any(feature = "tch", feature = "candle")))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;

#[cfg(feature = "tch")]
fn device(kind: Option<DeviceKind>) -> burn::backend::libtorch::LibTorchDevice {
    use burn::backend::libtorch::LibTorchDevice;
    match kind {
        Some(DeviceKind::Cpu) => LibTorchDevice::Cpu,
        #[cfg(target_os = "macos")]
        Some(DeviceKind::Gpu) | None => LibTorchDevice::Mps,
        #[cfg(not(target_os = "macos"))]
        Some(DeviceKind::Gpu) | None => LibTorchDevice::Cuda(0),
    }
}

#[cfg(all(feature = "candle", not(feature = "tch")))]
fn device(kind: Option<DeviceKind>) -> burn::backend::candle::CandleDevice {
    use burn::backend::candle::CandleDevice;
    match kind {
        Some(DeviceKind::Cpu) => CandleDevice::Cpu,
        #[cfg(target_os = "macos")]
        Some(DeviceKind::Gpu) | None => CandleDevice::Metal(0),
        #[cfg(not(target_os = "macos"))]
        Some(DeviceKind::Gpu) | None => CandleDevice::Cuda(0),
    }
}

#[cfg(not(any(feature = "tch", feature = "candle")))]
fn device(kind: Option<DeviceKind>) -> burn::backend::ndarray::NdArrayDevice {
    if let Some(DeviceKind::Gpu) = kind {
        tracing::warn!("the ndarray backend only runs on the CPU");
    }
    burn::backend::ndarray::NdArrayDevice::Cpu
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn run() {
    let args = Cli::parse();
    init_tracing(args.verbose);
    if let Err(err) = execute(args) {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn execute(args: Cli) -> Result<()> {
    let device = device(args.device);
    match args.subcmd {
        SubCmd::Train { model, args } => {
            let (artifact_dir, config) = args.config(ModelConfig::new(model));
            train::<MyAutodiffBackend>(artifact_dir, config, device)?;
        }
        SubCmd::Finetune {
            weights,
            trainable_stages,
            args,
        } => {
            let model = ModelConfig::new(Architecture::ResNet18)
                .with_pretrained(true)
                .with_trainable_stages(trainable_stages);
            let (artifact_dir, config) = args.config(model);
            train::<MyAutodiffBackend>(artifact_dir, config.with_pretrained_weights(weights), device)?;
        }
        SubCmd::Evaluate { artifact_dir } => {
            let report = evaluate::<MyBackend>(artifact_dir, &device)?;
            for class in &report.per_class {
                println!(
                    "{:<12}{:>6.2}% ({}/{})",
                    class.class, class.accuracy, class.correct, class.total
                );
            }
            println!("Test Accuracy: {:.2}%", report.accuracy);
        }
        SubCmd::Filters { artifact_dir } => {
            let path = save_filters::<MyBackend>(artifact_dir, &device)?;
            println!("{}", path.display());
        }
        SubCmd::Activations {
            artifact_dir,
            layer,
            index,
            image,
            channels,
        } => {
            let source = match image {
                Some(path) => ActivationSource::File(path),
                None => ActivationSource::TestImage(index),
            };
            let path =
                save_activations::<MyBackend>(artifact_dir, &source, &layer, channels, &device)?;
            println!("{}", path.display());
        }
        SubCmd::Predict {
            artifact_dir,
            output,
            top_k,
            batch_size,
            num_workers,
            input,
        } => predict::<MyBackend>(
            artifact_dir,
            PredictConfig::new(input, output)
                .with_top_k(top_k)
                .with_batch_size(batch_size)
                .with_num_workers(num_workers),
            device,
        )?,
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "cifar-resnet", &mut std::io::stdout());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_finetune_args() {
        let cli = Cli::try_parse_from([
            "cifar-resnet",
            "finetune",
            "-t",
            "1",
            "--final-learning-rate",
            "1e-5",
            "--device",
            "cpu",
            "--no-dashboard",
        ])
        .unwrap();
        assert!(matches!(cli.device, Some(DeviceKind::Cpu)));
        let SubCmd::Finetune {
            trainable_stages,
            args,
            ..
        } = cli.subcmd
        else {
            panic!("expected finetune");
        };
        assert_eq!(trainable_stages, 1);
        let (artifact_dir, config) = args.config(ModelConfig::new(Architecture::ResNet18));
        assert_eq!(artifact_dir, PathBuf::from("cifar_resnet_artifact"));
        assert_eq!(config.final_learning_rate, Some(1e-5));
        assert_eq!(config.num_epochs, 5);
        assert!(!config.dashboard);
    }

    #[test]
    fn test_activations_image_conflicts_with_index() {
        assert!(Cli::try_parse_from([
            "cifar-resnet",
            "activations",
            "--index",
            "3",
            "--image",
            "cat.png"
        ])
        .is_err());
    }
}
