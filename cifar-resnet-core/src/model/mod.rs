mod block;
mod capture;
mod mini;
mod resnet;

pub use capture::ActivationCapture;
pub use mini::{MiniResNet, MiniResNetConfig};
pub use resnet::{ResNet18, ResNet18Config};

use crate::data::CifarBatch;
use anyhow::{anyhow, Result};
use burn::{
    nn::loss::CrossEntropyLossConfig,
    prelude::*,
    record::{CompactRecorder, RecorderError},
    tensor::backend::AutodiffBackend,
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};
use clap::{builder::OsStr, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A network mapping `[batch_size, 3, height, width]` images to class logits.
pub trait ImageClassifier<B: Backend> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Forward pass that also records the outputs of the layers `capture` asks for.
    fn forward_captured(&self, images: Tensor<B, 4>, capture: &mut ActivationCapture<B>)
        -> Tensor<B, 2>;

    /// Weight of the first convolution, `[out_channels, in_channels, k, k]`.
    fn stem_filters(&self) -> Tensor<B, 4>;

    /// Every name [`ActivationCapture`] accepts for this network.
    fn layer_names(&self) -> Vec<String>;
}

fn forward_classification<B: Backend, M: ImageClassifier<B>>(
    model: &M,
    batch: CifarBatch<B>,
) -> ClassificationOutput<B> {
    let output = model.forward(batch.images);
    let loss = CrossEntropyLossConfig::new()
        .init(&output.device())
        .forward(output.clone(), batch.targets.clone());
    ClassificationOutput::new(loss, output, batch.targets)
}

macro_rules! impl_classification_steps {
    ($($model:ident),+) => {$(
        impl<B: AutodiffBackend> TrainStep<CifarBatch<B>, ClassificationOutput<B>> for $model<B> {
            fn step(&self, batch: CifarBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
                let item = forward_classification(self, batch);
                TrainOutput::new(self, item.loss.backward(), item)
            }
        }

        impl<B: Backend> ValidStep<CifarBatch<B>, ClassificationOutput<B>> for $model<B> {
            fn step(&self, batch: CifarBatch<B>) -> ClassificationOutput<B> {
                forward_classification(self, batch)
            }
        }
    )+};
}

impl_classification_steps!(MiniResNet, ResNet18);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Architecture {
    #[default]
    #[value(name = "mini-resnet")]
    MiniResNet,
    #[value(name = "resnet18")]
    ResNet18,
}

impl From<Architecture> for OsStr {
    fn from(value: Architecture) -> Self {
        match value {
            Architecture::MiniResNet => "mini-resnet".into(),
            Architecture::ResNet18 => "resnet18".into(),
        }
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    architecture: Architecture,
    #[config(default = 10)]
    num_classes: usize,
    /// Start from ImageNet weights and train only the head (ResNet-18 only)
    #[config(default = false)]
    pretrained: bool,
    /// Residual stages left trainable when fine-tuning, counted from the last one
    #[config(default = 0)]
    trainable_stages: usize,
}

impl ModelConfig {
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn pretrained(&self) -> bool {
        self.pretrained
    }

    pub fn trainable_stages(&self) -> usize {
        self.trainable_stages
    }

    pub fn mini_resnet(&self) -> MiniResNetConfig {
        MiniResNetConfig::new().with_num_classes(self.num_classes)
    }

    pub fn resnet18(&self) -> ResNet18Config {
        ResNet18Config::new().with_num_classes(self.num_classes)
    }

    /// A randomly initialised network of the configured architecture.
    pub fn init<B: Backend>(&self, device: &B::Device) -> AnyClassifier<B> {
        match self.architecture {
            Architecture::MiniResNet => AnyClassifier::MiniResNet(self.mini_resnet().init(device)),
            Architecture::ResNet18 => AnyClassifier::ResNet18(self.resnet18().init(device)),
        }
    }

    /// Rebuilds a trained network from a [`CompactRecorder`] file.
    pub fn load<B: Backend>(
        &self,
        checkpoint: impl AsRef<Path>,
        device: &B::Device,
    ) -> Result<AnyClassifier<B>> {
        let checkpoint = checkpoint.as_ref();
        let recorder = CompactRecorder::new();
        let error = |err: RecorderError| anyhow!("failed to load {}: {err:?}", checkpoint.display());
        Ok(match self.init::<B>(device) {
            AnyClassifier::MiniResNet(model) => AnyClassifier::MiniResNet(
                model
                    .load_file(checkpoint.to_path_buf(), &recorder, device)
                    .map_err(error)?,
            ),
            AnyClassifier::ResNet18(model) => AnyClassifier::ResNet18(
                model
                    .load_file(checkpoint.to_path_buf(), &recorder, device)
                    .map_err(error)?,
            ),
        })
    }
}

/// Either trained network, chosen at runtime from a saved [`ModelConfig`].
#[derive(Debug, Clone)]
pub enum AnyClassifier<B: Backend> {
    MiniResNet(MiniResNet<B>),
    ResNet18(ResNet18<B>),
}

impl<B: Backend> ImageClassifier<B> for AnyClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            AnyClassifier::MiniResNet(model) => model.forward(images),
            AnyClassifier::ResNet18(model) => model.forward(images),
        }
    }

    fn forward_captured(
        &self,
        images: Tensor<B, 4>,
        capture: &mut ActivationCapture<B>,
    ) -> Tensor<B, 2> {
        match self {
            AnyClassifier::MiniResNet(model) => model.forward_captured(images, capture),
            AnyClassifier::ResNet18(model) => model.forward_captured(images, capture),
        }
    }

    fn stem_filters(&self) -> Tensor<B, 4> {
        match self {
            AnyClassifier::MiniResNet(model) => model.stem_filters(),
            AnyClassifier::ResNet18(model) => model.stem_filters(),
        }
    }

    fn layer_names(&self) -> Vec<String> {
        match self {
            AnyClassifier::MiniResNet(model) => model.layer_names(),
            AnyClassifier::ResNet18(model) => model.layer_names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_save_and_load_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = ModelConfig::new(Architecture::MiniResNet);
        let AnyClassifier::MiniResNet(model) = config.init::<TestBackend>(&device) else {
            panic!("expected a MiniResNet");
        };
        model
            .clone()
            .save_file(dir.path().join("model"), &CompactRecorder::new())
            .unwrap();

        let loaded = config
            .load::<TestBackend>(dir.path().join("model"), &device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        // half precision recorder
        loaded
            .forward(images.clone())
            .into_data()
            .assert_approx_eq(&model.forward(images).into_data(), 1);
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let device = Default::default();
        let config = ModelConfig::new(Architecture::ResNet18);
        assert!(config
            .load::<TestBackend>("/nonexistent/model", &device)
            .is_err());
    }

    #[test]
    fn test_config_roundtrip_through_json() {
        let config = ModelConfig::new(Architecture::ResNet18)
            .with_pretrained(true)
            .with_trainable_stages(2);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("ResNet18"));
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.architecture(), Architecture::ResNet18);
        assert_eq!(back.trainable_stages(), 2);
    }
}
