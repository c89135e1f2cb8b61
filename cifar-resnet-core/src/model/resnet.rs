use super::{
    block::{LayerBlock, LayerBlockConfig},
    ActivationCapture, ImageClassifier,
};
use crate::weights::{ResNet18Weights, WeightsError};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    record::{FullPrecisionSettings, Recorder},
    tensor::activation::relu,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::path::Path;
use tracing::debug;

const STAGES: usize = 4;
const FEATURES: usize = 512;

/// torchvision parameter names -> module field paths
const KEY_REMAPS: [(&str, &str); 3] = [
    (r"downsample\.0\.", "downsample.conv."),
    (r"downsample\.1\.", "downsample.bn."),
    (r"^(layer[1-4])\.([0-9]+)\.", "${1}.blocks.${2}."),
];

/// ResNet-18 with the torchvision layout, so ImageNet weights load as-is.
#[derive(Module, Debug)]
pub struct ResNet18<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    layer1: LayerBlock<B>,
    layer2: LayerBlock<B>,
    layer3: LayerBlock<B>,
    layer4: LayerBlock<B>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> ResNet18<B> {
    /// Reads a torchvision `resnet18` state dict. The head keeps its ImageNet classes.
    pub fn load_pretrained(
        weights: impl AsRef<Path>,
        device: &B::Device,
    ) -> Result<Self, WeightsError> {
        let weights = weights.as_ref();
        let args = KEY_REMAPS.iter().fold(
            LoadArgs::new(weights.to_path_buf()),
            |args, (pattern, replacement)| args.with_key_remap(pattern, replacement),
        );
        let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|err| WeightsError::Record {
                path: weights.to_path_buf(),
                reason: format!("{err:?}"),
            })?;
        debug!(weights = %weights.display(), "loaded pretrained record");
        Ok(ResNet18Config::new()
            .with_num_classes(ResNet18Weights::ImageNet1kV1.num_classes())
            .init(device)
            .load_record(record))
    }

    /// Replaces the classification head with a freshly initialised one.
    pub fn with_classes(self, num_classes: usize) -> Self {
        let weight = self.fc.weight.val();
        let [d_input, _] = weight.dims();
        let fc = LinearConfig::new(d_input, num_classes).init(&weight.device());
        Self { fc, ..self }
    }

    /// Stops gradients for everything but the head and the last `trainable_stages` residual
    /// stages.
    pub fn freeze(self, trainable_stages: usize) -> Self {
        let frozen = STAGES - trainable_stages.min(STAGES);
        let stage = |index: usize, layer: LayerBlock<B>| {
            if index <= frozen {
                layer.no_grad()
            } else {
                layer
            }
        };
        Self {
            conv1: self.conv1.no_grad(),
            bn1: self.bn1.no_grad(),
            layer1: stage(1, self.layer1),
            layer2: stage(2, self.layer2),
            layer3: stage(3, self.layer3),
            layer4: stage(4, self.layer4),
            ..self
        }
    }

    fn stem(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        self.maxpool.forward(x)
    }

    fn stages(&self) -> [(&'static str, &LayerBlock<B>); STAGES] {
        [
            ("layer1", &self.layer1),
            ("layer2", &self.layer2),
            ("layer3", &self.layer3),
            ("layer4", &self.layer4),
        ]
    }

    fn head(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.avgpool.forward(x);
        self.fc.forward(x.flatten::<2>(1, 3))
    }
}

impl<B: Backend> ImageClassifier<B> for ResNet18<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem(images);
        let x = self
            .stages()
            .into_iter()
            .fold(x, |x, (_, layer)| layer.forward(x));
        self.head(x)
    }

    fn forward_captured(
        &self,
        images: Tensor<B, 4>,
        capture: &mut ActivationCapture<B>,
    ) -> Tensor<B, 2> {
        let mut x = self.stem(images);
        capture.record("stem", &x);
        for (name, layer) in self.stages() {
            x = layer.forward_captured(x, name, capture);
        }
        self.head(x)
    }

    fn stem_filters(&self) -> Tensor<B, 4> {
        self.conv1.weight.val()
    }

    fn layer_names(&self) -> Vec<String> {
        std::iter::once("stem".to_string())
            .chain(
                self.stages()
                    .into_iter()
                    .flat_map(|(name, layer)| layer.block_names(name)),
            )
            .collect()
    }
}

#[derive(Config, Debug)]
pub struct ResNet18Config {
    #[config(default = 1000)]
    num_classes: usize,
}

impl ResNet18Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet18<B> {
        let stage = |in_channels: usize, out_channels: usize, stride: usize| {
            LayerBlockConfig::new(2, in_channels, out_channels)
                .with_stride(stride)
                .init(device)
        };

        ResNet18 {
            conv1: Conv2dConfig::new([3, 64], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(64).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1: stage(64, 64, 1),
            layer2: stage(64, 128, 2),
            layer3: stage(128, 256, 2),
            layer4: stage(256, FEATURES, 2),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(FEATURES, self.num_classes).init(device),
        }
    }
}
