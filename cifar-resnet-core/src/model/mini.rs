use super::{
    block::{LayerBlock, LayerBlockConfig},
    ActivationCapture, ImageClassifier,
};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

/// A small ResNet-18 style network trained from scratch on 32x32 inputs.
#[derive(Module, Debug)]
pub struct MiniResNet<B: Backend> {
    stem: Stem<B>,
    layers: Vec<LayerBlock<B>>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

/// conv3x3 -> batch norm -> relu -> 2x2 max pool
#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    pool: MaxPool2d,
}

impl<B: Backend> Stem<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn.forward(self.conv.forward(x)));
        self.pool.forward(x)
    }
}

impl<B: Backend> MiniResNet<B> {
    fn layer_name(index: usize) -> String {
        format!("layer{}", index + 1)
    }

    fn head(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.avgpool.forward(x); // [batch_size, channels, 1, 1]
        self.fc.forward(x.flatten::<2>(1, 3))
    }
}

impl<B: Backend> ImageClassifier<B> for MiniResNet<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, 32, 32]
    ///   - Output [batch_size, num_classes]
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(images);
        let x = self.layers.iter().fold(x, |x, layer| layer.forward(x));
        self.head(x)
    }

    fn forward_captured(
        &self,
        images: Tensor<B, 4>,
        capture: &mut ActivationCapture<B>,
    ) -> Tensor<B, 2> {
        let mut x = self.stem.forward(images);
        capture.record("stem", &x);
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward_captured(x, &Self::layer_name(i), capture);
        }
        self.head(x)
    }

    fn stem_filters(&self) -> Tensor<B, 4> {
        self.stem.conv.weight.val()
    }

    fn layer_names(&self) -> Vec<String> {
        std::iter::once("stem".to_string())
            .chain(
                self.layers
                    .iter()
                    .enumerate()
                    .flat_map(|(i, layer)| layer.block_names(&Self::layer_name(i))),
            )
            .collect()
    }
}

#[derive(Config, Debug)]
pub struct MiniResNetConfig {
    #[config(default = 3)]
    in_channels: usize,
    #[config(default = 10)]
    num_classes: usize,
    #[config(default = 64)]
    channels: usize,
    #[config(default = 3)]
    stages: usize,
    #[config(default = 2)]
    blocks_per_stage: usize,
}

impl MiniResNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MiniResNet<B> {
        let stem = Stem {
            conv: Conv2dConfig::new([self.in_channels, self.channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            bn: BatchNormConfig::new(self.channels).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        };
        let layers = (0..self.stages)
            .map(|_| {
                LayerBlockConfig::new(self.blocks_per_stage, self.channels, self.channels)
                    .with_bias(true)
                    .init(device)
            })
            .collect();

        MiniResNet {
            stem,
            layers,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(self.channels, self.num_classes).init(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = MiniResNetConfig::new().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(model.forward(images).dims(), [2, 10]);
    }

    #[test]
    fn test_layer_names_and_capture() {
        let device = Default::default();
        let model = MiniResNetConfig::new()
            .with_channels(8)
            .init::<TestBackend>(&device);
        let names = model.layer_names();
        assert_eq!(names.len(), 7);
        assert_eq!(names[0], "stem");
        assert_eq!(names[6], "layer3.1");

        let mut capture = ActivationCapture::new(["stem", "layer1.0"]);
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let logits = model.forward_captured(images.clone(), &mut capture);

        assert_eq!(capture.take("stem").unwrap().dims(), [1, 8, 16, 16]);
        assert_eq!(capture.take("layer1.0").unwrap().dims(), [1, 8, 16, 16]);
        logits
            .into_data()
            .assert_approx_eq(&model.forward(images).into_data(), 4);
    }

    #[test]
    fn test_stem_filters() {
        let device = Default::default();
        let model = MiniResNetConfig::new().init::<TestBackend>(&device);
        assert_eq!(model.stem_filters().dims(), [64, 3, 3, 3]);
    }
}
