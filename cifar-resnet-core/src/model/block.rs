use super::ActivationCapture;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

/// Two 3x3 convolutions with an additive shortcut.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

/// 1x1 strided projection used as shortcut when a block changes shape.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> BasicBlock<B> {
    /// # Shapes
    ///   - Input [batch_size, in_channels, height, width]
    ///   - Output [batch_size, out_channels, height / stride, width / stride]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        relu(out + identity)
    }
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

#[derive(Config, Debug)]
pub struct BasicBlockConfig {
    in_channels: usize,
    out_channels: usize,
    #[config(default = 1)]
    stride: usize,
    #[config(default = false)]
    bias: bool,
}

impl BasicBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BasicBlock<B> {
        let conv3x3 = |channels: [usize; 2], stride: usize| {
            Conv2dConfig::new(channels, [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(self.bias)
                .init(device)
        };
        let downsample = (self.stride != 1 || self.in_channels != self.out_channels).then(|| {
            Downsample {
                conv: Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
                    .with_stride([self.stride, self.stride])
                    .with_bias(false)
                    .init(device),
                bn: BatchNormConfig::new(self.out_channels).init(device),
            }
        });

        BasicBlock {
            conv1: conv3x3([self.in_channels, self.out_channels], self.stride),
            bn1: BatchNormConfig::new(self.out_channels).init(device),
            conv2: conv3x3([self.out_channels, self.out_channels], 1),
            bn2: BatchNormConfig::new(self.out_channels).init(device),
            downsample,
        }
    }
}

/// A residual stage: blocks applied in order, only the first one may change the shape.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<BasicBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    /// Same as [`forward`](Self::forward), recording each block's output as `{name}.{index}`.
    pub fn forward_captured(
        &self,
        mut x: Tensor<B, 4>,
        name: &str,
        capture: &mut ActivationCapture<B>,
    ) -> Tensor<B, 4> {
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            capture.record(&format!("{name}.{i}"), &x);
        }
        x
    }

    pub fn block_names(&self, name: &str) -> Vec<String> {
        (0..self.blocks.len()).map(|i| format!("{name}.{i}")).collect()
    }
}

#[derive(Config, Debug)]
pub struct LayerBlockConfig {
    num_blocks: usize,
    in_channels: usize,
    out_channels: usize,
    #[config(default = 1)]
    stride: usize,
    #[config(default = false)]
    bias: bool,
}

impl LayerBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LayerBlock<B> {
        let blocks = (0..self.num_blocks)
            .map(|i| {
                let config = if i == 0 {
                    BasicBlockConfig::new(self.in_channels, self.out_channels)
                        .with_stride(self.stride)
                } else {
                    BasicBlockConfig::new(self.out_channels, self.out_channels)
                };
                config.with_bias(self.bias).init(device)
            })
            .collect();
        LayerBlock { blocks }
    }
}
