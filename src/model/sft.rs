//! Spatial feature transform (SFT) layers.
//!
//! An SFT layer modulates a feature map with an affine transform whose
//! per-pixel scale and shift are predicted from the features concatenated
//! with the kernel-code maps:
//!
//!   out = features ⊙ σ(mul(features ‖ code)) + add(features ‖ code)

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu, sigmoid};

/// Slope of the LeakyReLU activations used throughout the network.
pub const LEAKY_SLOPE: f64 = 0.2;

/// Same-size 3×3 convolution.
pub fn conv3x3<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

#[derive(Config, Debug)]
pub struct SftLayerConfig {
    /// Feature channels.
    pub nf: usize,
    /// Kernel-code length.
    pub para: usize,
    #[config(default = 32)]
    pub hidden: usize,
}

#[derive(Module, Debug)]
pub struct SftLayer<B: Backend> {
    mul_conv1: Conv2d<B>,
    mul_conv2: Conv2d<B>,
    add_conv1: Conv2d<B>,
    add_conv2: Conv2d<B>,
}

impl SftLayerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SftLayer<B> {
        let cat = self.para + self.nf;
        SftLayer {
            mul_conv1: conv3x3([cat, self.hidden], device),
            mul_conv2: conv3x3([self.hidden, self.nf], device),
            add_conv1: conv3x3([cat, self.hidden], device),
            add_conv2: conv3x3([self.hidden, self.nf], device),
        }
    }
}

impl<B: Backend> SftLayer<B> {
    /// `features`: `[N, nf, H, W]`, `code_maps`: `[N, para, H, W]`.
    pub fn forward(&self, features: Tensor<B, 4>, code_maps: Tensor<B, 4>) -> Tensor<B, 4> {
        let cat = Tensor::cat(vec![features.clone(), code_maps], 1);
        let mul = sigmoid(
            self.mul_conv2
                .forward(leaky_relu(self.mul_conv1.forward(cat.clone()), LEAKY_SLOPE)),
        );
        let add = self
            .add_conv2
            .forward(leaky_relu(self.add_conv1.forward(cat), LEAKY_SLOPE));
        features * mul + add
    }
}

#[derive(Config, Debug)]
pub struct SftResidualBlockConfig {
    pub nf: usize,
    pub para: usize,
}

/// Two SFT-modulated convolutions with an identity skip.
#[derive(Module, Debug)]
pub struct SftResidualBlock<B: Backend> {
    sft1: SftLayer<B>,
    sft2: SftLayer<B>,
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl SftResidualBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SftResidualBlock<B> {
        SftResidualBlock {
            sft1: SftLayerConfig::new(self.nf, self.para).init(device),
            sft2: SftLayerConfig::new(self.nf, self.para).init(device),
            conv1: conv3x3([self.nf, self.nf], device),
            conv2: conv3x3([self.nf, self.nf], device),
        }
    }
}

impl<B: Backend> SftResidualBlock<B> {
    pub fn forward(&self, features: Tensor<B, 4>, code_maps: Tensor<B, 4>) -> Tensor<B, 4> {
        let fea1 = relu(self.sft1.forward(features.clone(), code_maps.clone()));
        let fea2 = relu(self.sft2.forward(self.conv1.forward(fea1), code_maps));
        features + self.conv2.forward(fea2)
    }
}
