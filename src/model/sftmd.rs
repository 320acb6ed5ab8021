//! SFTMD super-resolution network.
//!
//! Architecture:
//!
//!   head:      conv3 → LReLU → conv3 → LReLU → conv3            (in_nc → nf)
//!   body:      nb × SFT residual block, then SFT layer + conv3, global skip
//!   upsampler: conv3 → pixel shuffle → LReLU, per ×2 stage (×4 uses two)
//!   tail:      conv9                                              (nf → out_nc)
//!
//! The kernel code `[N, k]` is broadcast to `[N, k, H, W]` and consumed by
//! every SFT layer. Output is clamped to `[0, 1]`.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

use super::sft::{conv3x3, SftLayer, SftLayerConfig, SftResidualBlock, SftResidualBlockConfig, LEAKY_SLOPE};

#[derive(Config, Debug)]
pub struct SftmdConfig {
    #[config(default = 3)]
    pub in_nc: usize,
    #[config(default = 3)]
    pub out_nc: usize,
    #[config(default = 64)]
    pub nf: usize,
    #[config(default = 16)]
    pub nb: usize,
    #[config(default = 4)]
    pub scale: usize,
    #[config(default = 10)]
    pub code_length: usize,
}

#[derive(Module, Debug)]
pub struct Sftmd<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    blocks: Vec<SftResidualBlock<B>>,
    sft: SftLayer<B>,
    conv_mid: Conv2d<B>,
    upsample: Vec<Conv2d<B>>,
    conv_output: Conv2d<B>,
    /// Pixel-shuffle factor of each upsampling stage.
    shuffle: usize,
}

/// Upsampling stages as (count, factor): ×4 is two ×2 stages.
fn upsample_stages(scale: usize) -> (usize, usize) {
    match scale {
        1 => (0, 1),
        4 => (2, 2),
        s => (1, s),
    }
}

impl SftmdConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Sftmd<B> {
        let (stages, factor) = upsample_stages(self.scale);
        Sftmd {
            conv1: conv3x3([self.in_nc, 64], device),
            conv2: conv3x3([64, 64], device),
            conv3: conv3x3([64, self.nf], device),
            blocks: (0..self.nb)
                .map(|_| SftResidualBlockConfig::new(self.nf, self.code_length).init(device))
                .collect(),
            sft: SftLayerConfig::new(self.nf, self.code_length).init(device),
            conv_mid: conv3x3([self.nf, self.nf], device),
            upsample: (0..stages)
                .map(|_| conv3x3([self.nf, self.nf * factor * factor], device))
                .collect(),
            conv_output: Conv2dConfig::new([self.nf, self.out_nc], [9, 9])
                .with_padding(PaddingConfig2d::Explicit(4, 4))
                .init(device),
            shuffle: factor,
        }
    }
}

impl<B: Backend> Sftmd<B> {
    /// `lq`: `[N, in_nc, H, W]`, `code`: `[N, code_length]`.
    /// Returns `[N, out_nc, H·scale, W·scale]`.
    pub fn forward(&self, lq: Tensor<B, 4>, code: Tensor<B, 2>) -> Tensor<B, 4> {
        let [n, _, h, w] = lq.dims();
        let [_, k] = code.dims();
        let code_maps = code.reshape([n, k, 1, 1]).expand(Shape::new([n, k, h, w]));

        let x = leaky_relu(self.conv1.forward(lq), LEAKY_SLOPE);
        let x = leaky_relu(self.conv2.forward(x), LEAKY_SLOPE);
        let fea_bef = self.conv3.forward(x);

        let mut fea = fea_bef.clone();
        for block in &self.blocks {
            fea = block.forward(fea, code_maps.clone());
        }
        let fea = self
            .conv_mid
            .forward(self.sft.forward(fea + fea_bef, code_maps));

        let mut fea = fea;
        for conv in &self.upsample {
            fea = leaky_relu(pixel_shuffle(conv.forward(fea), self.shuffle), LEAKY_SLOPE);
        }

        self.conv_output.forward(fea).clamp(0.0, 1.0)
    }
}

/// Rearrange `[N, C·r², H, W]` into `[N, C, H·r, W·r]`.
pub fn pixel_shuffle<B: Backend>(x: Tensor<B, 4>, r: usize) -> Tensor<B, 4> {
    if r == 1 {
        return x;
    }
    let [n, crr, h, w] = x.dims();
    let c = crr / (r * r);
    x.reshape([n, c, r, r, h, w])
        .permute([0, 1, 4, 2, 5, 3])
        .reshape([n, c, h * r, w * r])
}
