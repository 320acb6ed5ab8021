//! Synthetic degradation: blur, bicubic downsampling and optional noise.
//!
//! For each image in the batch a kernel is drawn from the sampler, every
//! channel is blurred with reflect padding, then downsampled by the scale
//! factor. The kernel's PCA code (plus the noise level when noise is on) is
//! returned alongside the low-resolution image so the network knows which
//! degradation it is inverting.

use anyhow::{ensure, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::config::DegradationOptions;
use crate::kernel::{isotropic_gaussian_kernel, KernelSampler};
use crate::pca::KernelBasis;

/// Noise levels are scaled by this factor when appended to the kernel code.
const NOISE_CODE_SCALE: f64 = 10.0;

/// Low-resolution input and the code of the degradation that produced it.
pub struct DegradedPair<B: Backend> {
    /// `[N, C, H / scale, W / scale]` in `[0, 1]`.
    pub lq: Tensor<B, 4>,
    /// `[N, code_len]`.
    pub kernel_code: Tensor<B, 2>,
}

pub struct Preprocessor<'a> {
    scale: usize,
    basis: &'a KernelBasis,
    sampler: KernelSampler,
    opts: DegradationOptions,
    rng: StdRng,
}

impl<'a> Preprocessor<'a> {
    pub fn new(
        scale: usize,
        basis: &'a KernelBasis,
        sampler: KernelSampler,
        opts: DegradationOptions,
        seed: u64,
    ) -> Result<Self> {
        ensure!(scale >= 1, "scale factor must be at least 1");
        ensure!(
            sampler.kernel_len() == basis.kernel_len(),
            "sampler draws {}-pixel kernels but the basis expects {}",
            sampler.kernel_len(),
            basis.kernel_len()
        );
        Ok(Self {
            scale,
            basis,
            sampler,
            opts,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Length of the codes produced by this preprocessor.
    pub fn code_len(&self) -> usize {
        self.basis.dim() + usize::from(self.opts.noise)
    }

    /// Degrade a `[N, C, H, W]` ground-truth batch.
    pub fn degrade<B: Backend>(&mut self, gt: &Tensor<B, 4>) -> Result<DegradedPair<B>> {
        let [n, c, h, w] = gt.dims();
        ensure!(
            h % self.scale == 0 && w % self.scale == 0,
            "image of {w}x{h} is not divisible by scale {}",
            self.scale
        );
        let device = gt.device();
        let data: Vec<f32> = gt
            .clone()
            .reshape([n * c * h * w])
            .into_data()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("tensor conversion failed: {e:?}"))?;

        let (lh, lw) = (h / self.scale, w / self.scale);
        let mut lq = Vec::with_capacity(n * c * lh * lw);
        let mut codes = Vec::with_capacity(n * self.code_len());

        for item in data.chunks_exact(c * h * w) {
            let kernel = self.sampler.sample(&mut self.rng)?;
            let noise_level = self.draw_noise_level();

            let start = lq.len();
            for plane in item.chunks_exact(h * w) {
                let blurred = blur_reflect(plane, h, w, &kernel);
                lq.extend(downsample(blurred, h, w, self.scale)?);
            }
            if noise_level > 0.0 {
                for v in &mut lq[start..] {
                    *v += (self.rng.sample::<f64, _>(StandardNormal) * noise_level) as f32;
                }
            }
            for v in &mut lq[start..] {
                *v = v.clamp(0.0, 1.0);
            }

            codes.extend(self.basis.encode(&kernel)?.iter().map(|&v| v as f32));
            if self.opts.noise {
                codes.push((noise_level * NOISE_CODE_SCALE) as f32);
            }
        }

        Ok(DegradedPair {
            lq: Tensor::from_data(TensorData::new(lq, [n, c, lh, lw]), &device),
            kernel_code: Tensor::from_data(TensorData::new(codes, [n, self.code_len()]), &device),
        })
    }

    /// Code of a fixed isotropic kernel, repeated `batch` times.
    ///
    /// Used for inputs that come from disk, where no ground truth exists to
    /// degrade and the blur is assumed rather than known.
    pub fn kernel_code_for_sigma<B: Backend>(
        &self,
        sigma: f64,
        batch: usize,
        device: &B::Device,
    ) -> Result<Tensor<B, 2>> {
        let kernel = isotropic_gaussian_kernel(self.sampler.size, sigma)?;
        let mut code: Vec<f32> = self.basis.encode(&kernel)?.iter().map(|&v| v as f32).collect();
        if self.opts.noise {
            code.push(0.0);
        }
        let len = code.len();
        let codes: Vec<f32> = code.iter().copied().cycle().take(len * batch).collect();
        Ok(Tensor::from_data(TensorData::new(codes, [batch, len]), device))
    }

    fn draw_noise_level(&mut self) -> f64 {
        if !self.opts.noise {
            return 0.0;
        }
        let level = self.rng.gen::<f64>() * self.opts.noise_high;
        if self.rng.gen::<f64>() < self.opts.rate_cln {
            0.0
        } else {
            level
        }
    }
}

/// Mirror an out-of-range index back into `0..n` without repeating the edge.
fn reflect(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let m = i.rem_euclid(period);
    if m < n as isize {
        m as usize
    } else {
        (period - m) as usize
    }
}

/// Cross-correlate one `h × w` plane with `kernel`, reflect-padding the borders.
fn blur_reflect(plane: &[f32], h: usize, w: usize, kernel: &Array2<f64>) -> Vec<f32> {
    let (kh, kw) = kernel.dim();
    let (ph, pw) = ((kh / 2) as isize, (kw / 2) as isize);
    let mut out = vec![0.0f32; h * w];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f64;
            for ky in 0..kh {
                let sy = reflect(y as isize + ky as isize - ph, h);
                let row = &plane[sy * w..(sy + 1) * w];
                for kx in 0..kw {
                    let sx = reflect(x as isize + kx as isize - pw, w);
                    acc += kernel[[ky, kx]] * row[sx] as f64;
                }
            }
            out[y * w + x] = acc as f32;
        }
    }
    out
}

/// Antialiased bicubic downsampling of one plane by an integer factor.
fn downsample(plane: Vec<f32>, h: usize, w: usize, scale: usize) -> Result<Vec<f32>> {
    if scale == 1 {
        return Ok(plane);
    }
    let buf: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_raw(w as u32, h as u32, plane)
        .ok_or_else(|| anyhow::anyhow!("plane does not match {w}x{h}"))?;
    let small = imageops::resize(
        &buf,
        (w / scale) as u32,
        (h / scale) as u32,
        FilterType::CatmullRom,
    );
    Ok(small.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn basis(size: usize, k: usize) -> (KernelSampler, KernelBasis) {
        let sampler = KernelSampler::new(size, 0.2, 4.0, 1.0, 3.0).unwrap();
        let samples = sampler.sample_batch(200, &mut StdRng::seed_from_u64(1), None).unwrap();
        let basis = KernelBasis::fit(&samples, k).unwrap();
        (sampler, basis)
    }

    fn ramp(c: usize, h: usize, w: usize) -> Tensor<B, 4> {
        let data: Vec<f32> = (0..c * h * w).map(|i| (i % 17) as f32 / 16.0).collect();
        Tensor::from_data(TensorData::new(data, [1, c, h, w]), &Default::default())
    }

    #[test]
    fn reflect_mirrors_without_repeating_edge() {
        assert_eq!(reflect(-1, 5), 1);
        assert_eq!(reflect(-2, 5), 2);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(6, 5), 2);
        assert_eq!(reflect(3, 5), 3);
        assert_eq!(reflect(-7, 3), 1);
        assert_eq!(reflect(4, 1), 0);
    }

    #[test]
    fn blur_preserves_constant_plane() {
        let kernel = isotropic_gaussian_kernel(5, 1.2).unwrap();
        let plane = vec![0.4f32; 6 * 7];
        for v in blur_reflect(&plane, 6, 7, &kernel) {
            assert!((v - 0.4).abs() < 1e-5);
        }
    }

    #[test]
    fn blurring_an_impulse_reproduces_the_kernel() {
        let kernel = isotropic_gaussian_kernel(5, 1.0).unwrap();
        let (h, w) = (9, 9);
        let mut plane = vec![0.0f32; h * w];
        plane[4 * w + 4] = 1.0;
        let out = blur_reflect(&plane, h, w, &kernel);
        // Symmetric kernel: correlation and convolution agree.
        for ky in 0..5 {
            for kx in 0..5 {
                let v = out[(2 + ky) * w + (2 + kx)] as f64;
                assert!((v - kernel[[ky, kx]]).abs() < 1e-6, "({ky}, {kx})");
            }
        }
        assert!((out[4 * w + 4] as f64 - kernel[[2, 2]]).abs() < 1e-6);
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn blur_of_edge_impulse_uses_reflection() {
        let kernel = Array2::from_shape_vec((1, 3), vec![0.25, 0.5, 0.25]).unwrap();
        let plane = [1.0f32, 0.0, 0.0, 0.0];
        let out = blur_reflect(&plane, 1, 4, &kernel);
        // Left neighbour of x = 0 mirrors to x = 1.
        assert_eq!(out, vec![0.5, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn downsample_constant_and_ramp() {
        let out = downsample(vec![0.6f32; 8 * 8], 8, 8, 2).unwrap();
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|v| (v - 0.6).abs() < 1e-4));

        // Horizontal ramp keeps rising; every row is identical.
        let ramp: Vec<f32> = (0..8 * 8).map(|i| (i % 8) as f32 / 7.0).collect();
        let out = downsample(ramp, 8, 8, 2).unwrap();
        for row in out.chunks_exact(4) {
            assert!(row.windows(2).all(|p| p[0] <= p[1]));
            assert!(row[3] - row[0] > 0.5);
            assert_eq!(row, &out[..4]);
        }
        assert_eq!(downsample(vec![0.1, 0.2], 1, 2, 1).unwrap(), vec![0.1, 0.2]);
    }

    #[test]
    fn kernel_code_matches_encoding_of_drawn_kernel() {
        let (sampler, basis) = basis(7, 4);
        let mut pre = Preprocessor::new(2, &basis, sampler.clone(), DegradationOptions::default(), 11)
            .unwrap();
        let code: Vec<f32> = pre.degrade(&ramp(1, 8, 8)).unwrap().kernel_code.into_data().to_vec().unwrap();

        // Replay the same stream: with noise off the kernel is the first draw.
        let mut rng = StdRng::seed_from_u64(11);
        let kernel = sampler.sample(&mut rng).unwrap();
        let expected: Vec<f32> = basis.encode(&kernel).unwrap().iter().map(|&v| v as f32).collect();
        assert_eq!(code, expected);
    }

    #[test]
    fn degraded_image_is_blurred_then_downsampled() {
        let (_, basis) = basis(5, 3);
        // Wide kernels only, so the blur is never close to the identity.
        let sampler = KernelSampler::new(5, 1.5, 3.0, 1.0, 3.0).unwrap();
        let mut pre =
            Preprocessor::new(2, &basis, sampler.clone(), DegradationOptions::default(), 4).unwrap();
        let gt = ramp(1, 8, 8);
        let lq: Vec<f32> = pre.degrade(&gt).unwrap().lq.into_data().to_vec().unwrap();

        let plane: Vec<f32> = gt.into_data().to_vec().unwrap();
        let kernel = sampler.sample(&mut StdRng::seed_from_u64(4)).unwrap();
        let expected = downsample(blur_reflect(&plane, 8, 8, &kernel), 8, 8, 2).unwrap();
        for (a, b) in lq.iter().zip(&expected) {
            assert!((a - b.clamp(0.0, 1.0)).abs() < 1e-6);
        }
        // Without the blur the result differs.
        let plain = downsample(plane, 8, 8, 2).unwrap();
        assert!(lq.iter().zip(&plain).any(|(a, b)| (a - b).abs() > 1e-3));
    }

    #[test]
    fn noise_changes_the_low_resolution_image() {
        let (sampler, basis) = basis(5, 3);
        let gt = ramp(3, 8, 8);
        let clean_opts = DegradationOptions { noise: true, noise_high: 0.0, rate_cln: 0.0 };
        let noisy_opts = DegradationOptions { noise: true, noise_high: 0.1, rate_cln: 0.0 };

        let mut clean = Preprocessor::new(2, &basis, sampler.clone(), clean_opts, 5).unwrap();
        let mut noisy = Preprocessor::new(2, &basis, sampler, noisy_opts, 5).unwrap();
        let a: Vec<f32> = clean.degrade(&gt).unwrap().lq.into_data().to_vec().unwrap();
        let b: Vec<f32> = noisy.degrade(&gt).unwrap().lq.into_data().to_vec().unwrap();
        assert_eq!(a.len(), b.len());
        assert!(a.iter().zip(&b).any(|(x, y)| (x - y).abs() > 1e-4));
    }

    #[test]
    fn degrade_shapes_and_range() {
        let (sampler, basis) = basis(7, 4);
        let mut pre =
            Preprocessor::new(4, &basis, sampler, DegradationOptions::default(), 42).unwrap();
        let pair = pre.degrade(&ramp(3, 16, 24)).unwrap();
        assert_eq!(pair.lq.dims(), [1, 3, 4, 6]);
        assert_eq!(pair.kernel_code.dims(), [1, 4]);
        let values: Vec<f32> = pair.lq.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn degrade_rejects_size_not_divisible_by_scale() {
        let (sampler, basis) = basis(5, 3);
        let mut pre =
            Preprocessor::new(3, &basis, sampler, DegradationOptions::default(), 0).unwrap();
        assert!(pre.degrade(&ramp(1, 10, 9)).is_err());
    }

    #[test]
    fn same_seed_gives_same_degradation() {
        let (sampler, basis) = basis(5, 3);
        let gt = ramp(1, 8, 8);
        let run = |seed| {
            let mut pre = Preprocessor::new(
                2,
                &basis,
                sampler.clone(),
                DegradationOptions::default(),
                seed,
            )
            .unwrap();
            let a: Vec<f32> = pre.degrade(&gt).unwrap().kernel_code.into_data().to_vec().unwrap();
            let b: Vec<f32> = pre.degrade(&gt).unwrap().kernel_code.into_data().to_vec().unwrap();
            (a, b)
        };
        let (first, second) = run(9);
        assert_eq!(run(9), (first.clone(), second.clone()));
        // Fresh randomness on every call within a run.
        assert_ne!(first, second);
    }

    #[test]
    fn noise_appends_scaled_level_to_code() {
        let (sampler, basis) = basis(5, 3);
        let opts = DegradationOptions {
            noise: true,
            noise_high: 0.05,
            rate_cln: 0.0,
        };
        let mut pre = Preprocessor::new(2, &basis, sampler, opts, 3).unwrap();
        assert_eq!(pre.code_len(), 4);
        let code: Vec<f32> = pre.degrade(&ramp(3, 8, 8)).unwrap().kernel_code.into_data().to_vec().unwrap();
        assert_eq!(code.len(), 4);
        assert!((0.0..=0.5).contains(&code[3]));
    }

    #[test]
    fn fixed_sigma_code_is_repeated_per_batch_item() {
        let (sampler, basis) = basis(5, 3);
        let pre = Preprocessor::new(2, &basis, sampler, DegradationOptions::default(), 0).unwrap();
        let code = pre.kernel_code_for_sigma::<B>(1.5, 2, &Default::default()).unwrap();
        assert_eq!(code.dims(), [2, 3]);
        let v: Vec<f32> = code.into_data().to_vec().unwrap();
        assert_eq!(v[..3], v[3..]);
    }
}
