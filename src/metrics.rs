//! Quality metrics for comparing reconstructed and ground-truth images.
//!
//! All functions take `(H, W, C)` arrays with values in `0..=255`.

use anyhow::{ensure, Result};
use ndarray::{s, Array2, Array3, ArrayView2, Axis};

use crate::image_utils;

const SSIM_WINDOW: usize = 11;
const SSIM_SIGMA: f64 = 1.5;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

/// Strip `border` pixels from every edge. `border == 0` is a no-op.
pub fn crop_border(img: &Array3<f64>, border: usize) -> Result<Array3<f64>> {
    if border == 0 {
        return Ok(img.clone());
    }
    let (h, w, _) = img.dim();
    ensure!(
        2 * border < h && 2 * border < w,
        "crop border {border} leaves nothing of a {w}x{h} image"
    );
    Ok(img.slice(s![border..h - border, border..w - border, ..]).to_owned())
}

/// Peak Signal-to-Noise Ratio in dB. `+inf` for identical images.
pub fn psnr(a: &Array3<f64>, b: &Array3<f64>) -> Result<f64> {
    ensure!(
        a.dim() == b.dim(),
        "shape mismatch: {:?} vs {:?}",
        a.dim(),
        b.dim()
    );
    let mse = (a - b).mapv(|d| d * d).mean().unwrap_or(0.0);
    if mse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(20.0 * (255.0 / mse.sqrt()).log10())
}

/// Normalized 2D Gaussian window.
fn gaussian_window() -> Array2<f64> {
    let half = (SSIM_WINDOW / 2) as f64;
    let g: Vec<f64> = (0..SSIM_WINDOW)
        .map(|i| {
            let x = i as f64 - half;
            (-(x * x) / (2.0 * SSIM_SIGMA * SSIM_SIGMA)).exp()
        })
        .collect();
    let sum: f64 = g.iter().sum();
    Array2::from_shape_fn((SSIM_WINDOW, SSIM_WINDOW), |(i, j)| g[i] * g[j] / (sum * sum))
}

/// Windowed mean over the valid region (no padding).
fn filter_valid(img: &Array2<f64>, window: &Array2<f64>) -> Array2<f64> {
    let (h, w) = img.dim();
    let (oh, ow) = (h + 1 - SSIM_WINDOW, w + 1 - SSIM_WINDOW);
    Array2::from_shape_fn((oh, ow), |(y, x)| {
        (&img.slice(s![y..y + SSIM_WINDOW, x..x + SSIM_WINDOW]) * window).sum()
    })
}

/// Single-channel SSIM.
fn ssim_channel(a: ArrayView2<f64>, b: ArrayView2<f64>, window: &Array2<f64>) -> f64 {
    let (a, b) = (a.to_owned(), b.to_owned());
    let mu1 = filter_valid(&a, window);
    let mu2 = filter_valid(&b, window);
    let mu1_sq = &mu1 * &mu1;
    let mu2_sq = &mu2 * &mu2;
    let mu1_mu2 = &mu1 * &mu2;
    let sigma1_sq = filter_valid(&(&a * &a), window) - &mu1_sq;
    let sigma2_sq = filter_valid(&(&b * &b), window) - &mu2_sq;
    let sigma12 = filter_valid(&(&a * &b), window) - &mu1_mu2;

    let num = (&mu1_mu2 * 2.0 + C1) * (&sigma12 * 2.0 + C2);
    let den = (&mu1_sq + &mu2_sq + C1) * (&sigma1_sq + &sigma2_sq + C2);
    (num / den).mean().unwrap_or(1.0)
}

/// Structural similarity with an 11×11 Gaussian window (σ = 1.5), averaged over channels.
pub fn ssim(a: &Array3<f64>, b: &Array3<f64>) -> Result<f64> {
    ensure!(
        a.dim() == b.dim(),
        "shape mismatch: {:?} vs {:?}",
        a.dim(),
        b.dim()
    );
    let (h, w, c) = a.dim();
    ensure!(
        h >= SSIM_WINDOW && w >= SSIM_WINDOW,
        "SSIM needs at least {SSIM_WINDOW}x{SSIM_WINDOW} pixels, got {w}x{h}"
    );
    ensure!(c >= 1, "image has no channels");

    let window = gaussian_window();
    let total: f64 = (0..c)
        .map(|ch| ssim_channel(a.index_axis(Axis(2), ch), b.index_axis(Axis(2), ch), &window))
        .sum();
    Ok(total / c as f64)
}

/// Metrics of one reconstructed image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleMetrics {
    pub psnr: f64,
    pub ssim: f64,
    /// Luma-channel metrics, only for 3-channel images.
    pub luma: Option<(f64, f64)>,
}

/// Crop both images by `border` and compute PSNR/SSIM, plus luma metrics for RGB.
pub fn evaluate_pair(sr: &Array3<f64>, gt: &Array3<f64>, border: usize) -> Result<SampleMetrics> {
    let cropped_sr = crop_border(sr, border)?;
    let cropped_gt = crop_border(gt, border)?;
    let psnr_v = psnr(&cropped_sr, &cropped_gt)?;
    let ssim_v = ssim(&cropped_sr, &cropped_gt)?;

    let luma = if gt.dim().2 == 3 {
        let sr_y = crop_border(&image_utils::rgb_to_y(sr)?, border)?;
        let gt_y = crop_border(&image_utils::rgb_to_y(gt)?, border)?;
        Some((psnr(&sr_y, &gt_y)?, ssim(&sr_y, &gt_y)?))
    } else {
        None
    };

    Ok(SampleMetrics {
        psnr: psnr_v,
        ssim: ssim_v,
        luma,
    })
}

/// Dataset-wide arithmetic means.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Averages {
    pub psnr: f64,
    pub ssim: f64,
    /// Present when at least one sample had luma metrics.
    pub luma: Option<(f64, f64)>,
}

/// Per-dataset metric lists, one entry per sample with ground truth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestResults {
    pub psnr: Vec<f64>,
    pub ssim: Vec<f64>,
    pub psnr_y: Vec<f64>,
    pub ssim_y: Vec<f64>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

impl TestResults {
    pub fn record(&mut self, m: &SampleMetrics) {
        self.psnr.push(m.psnr);
        self.ssim.push(m.ssim);
        if let Some((psnr_y, ssim_y)) = m.luma {
            self.psnr_y.push(psnr_y);
            self.ssim_y.push(ssim_y);
        }
    }

    /// Number of samples recorded.
    pub fn len(&self) -> usize {
        self.psnr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.psnr.is_empty()
    }

    /// `None` when nothing was recorded.
    pub fn averages(&self) -> Option<Averages> {
        let psnr = mean(&self.psnr)?;
        let ssim = mean(&self.ssim)?;
        let luma = mean(&self.psnr_y).zip(mean(&self.ssim_y));
        Some(Averages { psnr, ssim, luma })
    }
}
