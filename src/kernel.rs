//! Synthetic Gaussian blur kernels.
//!
//! Kernels live on the integer grid `-(l/2)..=l/2` in both axes and are
//! normalized to unit sum. Isotropic kernels have a single sigma; anisotropic
//! ones use a rotated covariance
//!
//!   Σ = U(θ) · diag(σx², σy²) · U(θ)ᵀ
//!
//! and evaluate `exp(-½ pᵀ Σ⁻¹ p)` at every grid point `p`.

use anyhow::{ensure, Result};
use indicatif::ProgressBar;
use ndarray::{Array2, Axis};
use rand::Rng;

use crate::config::KernelOptions;

fn check_size(size: usize) -> Result<()> {
    ensure!(
        size >= 1 && size % 2 == 1,
        "kernel size must be odd and positive, got {size}"
    );
    Ok(())
}

fn normalize(mut kernel: Array2<f64>) -> Array2<f64> {
    let sum = kernel.sum();
    kernel.mapv_inplace(|v| v / sum);
    kernel
}

/// Isotropic Gaussian kernel of side `size`.
pub fn isotropic_gaussian_kernel(size: usize, sigma: f64) -> Result<Array2<f64>> {
    check_size(size)?;
    ensure!(sigma > 0.0, "kernel sigma must be positive, got {sigma}");

    let half = (size / 2) as f64;
    let kernel = Array2::from_shape_fn((size, size), |(row, col)| {
        let y = row as f64 - half;
        let x = col as f64 - half;
        (-(x * x + y * y) / (2.0 * sigma * sigma)).exp()
    });
    Ok(normalize(kernel))
}

/// Covariance of a Gaussian with axis sigmas `(sig_x, sig_y)` rotated by `theta`.
///
/// Returned as `[[a, b], [b, c]]`.
pub fn covariance(sig_x: f64, sig_y: f64, theta: f64) -> [[f64; 2]; 2] {
    let (s, c) = theta.sin_cos();
    let (dx, dy) = (sig_x * sig_x, sig_y * sig_y);
    [
        [c * c * dx + s * s * dy, c * s * (dx - dy)],
        [c * s * (dx - dy), s * s * dx + c * c * dy],
    ]
}

/// Anisotropic Gaussian kernel of side `size` for covariance `cov`.
pub fn anisotropic_gaussian_kernel(size: usize, cov: [[f64; 2]; 2]) -> Result<Array2<f64>> {
    check_size(size)?;
    let det = cov[0][0] * cov[1][1] - cov[0][1] * cov[1][0];
    ensure!(det > 0.0, "kernel covariance must be positive definite");

    let inv = [
        [cov[1][1] / det, -cov[0][1] / det],
        [-cov[1][0] / det, cov[0][0] / det],
    ];
    let half = (size / 2) as f64;
    let kernel = Array2::from_shape_fn((size, size), |(row, col)| {
        let y = row as f64 - half;
        let x = col as f64 - half;
        let q = x * (inv[0][0] * x + inv[0][1] * y) + y * (inv[1][0] * x + inv[1][1] * y);
        (-0.5 * q).exp()
    });
    Ok(normalize(kernel))
}

/// Random draw from the isotropic / anisotropic kernel population.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSampler {
    pub size: usize,
    pub sig_min: f64,
    pub sig_max: f64,
    pub rate_iso: f64,
    pub scaling: f64,
}

impl KernelSampler {
    pub fn new(size: usize, sig_min: f64, sig_max: f64, rate_iso: f64, scaling: f64) -> Result<Self> {
        check_size(size)?;
        ensure!(
            sig_min > 0.0 && sig_min <= sig_max,
            "invalid sigma range [{sig_min}, {sig_max}]"
        );
        ensure!(
            (0.0..=1.0).contains(&rate_iso),
            "rate_iso must be in [0, 1], got {rate_iso}"
        );
        Ok(Self {
            size,
            sig_min,
            sig_max,
            rate_iso,
            scaling,
        })
    }

    pub fn from_options(opts: &KernelOptions) -> Result<Self> {
        Self::new(opts.size, opts.sig_min, opts.sig_max, opts.rate_iso, opts.scaling)
    }

    /// Number of pixels in one kernel.
    pub fn kernel_len(&self) -> usize {
        self.size * self.size
    }

    /// Draw one kernel.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Array2<f64>> {
        if rng.gen::<f64>() < self.rate_iso {
            let sigma = self.sig_min + rng.gen::<f64>() * (self.sig_max - self.sig_min);
            isotropic_gaussian_kernel(self.size, sigma)
        } else {
            let theta = rng.gen::<f64>() * 2.0 * std::f64::consts::PI - std::f64::consts::PI;
            let sig_x = self.sig_min + rng.gen::<f64>() * (self.sig_max - self.sig_min);
            let sig_y = (rng.gen::<f64>() * self.scaling * sig_x).clamp(self.sig_min, self.sig_max);
            anisotropic_gaussian_kernel(self.size, covariance(sig_x, sig_y, theta))
        }
    }

    /// Draw `count` kernels, one flattened kernel per row: `(count, size²)`.
    ///
    /// `progress` is advanced once per kernel.
    pub fn sample_batch<R: Rng + ?Sized>(
        &self,
        count: usize,
        rng: &mut R,
        progress: Option<&ProgressBar>,
    ) -> Result<Array2<f64>> {
        let mut batch = Array2::zeros((count, self.kernel_len()));
        for mut row in batch.axis_iter_mut(Axis(0)) {
            let kernel = self.sample(rng)?;
            row.assign(&kernel.into_shape_with_order(self.kernel_len())?);
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn isotropic_is_normalized_and_centered() {
        let k = isotropic_gaussian_kernel(21, 2.0).unwrap();
        assert!((k.sum() - 1.0).abs() < 1e-12);
        let peak = k[[10, 10]];
        assert!(k.iter().all(|&v| v <= peak));
        assert!((k[[10, 3]] - k[[3, 10]]).abs() < 1e-15);
        assert!((k[[0, 0]] - k[[20, 20]]).abs() < 1e-15);
    }

    #[test]
    fn anisotropic_matches_isotropic_for_equal_sigmas() {
        let iso = isotropic_gaussian_kernel(7, 1.3).unwrap();
        let aniso = anisotropic_gaussian_kernel(7, covariance(1.3, 1.3, 0.7)).unwrap();
        for (a, b) in iso.iter().zip(aniso.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn anisotropic_is_elongated_along_major_axis() {
        let k = anisotropic_gaussian_kernel(15, covariance(3.0, 0.5, 0.0)).unwrap();
        // theta = 0: sig_x is along columns.
        assert!(k[[7, 10]] > k[[10, 7]]);
        assert!((k.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_even_size_and_bad_sigma() {
        assert!(isotropic_gaussian_kernel(4, 1.0).is_err());
        assert!(isotropic_gaussian_kernel(5, 0.0).is_err());
        assert!(KernelSampler::new(5, 2.0, 1.0, 1.0, 3.0).is_err());
    }

    #[test]
    fn sample_batch_rows_sum_to_one() {
        let sampler = KernelSampler::new(9, 0.2, 4.0, 0.5, 3.0).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let batch = sampler.sample_batch(32, &mut rng, None).unwrap();
        assert_eq!(batch.dim(), (32, 81));
        for row in batch.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn sample_batch_advances_progress_per_kernel() {
        let sampler = KernelSampler::new(5, 0.2, 4.0, 1.0, 3.0).unwrap();
        let pb = ProgressBar::hidden();
        let batch = sampler
            .sample_batch(12, &mut StdRng::seed_from_u64(3), Some(&pb))
            .unwrap();
        assert_eq!(batch.nrows(), 12);
        assert_eq!(pb.position(), 12);
        assert_eq!(sampler.kernel_len(), 25);
    }

    #[test]
    fn same_seed_same_kernels() {
        let sampler = KernelSampler::new(5, 0.2, 4.0, 0.5, 3.0).unwrap();
        let a = sampler.sample_batch(4, &mut StdRng::seed_from_u64(7), None).unwrap();
        let b = sampler.sample_batch(4, &mut StdRng::seed_from_u64(7), None).unwrap();
        assert_eq!(a, b);
    }
}
