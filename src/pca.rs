//! PCA basis over a population of flattened blur kernels.
//!
//! The basis is the `k` leading eigenvectors of the sample covariance,
//! stored column-wise as a `(size², k)` matrix. A kernel's code is its
//! flattened pixels multiplied by that matrix.

use anyhow::{ensure, Result};
use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;

use crate::kernel::KernelSampler;

/// Fixed projection from kernel space to kernel-code space.
#[derive(Debug, Clone)]
pub struct KernelBasis {
    /// `(size², k)`, orthonormal columns.
    matrix: Array2<f64>,
    /// Share of the total sample variance captured by the kept components.
    explained: f64,
}

impl KernelBasis {
    /// Fit a rank-`k` basis to `samples` (one flattened kernel per row).
    pub fn fit(samples: &Array2<f64>, k: usize) -> Result<Self> {
        let (n, d) = samples.dim();
        ensure!(k >= 1, "PCA dimension must be at least 1");
        ensure!(k <= d, "PCA dimension {k} exceeds kernel dimension {d}");
        ensure!(n >= k, "need at least {k} samples for PCA, got {n}");

        let Some(mean) = samples.mean_axis(Axis(0)) else {
            anyhow::bail!("cannot fit PCA on an empty sample set");
        };
        let centered = samples - &mean;
        let x = DMatrix::from_row_iterator(n, d, centered.iter().copied());
        let scatter = x.tr_mul(&x);

        let eig = SymmetricEigen::new(scatter);
        let mut order: Vec<usize> = (0..d).collect();
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

        let total: f64 = eig.eigenvalues.iter().map(|v| v.max(0.0)).sum();
        let kept: f64 = order[..k].iter().map(|&i| eig.eigenvalues[i].max(0.0)).sum();

        let mut matrix = Array2::zeros((d, k));
        for (j, &idx) in order[..k].iter().enumerate() {
            let col = eig.eigenvectors.column(idx);
            // Eigenvectors are sign-ambiguous; make the dominant entry positive.
            let pivot = col
                .iter()
                .copied()
                .max_by(|a, b| a.abs().total_cmp(&b.abs()))
                .unwrap_or(0.0);
            let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
            for (i, v) in col.iter().enumerate() {
                matrix[[i, j]] = sign * v;
            }
        }

        Ok(Self {
            matrix,
            explained: if total > 0.0 { kept / total } else { 1.0 },
        })
    }

    /// Sample `count` kernels from `sampler` and fit a rank-`k` basis.
    pub fn build<R: Rng + ?Sized>(
        sampler: &KernelSampler,
        count: usize,
        k: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let pb = ProgressBar::new(count as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} Kernels [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );

        let batch = sampler.sample_batch(count, rng, Some(&pb))?;
        pb.finish_and_clear();
        log::info!("batch kernel shape: ({}, {})", count, sampler.kernel_len());

        let basis = Self::fit(&batch, k)?;
        log::info!(
            "PCA matrix shape: ({}, {}), explained variance {:.4}",
            basis.kernel_len(),
            basis.dim(),
            basis.explained
        );
        Ok(basis)
    }

    /// Code length `k`.
    pub fn dim(&self) -> usize {
        self.matrix.ncols()
    }

    /// Flattened kernel length `size²`.
    pub fn kernel_len(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn explained_variance(&self) -> f64 {
        self.explained
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Project a kernel onto the basis.
    pub fn encode(&self, kernel: &Array2<f64>) -> Result<Array1<f64>> {
        ensure!(
            kernel.len() == self.kernel_len(),
            "kernel has {} pixels, basis expects {}",
            kernel.len(),
            self.kernel_len()
        );
        let flat = Array1::from_iter(kernel.iter().copied());
        Ok(flat.dot(&self.matrix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::isotropic_gaussian_kernel;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sampler() -> KernelSampler {
        KernelSampler::new(7, 0.2, 4.0, 0.5, 3.0).unwrap()
    }

    #[test]
    fn basis_has_orthonormal_columns() {
        let mut rng = StdRng::seed_from_u64(11);
        let basis = KernelBasis::build(&sampler(), 500, 5, &mut rng).unwrap();
        assert_eq!(basis.matrix().dim(), (49, 5));
        let gram = basis.matrix().t().dot(basis.matrix());
        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-8, "gram[{i},{j}] = {}", gram[[i, j]]);
            }
        }
    }

    #[test]
    fn leading_components_capture_most_variance() {
        let mut rng = StdRng::seed_from_u64(3);
        let basis = KernelBasis::build(&sampler(), 400, 10, &mut rng).unwrap();
        assert!(basis.explained_variance() > 0.8);
        assert!(basis.explained_variance() <= 1.0 + 1e-12);
    }

    #[test]
    fn fit_is_deterministic_for_same_samples() {
        let samples = sampler().sample_batch(200, &mut StdRng::seed_from_u64(5), None).unwrap();
        let a = KernelBasis::fit(&samples, 4).unwrap();
        let b = KernelBasis::fit(&samples, 4).unwrap();
        assert_eq!(a.matrix(), b.matrix());
    }

    #[test]
    fn encode_produces_k_values() {
        let samples = sampler().sample_batch(100, &mut StdRng::seed_from_u64(9), None).unwrap();
        let basis = KernelBasis::fit(&samples, 3).unwrap();
        let code = basis.encode(&isotropic_gaussian_kernel(7, 1.0).unwrap()).unwrap();
        assert_eq!(code.len(), 3);
        assert!(basis.encode(&isotropic_gaussian_kernel(5, 1.0).unwrap()).is_err());
    }

    #[test]
    fn rejects_invalid_dimensions() {
        let samples = sampler().sample_batch(20, &mut StdRng::seed_from_u64(1), None).unwrap();
        assert!(KernelBasis::fit(&samples, 0).is_err());
        assert!(KernelBasis::fit(&samples, 50).is_err());
        assert!(KernelBasis::fit(&samples.slice(ndarray::s![..2, ..]).to_owned(), 3).is_err());
    }
}
