use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Compute backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Gpu,
}

/// One test dataset, keyed by its phase name in [`TestOptions::datasets`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetOptions {
    /// Human-readable dataset name, also the output sub-directory.
    pub name: String,
    /// Ground-truth image directory. Absent means "no metrics" mode.
    #[serde(rename = "dataroot_GT", default)]
    pub dataroot_gt: Option<PathBuf>,
    /// Low-resolution input directory, read only when there is no ground truth.
    #[serde(rename = "dataroot_LQ", default)]
    pub dataroot_lq: Option<PathBuf>,
    /// Isotropic blur sigma assumed for inputs read from `dataroot_LQ`.
    #[serde(default)]
    pub kernel_sigma: Option<f64>,
}

/// SFTMD network hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    pub in_nc: usize,
    pub out_nc: usize,
    /// Feature channels.
    pub nf: usize,
    /// Number of SFT residual blocks.
    pub nb: usize,
    /// Length of the kernel code the network was trained with.
    pub code_length: usize,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            in_nc: 3,
            out_nc: 3,
            nf: 64,
            nb: 16,
            code_length: 10,
        }
    }
}

/// Synthetic blur kernel population and PCA reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelOptions {
    /// Kernel side length (odd).
    pub size: usize,
    pub sig_min: f64,
    pub sig_max: f64,
    /// Probability of drawing an isotropic kernel.
    pub rate_iso: f64,
    /// Anisotropic kernels: upper bound of sigma_y / sigma_x.
    pub scaling: f64,
    /// Number of kernels sampled to fit the PCA basis.
    pub pca_samples: usize,
    /// Number of principal components kept.
    pub pca_dim: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            size: 21,
            sig_min: 0.2,
            sig_max: 4.0,
            rate_iso: 1.0,
            scaling: 3.0,
            pca_samples: 30_000,
            pca_dim: 10,
        }
    }
}

/// Additive noise applied after downsampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationOptions {
    pub noise: bool,
    /// Upper bound of the per-image noise level (on the [0, 1] scale).
    pub noise_high: f64,
    /// Probability that an image is left noise-free.
    pub rate_cln: f64,
}

impl Default for DegradationOptions {
    fn default() -> Self {
        Self {
            noise: false,
            noise_high: 0.0,
            rate_cln: 0.2,
        }
    }
}

/// Filesystem roots. Unset entries are filled in by [`TestOptions::resolve_paths`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathOptions {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub results_root: Option<PathBuf>,
    #[serde(default)]
    pub log: Option<PathBuf>,
    /// Trained network weights (burn named MessagePack record).
    #[serde(rename = "pretrain_model_G", default)]
    pub pretrain_model_g: Option<PathBuf>,
}

fn default_model() -> String {
    "sftmd".into()
}

/// Top-level evaluation options, parsed once and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOptions {
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub scale: usize,
    #[serde(default)]
    pub crop_border: Option<usize>,
    #[serde(default)]
    pub suffix: Option<String>,
    /// Seed of the degradation RNG. Drawn at startup when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub device: DeviceKind,
    /// Phase name -> dataset. Sorted, which fixes the evaluation order.
    pub datasets: BTreeMap<String, DatasetOptions>,
    #[serde(rename = "network_G", default)]
    pub network: NetworkOptions,
    #[serde(default)]
    pub kernel: KernelOptions,
    #[serde(default)]
    pub degradation: DegradationOptions,
    #[serde(default)]
    pub path: PathOptions,
}

impl TestOptions {
    /// Read, resolve and validate an options document.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read options file {}", path.display()))?;
        let mut opts = Self::from_json(&text)
            .with_context(|| format!("malformed options file {}", path.display()))?;
        opts.resolve_paths();
        opts.validate()?;
        Ok(opts)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Fill in default result and log directories.
    pub fn resolve_paths(&mut self) {
        let root = self
            .path
            .root
            .get_or_insert_with(|| PathBuf::from("."))
            .clone();
        let results = self
            .path
            .results_root
            .get_or_insert_with(|| root.join("results").join(&self.name))
            .clone();
        self.path.log.get_or_insert(results);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.name.is_empty(), "name must not be empty");
        ensure!(
            (1..=4).contains(&self.scale),
            "scale must be between 1 and 4, got {}",
            self.scale
        );

        let k = &self.kernel;
        ensure!(
            k.size >= 3 && k.size % 2 == 1,
            "kernel.size must be odd and at least 3, got {}",
            k.size
        );
        ensure!(
            k.sig_min > 0.0 && k.sig_min <= k.sig_max,
            "kernel sigma range must satisfy 0 < sig_min <= sig_max, got [{}, {}]",
            k.sig_min,
            k.sig_max
        );
        ensure!(
            (0.0..=1.0).contains(&k.rate_iso),
            "kernel.rate_iso must be in [0, 1], got {}",
            k.rate_iso
        );
        ensure!(k.scaling > 0.0, "kernel.scaling must be positive");
        ensure!(
            k.pca_dim >= 1 && k.pca_dim <= k.size * k.size,
            "kernel.pca_dim must be in 1..={}, got {}",
            k.size * k.size,
            k.pca_dim
        );
        ensure!(
            k.pca_samples >= k.pca_dim,
            "kernel.pca_samples ({}) must be at least pca_dim ({})",
            k.pca_samples,
            k.pca_dim
        );

        let d = &self.degradation;
        ensure!(
            (0.0..=1.0).contains(&d.rate_cln),
            "degradation.rate_cln must be in [0, 1], got {}",
            d.rate_cln
        );
        ensure!(d.noise_high >= 0.0, "degradation.noise_high must be >= 0");

        let expected_code = k.pca_dim + usize::from(d.noise);
        ensure!(
            self.network.code_length == expected_code,
            "network_G.code_length is {} but the degradation produces codes of length {}",
            self.network.code_length,
            expected_code
        );
        ensure!(
            self.network.in_nc >= 1 && self.network.out_nc >= 1,
            "network_G channel counts must be positive"
        );

        ensure!(!self.datasets.is_empty(), "no test datasets configured");
        for (phase, ds) in &self.datasets {
            ensure!(
                ds.dataroot_gt.is_some() || ds.dataroot_lq.is_some(),
                "dataset [{phase}] needs dataroot_GT or dataroot_LQ"
            );
            if let Some(sigma) = ds.kernel_sigma {
                ensure!(sigma > 0.0, "dataset [{phase}] kernel_sigma must be positive");
            }
        }
        Ok(())
    }

    /// Pixels stripped from each edge before computing metrics.
    pub fn effective_crop_border(&self) -> usize {
        match self.crop_border {
            Some(b) if b != 0 => b,
            _ => self.scale,
        }
    }

    pub fn suffix(&self) -> &str {
        self.suffix.as_deref().unwrap_or("")
    }

    pub fn results_root(&self) -> PathBuf {
        self.path
            .results_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("results").join(&self.name))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path.log.clone().unwrap_or_else(|| self.results_root())
    }

    /// Pretty JSON dump of the resolved options, logged at startup.
    pub fn to_pretty_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
