//! Paired ground-truth / low-resolution test sets read from directories.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Result};
use burn::prelude::*;

use crate::config::{DatasetOptions, KernelOptions};
use crate::image_utils;

/// One sample pulled from a [`TestDataset`].
pub struct TestSample<B: Backend> {
    /// Ground truth `[1, C, H, W]`, mod-cropped to the scale factor.
    pub gt: Option<Tensor<B, 4>>,
    pub gt_path: Option<PathBuf>,
    /// Low-resolution input, only loaded when there is no ground truth.
    pub lq: Option<Tensor<B, 4>>,
    pub lq_path: Option<PathBuf>,
}

impl<B: Backend> TestSample<B> {
    /// Identity of the sample: stem of the GT path if present, else of the LQ path.
    pub fn name(&self) -> String {
        self.gt_path
            .as_deref()
            .or(self.lq_path.as_deref())
            .map(image_utils::sample_name)
            .unwrap_or_default()
    }
}

/// A directory-backed test set, iterated in sorted path order.
pub struct TestDataset<B: Backend> {
    opts: DatasetOptions,
    scale: usize,
    gt_paths: Option<Vec<PathBuf>>,
    lq_paths: Option<Vec<PathBuf>>,
    device: B::Device,
}

impl<B: Backend> TestDataset<B> {
    pub fn open(opts: &DatasetOptions, scale: usize, device: &B::Device) -> Result<Self> {
        let gt_paths = opts
            .dataroot_gt
            .as_deref()
            .map(image_utils::collect_images)
            .transpose()?;
        let lq_paths = opts
            .dataroot_lq
            .as_deref()
            .map(image_utils::collect_images)
            .transpose()?;

        ensure!(
            gt_paths.is_some() || lq_paths.is_some(),
            "dataset [{}] has neither dataroot_GT nor dataroot_LQ",
            opts.name
        );
        if let (Some(gt), Some(lq)) = (&gt_paths, &lq_paths) {
            ensure!(
                gt.len() == lq.len(),
                "dataset [{}]: {} ground-truth images but {} low-resolution images",
                opts.name,
                gt.len(),
                lq.len()
            );
        }

        Ok(Self {
            opts: opts.clone(),
            scale,
            gt_paths,
            lq_paths,
            device: device.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    /// Whether ground truth exists, which enables synthetic degradation and metrics.
    pub fn need_gt(&self) -> bool {
        self.gt_paths.is_some()
    }

    pub fn len(&self) -> usize {
        self.gt_paths
            .as_ref()
            .or(self.lq_paths.as_ref())
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blur sigma assumed for low-resolution inputs without ground truth.
    pub fn kernel_sigma(&self, kernel: &KernelOptions) -> f64 {
        self.opts
            .kernel_sigma
            .unwrap_or((kernel.sig_min + kernel.sig_max) / 2.0)
    }

    /// Load sample `index`.
    pub fn get(&self, index: usize) -> Result<TestSample<B>> {
        ensure!(
            index < self.len(),
            "sample {index} out of range for dataset [{}] of {}",
            self.name(),
            self.len()
        );
        let gt_path = self.gt_paths.as_ref().map(|p| p[index].clone());
        let lq_path = self.lq_paths.as_ref().map(|p| p[index].clone());

        let gt = match &gt_path {
            Some(path) => Some(image_utils::modcrop(
                image_utils::load_image_tensor::<B>(path, &self.device)?,
                self.scale,
            )?),
            None => None,
        };
        let lq = match (&gt, &lq_path) {
            (None, Some(path)) => Some(image_utils::load_image_tensor::<B>(path, &self.device)?),
            _ => None,
        };

        Ok(TestSample {
            gt,
            gt_path,
            lq,
            lq_path,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<TestSample<B>>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    pub fn root(&self) -> Option<&Path> {
        self.opts
            .dataroot_gt
            .as_deref()
            .or(self.opts.dataroot_lq.as_deref())
    }
}
