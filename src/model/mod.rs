//! Super-resolution models and the inference adapter used by the evaluator.
//!
//! Provides the `SuperResolver` trait and the SFTMD implementation.

pub mod sft;
pub mod sftmd;

use std::path::Path;

use anyhow::{ensure, Result};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use crate::config::TestOptions;

use self::sftmd::{Sftmd, SftmdConfig};

/// Inputs for one inference step.
pub struct InferenceBatch<B: Backend> {
    /// `[N, C, h, w]` in `[0, 1]`.
    pub lq: Tensor<B, 4>,
    /// `[N, code_len]`.
    pub kernel_code: Tensor<B, 2>,
    /// Ground truth, echoed back in [`Visuals`] when present.
    pub gt: Option<Tensor<B, 4>>,
}

/// Output of the last inference step.
pub struct Visuals<B: Backend> {
    pub sr: Tensor<B, 4>,
    pub gt: Option<Tensor<B, 4>>,
}

/// Per sample: `feed_data`, then `test`, then `current_visuals`.
pub trait SuperResolver<B: Backend> {
    fn feed_data(&mut self, batch: InferenceBatch<B>);
    fn test(&mut self) -> Result<()>;
    fn current_visuals(&self) -> Result<Visuals<B>>;
}

/// Trained SFTMD network wrapped for evaluation.
pub struct SftmdModel<B: Backend> {
    net: Sftmd<B>,
    config: SftmdConfig,
    batch: Option<InferenceBatch<B>>,
    sr: Option<Tensor<B, 4>>,
}

impl<B: Backend> SftmdModel<B> {
    pub fn new(config: SftmdConfig, device: &B::Device) -> Self {
        Self {
            net: config.init(device),
            config,
            batch: None,
            sr: None,
        }
    }

    /// Build the network described by `opts` and load its trained weights.
    pub fn load(opts: &TestOptions, device: &B::Device) -> Result<Self> {
        ensure!(
            opts.model.eq_ignore_ascii_case("sftmd"),
            "unsupported model [{}]",
            opts.model
        );
        let net = &opts.network;
        let config = SftmdConfig::new()
            .with_in_nc(net.in_nc)
            .with_out_nc(net.out_nc)
            .with_nf(net.nf)
            .with_nb(net.nb)
            .with_scale(opts.scale)
            .with_code_length(net.code_length);

        let mut model = Self::new(config, device);
        match &opts.path.pretrain_model_g {
            Some(path) => model.load_weights(path, device)?,
            None => log::warn!("no pretrain_model_G configured, evaluating an untrained network"),
        }
        log::info!(
            "Model [{}] created: nf={} nb={} scale={} code_length={}",
            opts.model,
            model.config.nf,
            model.config.nb,
            model.config.scale,
            model.config.code_length
        );
        Ok(model)
    }

    pub fn load_weights(&mut self, path: &Path, device: &B::Device) -> Result<()> {
        log::info!("Loading model from [{}] ...", path.display());
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.net = self
            .net
            .clone()
            .load_file(path.to_path_buf(), &recorder, device)
            .map_err(|e| anyhow::anyhow!("failed to load weights {}: {e:?}", path.display()))?;
        Ok(())
    }

    pub fn config(&self) -> &SftmdConfig {
        &self.config
    }
}

impl<B: Backend> SuperResolver<B> for SftmdModel<B> {
    fn feed_data(&mut self, batch: InferenceBatch<B>) {
        self.batch = Some(batch);
        self.sr = None;
    }

    fn test(&mut self) -> Result<()> {
        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("test() called before feed_data()"))?;
        let [n, c, _, _] = batch.lq.dims();
        let [code_n, code_len] = batch.kernel_code.dims();
        ensure!(
            c == self.config.in_nc,
            "input has {c} channels, network expects {}",
            self.config.in_nc
        );
        ensure!(
            code_len == self.config.code_length,
            "kernel code has length {code_len}, network expects {}",
            self.config.code_length
        );
        ensure!(
            code_n == n,
            "batch of {n} images but {code_n} kernel codes"
        );

        self.sr = Some(self.net.forward(batch.lq.clone(), batch.kernel_code.clone()));
        Ok(())
    }

    fn current_visuals(&self) -> Result<Visuals<B>> {
        let sr = self
            .sr
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no inference result, call test() first"))?;
        let gt = self.batch.as_ref().and_then(|b| b.gt.clone());
        Ok(Visuals { sr, gt })
    }
}
