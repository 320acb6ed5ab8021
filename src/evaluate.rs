//! Evaluation driver: degrade, super-resolve, save and score every test image.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use burn::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::TestOptions;
use crate::dataset::TestDataset;
use crate::degrade::Preprocessor;
use crate::image_utils;
use crate::kernel::KernelSampler;
use crate::metrics::{self, Averages, TestResults};
use crate::model::{InferenceBatch, SftmdModel, SuperResolver};
use crate::pca::KernelBasis;

/// Outcome of evaluating one dataset.
#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub name: String,
    pub output_dir: PathBuf,
    /// Number of samples processed (and images written).
    pub processed: usize,
    pub results: TestResults,
    /// `None` when the dataset has no ground truth.
    pub averages: Option<Averages>,
}

/// Seed actually used by a run: the configured one, or a fresh random draw.
pub fn resolve_seed(opts: &TestOptions) -> u64 {
    opts.seed.unwrap_or_else(rand::random)
}

/// Build the kernel basis shared by every dataset of the run.
pub fn build_kernel_basis(opts: &TestOptions, seed: u64) -> Result<KernelBasis> {
    let sampler = KernelSampler::from_options(&opts.kernel)?;
    // Separate stream from the degradation RNG so the basis does not depend on dataset order.
    let mut rng = StdRng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15);
    KernelBasis::build(&sampler, opts.kernel.pca_samples, opts.kernel.pca_dim, &mut rng)
}

/// Evaluate every configured dataset, in sorted phase order.
pub fn run<B: Backend>(opts: &TestOptions, device: &B::Device) -> Result<Vec<DatasetReport>> {
    let seed = resolve_seed(opts);
    log::info!("Random seed: {seed}");

    let basis = build_kernel_basis(opts, seed)?;

    let mut datasets = Vec::with_capacity(opts.datasets.len());
    for (phase, ds_opts) in &opts.datasets {
        let dataset = TestDataset::<B>::open(ds_opts, opts.scale, device)
            .with_context(|| format!("cannot open dataset [{phase}]"))?;
        log::info!(
            "Number of test images in [{}]: {}",
            dataset.name(),
            dataset.len()
        );
        datasets.push(dataset);
    }

    let mut model = SftmdModel::<B>::load(opts, device)?;
    let mut prepro = Preprocessor::new(
        opts.scale,
        &basis,
        KernelSampler::from_options(&opts.kernel)?,
        opts.degradation.clone(),
        seed,
    )?;

    let mut reports = Vec::with_capacity(datasets.len());
    for dataset in &datasets {
        reports.push(evaluate_dataset(opts, dataset, &mut prepro, &mut model)?);
    }
    Ok(reports)
}

/// Run one dataset through degradation, inference, saving and scoring.
///
/// Samples are processed one at a time in dataset order. The metric lists
/// are created here and handed back in the report.
pub fn evaluate_dataset<B: Backend, M: SuperResolver<B>>(
    opts: &TestOptions,
    dataset: &TestDataset<B>,
    prepro: &mut Preprocessor<'_>,
    model: &mut M,
) -> Result<DatasetReport> {
    let name = dataset.name().to_string();
    log::info!("");
    log::info!("Testing [{name}]...");
    if let Some(root) = dataset.root() {
        log::debug!("reading [{name}] from {}", root.display());
    }
    let started = Instant::now();

    let output_dir = opts.results_root().join(&name);
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let need_gt = dataset.need_gt();
    let crop = opts.effective_crop_border();
    let mut results = TestResults::default();
    let mut processed = 0;

    for sample in dataset.iter() {
        let sample = sample?;
        let img_name = sample.name();

        let batch = match (&sample.gt, &sample.lq) {
            (Some(gt), _) => {
                let pair = prepro.degrade(gt)?;
                InferenceBatch {
                    lq: pair.lq,
                    kernel_code: pair.kernel_code,
                    gt: Some(gt.clone()),
                }
            }
            (None, Some(lq)) => {
                let [n, _, _, _] = lq.dims();
                let sigma = dataset.kernel_sigma(&opts.kernel);
                InferenceBatch {
                    lq: lq.clone(),
                    kernel_code: prepro.kernel_code_for_sigma(sigma, n, &lq.device())?,
                    gt: None,
                }
            }
            (None, None) => anyhow::bail!("sample [{img_name}] has no image data"),
        };

        model.feed_data(batch);
        model.test()?;
        let visuals = model.current_visuals()?;

        let sr_img = image_utils::tensor_to_image(&visuals.sr)?;
        let save_path = image_utils::output_image_path(&output_dir, &img_name, opts.suffix());
        image_utils::save_image(&sr_img, &save_path)?;
        processed += 1;

        match visuals.gt.filter(|_| need_gt) {
            Some(gt) => {
                let gt_arr = image_utils::image_to_array(&image_utils::tensor_to_image(&gt)?);
                let sr_arr = image_utils::image_to_array(&sr_img);
                let m = metrics::evaluate_pair(&sr_arr, &gt_arr, crop)
                    .with_context(|| format!("cannot score [{img_name}]"))?;
                results.record(&m);
                match m.luma {
                    Some((psnr_y, ssim_y)) => log::info!(
                        "{:20} - PSNR: {:.6} dB; SSIM: {:.6}; PSNR_Y: {:.6} dB; SSIM_Y: {:.6}.",
                        img_name,
                        m.psnr,
                        m.ssim,
                        psnr_y,
                        ssim_y
                    ),
                    None => log::info!(
                        "{:20} - PSNR: {:.6} dB; SSIM: {:.6}.",
                        img_name,
                        m.psnr,
                        m.ssim
                    ),
                }
            }
            None => log::info!("{img_name}"),
        }
    }

    let averages = results.averages();
    if let Some(avg) = &averages {
        log::info!(
            "----Average PSNR/SSIM results for {}----\n\tPSNR: {:.6} dB; SSIM: {:.6}\n",
            name,
            avg.psnr,
            avg.ssim
        );
        if let Some((psnr_y, ssim_y)) = avg.luma {
            log::info!(
                "----Y channel, average PSNR/SSIM----\n\tPSNR_Y: {:.6} dB; SSIM_Y: {:.6}\n",
                psnr_y,
                ssim_y
            );
        }
    }
    log::info!(
        "[{name}] {processed} images in {:.1}s",
        started.elapsed().as_secs_f64()
    );

    Ok(DatasetReport {
        name,
        output_dir,
        processed,
        results,
        averages,
    })
}
