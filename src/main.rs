use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::backend::NdArray;
use clap::Parser;

use sftmd::config::{DeviceKind, TestOptions};
use sftmd::{evaluate, logging};

/// Evaluate a trained SFTMD super-resolution network.
///
/// Ground-truth images are blurred with random Gaussian kernels, downsampled
/// and fed to the network together with the PCA code of the kernel. The
/// reconstructions are written under the results directory and scored with
/// PSNR/SSIM on RGB and on the Y channel.
#[derive(Parser)]
#[command(name = "sftmd", version, about, long_about = None)]
struct Cli {
    /// Path to the JSON options file.
    #[arg(short = 'o', long = "opt")]
    opt: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = TestOptions::load(&cli.opt)?;

    let results_root = opts.results_root();
    fs::create_dir_all(&results_root)
        .with_context(|| format!("failed to create {}", results_root.display()))?;
    let log_file = logging::setup_logger(&opts.log_dir(), &opts.name)?;
    log::info!("Logging to {}", log_file.display());
    log::info!("{}", opts.to_pretty_string()?);

    let reports = match opts.device {
        DeviceKind::Cpu => evaluate::run::<NdArray>(&opts, &Default::default())?,
        DeviceKind::Gpu => {
            log::info!("Using GPU (WGPU)");
            evaluate::run::<Wgpu>(&opts, &WgpuDevice::default())?
        }
    };

    let images: usize = reports.iter().map(|r| r.processed).sum();
    log::info!(
        "Done: {} dataset(s), {images} image(s) written under {}",
        reports.len(),
        results_root.display()
    );
    Ok(())
}
