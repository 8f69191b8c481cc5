//! CLI smoke tool for the volumetric VAE decoder
//!
//! Builds a decoder with random or zero weights, decodes a random latent and
//! reports the output shape, value statistics and timing.
//!
//! Usage:
//!     cargo run --release --features cli --bin decode_latent -- --size 4
//!     cargo run --release --features cli --bin decode_latent -- --config decoder.json --zero-weights
//!     cargo run --release --features cli --bin decode_latent -- --size 2 --output voxels.npy

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use voxel_vae::{device_info, parse_device, sync_device, DecoderConfig, VaeDecoder, VolumeShape};

/// Decode a random latent volume
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Decoder config JSON (defaults to the reference decoder)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Latent edge length (d = h = w)
    #[arg(short, long, default_value_t = 4)]
    size: usize,

    /// Batch size
    #[arg(short, long, default_value_t = 1)]
    batch: usize,

    /// Initialize every parameter to zero instead of randomly
    #[arg(long)]
    zero_weights: bool,

    /// Number of timed decodes
    #[arg(long, default_value_t = 1)]
    iterations: usize,

    /// Write the last decoded volume as .npy
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Device for inference (auto, cpu, cuda, cuda:N, metal)
    #[arg(long, default_value = "auto")]
    device: String,
}

fn validate_args(args: &Args) -> Result<()> {
    if args.size == 0 || args.batch == 0 {
        anyhow::bail!("--size and --batch must be positive");
    }
    if args.iterations == 0 {
        anyhow::bail!("--iterations must be at least 1");
    }
    Ok(())
}

fn main() -> Result<()> {
    let _profiling_guard = voxel_vae::profiling::init("decode_trace.json");
    if _profiling_guard.is_none() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }

    let args = Args::parse();
    validate_args(&args)?;

    let device = parse_device(&args.device)?;
    println!("Device: {}", device_info(&device));

    let config = match &args.config {
        Some(path) => DecoderConfig::from_file(path)?,
        None => DecoderConfig::default(),
    };

    let varmap = VarMap::new();
    let vb = if args.zero_weights {
        VarBuilder::zeros(DType::F32, &device)
    } else {
        VarBuilder::from_varmap(&varmap, DType::F32, &device)
    };

    let start = Instant::now();
    let decoder = VaeDecoder::new(config, vb)?;
    println!(
        "Built decoder: {} stages, {} parameters ({:.2?})",
        decoder.num_stages(),
        decoder.num_parameters(),
        start.elapsed()
    );

    let input = VolumeShape::new(
        args.batch,
        decoder.config().latent_channels,
        args.size,
        args.size,
        args.size,
    );
    let expected = decoder.output_shape(input)?;
    println!("Latent {input} -> {expected}");

    let latent = Tensor::randn(0f32, 1.0, input.dims().to_vec(), &device)?;

    let mut output = None;
    for i in 0..args.iterations {
        let start = Instant::now();
        let decoded = decoder.forward(&latent)?;
        sync_device(&device)?;
        println!("Decode {}: {:.2?}", i + 1, start.elapsed());
        output = Some(decoded);
    }
    let output = output.context("no decode ran")?;

    let flat = output.flatten_all()?;
    let mean = flat.mean_all()?.to_scalar::<f32>()?;
    let std = flat
        .broadcast_sub(&flat.mean_all()?)?
        .sqr()?
        .mean_all()?
        .sqrt()?
        .to_scalar::<f32>()?;
    let min = flat.min(0)?.to_scalar::<f32>()?;
    let max = flat.max(0)?.to_scalar::<f32>()?;
    println!("Output {:?}", output.dims());
    println!("  mean {mean:.6}  std {std:.6}  min {min:.6}  max {max:.6}");

    if let Some(path) = &args.output {
        output
            .write_npy(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved volume to: {}", path.display());
    }

    Ok(())
}
