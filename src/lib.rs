//! # voxel-vae
//!
//! Pure Rust decoder for volumetric latent diffusion: maps a compact latent
//! volume back to a full-resolution voxel grid, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! ## Features
//!
//! - **CPU inference** with optional MKL/Accelerate for faster BLAS operations
//! - **CUDA** support for NVIDIA GPU acceleration
//! - **Metal** support for Apple Silicon
//! - **3D convolutions** (regular and transposed) composed from candle's 2D kernels
//! - **Checkpoint-compatible parameter names** (`0.weight`, `1.groupnorm_1.weight`, ...)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use candle_core::{DType, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use voxel_vae::{auto_device, DecoderConfig, VaeDecoder};
//!
//! let device = auto_device()?;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let decoder = VaeDecoder::new(DecoderConfig::default(), vb)?;
//!
//! // [B, 4, d, h, w] -> [B, 64, 8d, 8h, 8w]
//! let latent = Tensor::randn(0f32, 1.0, (1, 4, 8, 8, 8), &device)?;
//! let voxels = decoder.forward(&latent)?;
//! assert_eq!(voxels.dims(), &[1, 64, 64, 64, 64]);
//! ```
//!
//! ## Architecture
//!
//! The decoder is a fixed sequence of stages, each declaring the shape it
//! produces:
//!
//! 1. **Conv3d** lifts the 4 latent channels to 512.
//! 2. **ResidualBlock** groups refine features at each resolution.
//! 3. **ConvTranspose3d** (kernel 4, stride 2, padding 1) doubles every
//!    spatial axis between resolution stages, three times in total.
//! 4. **GroupNorm + SiLU + Conv3d** project the 128 final channels to 64.
//!
//! An optional **SpatialAttentionBlock** (single-head self-attention over all
//! voxels) can be inserted after the first resolution stage.
//!
//! The latent is divided by [`LATENT_SCALING_FACTOR`] exactly once on entry.
//!
//! ## Weights
//!
//! Parameters are created through a [`candle_nn::VarBuilder`]. Any loader that
//! yields a `name -> Tensor` map (safetensors, a converted state dict, ...)
//! can feed [`VaeDecoder::new`] via `VarBuilder::from_tensors`.

pub mod models;
pub mod profiling;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

pub use models::config::{DecoderConfig, LATENT_SCALING_FACTOR};
pub use models::vae::{
    Conv3d, Conv3dConfig, ConvTranspose3d, ConvTranspose3dConfig, DecoderStage, GroupNorm,
    GroupNormConfig, ResidualBlock, SelfAttention, Silu, SpatialAttentionBlock, VaeDecoder,
    VolumeShape,
};

/// Select the best available compute device.
///
/// Checks for available hardware in order: CUDA, Metal, CPU.
///
/// # Feature Flags
///
/// - `cuda`: Enables NVIDIA GPU support
/// - `metal`: Enables Apple Silicon GPU support
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device string into a [`Device`].
///
/// Supported formats: `auto`, `cpu`, `cuda`, `cuda:N`, `metal`.
///
/// # Errors
///
/// Fails if the string is unrecognized, the backend wasn't compiled in, or
/// hardware initialization fails.
pub fn parse_device(device_str: &str) -> Result<Device> {
    match device_str.to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = match s.strip_prefix("cuda:") {
                    Some(idx) => idx
                        .parse()
                        .map_err(|e| anyhow::anyhow!("invalid CUDA device index: {e}"))?,
                    None => 0,
                };
                Device::cuda_if_available(ordinal)
                    .map_err(|e| anyhow::anyhow!("failed to init CUDA device {ordinal}: {e}"))
            }
            #[cfg(not(feature = "cuda"))]
            anyhow::bail!("CUDA support not compiled in. Rebuild with: cargo build --features cuda")
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)
                    .map_err(|e| anyhow::anyhow!("failed to init Metal device: {e}"))
            }
            #[cfg(not(feature = "metal"))]
            anyhow::bail!(
                "Metal support not compiled in. Rebuild with: cargo build --features metal"
            )
        }
        other => {
            anyhow::bail!("unknown device '{other}'. Supported: auto, cpu, cuda, cuda:N, metal")
        }
    }
}

/// Human-readable label for a [`Device`].
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}

/// Block until all queued GPU work has completed.
///
/// GPU kernels launch asynchronously, so wall-clock timings of a decode are
/// only meaningful after a sync. No-op on CPU.
pub fn sync_device(device: &Device) -> Result<()> {
    match device {
        Device::Cpu => Ok(()),
        _ => {
            let _: Vec<f32> = Tensor::zeros(1, DType::F32, device)?.to_vec1()?;
            Ok(())
        }
    }
}
