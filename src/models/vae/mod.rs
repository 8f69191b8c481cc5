//! Volumetric VAE decoder
//!
//! This module implements the decoding half of a 3D variational autoencoder:
//! a latent volume `[B, 4, d, h, w]` is mapped back to a voxel grid
//! `[B, 64, 8d, 8h, 8w]`.
//!
//! Building blocks:
//! - `conv3d` / `conv_transpose3d`: cubic-kernel 3D convolutions on top of candle's 2D ops
//! - `group_norm`: channel-group normalization and the SiLU stage
//! - `residual_block`: norm/activate/convolve residual unit
//! - `attention_block`: single-head self-attention over all voxels
//! - `decoder`: the fixed stage sequence

pub mod attention_block;
pub mod conv3d;
pub mod conv_transpose3d;
pub mod decoder;
pub mod group_norm;
pub mod residual_block;
pub mod stage;

pub use attention_block::{SelfAttention, SpatialAttentionBlock};
pub use conv3d::{Conv3d, Conv3dConfig};
pub use conv_transpose3d::{ConvTranspose3d, ConvTranspose3dConfig};
pub use decoder::VaeDecoder;
pub use group_norm::{GroupNorm, GroupNormConfig, Silu};
pub use residual_block::{ResidualBlock, ResidualPath};
pub use stage::{DecoderStage, VolumeShape};
