//! Neural network models for volumetric VAE decoding
//!
//! This module contains:
//! - `vae`: Decoder building blocks and the stage pipeline
//! - `config`: Decoder configuration

pub mod config;
pub mod vae;

pub use config::{DecoderConfig, LATENT_SCALING_FACTOR};
pub use vae::{DecoderStage, VaeDecoder, VolumeShape};
