//! Decoder configuration

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::vae::{GroupNormConfig, VolumeShape};

/// Scale applied to latents by the encoder (`latent * 0.18215`).
///
/// The decoder divides by the same value on entry, so both sides must agree on
/// it for a trained checkpoint to reproduce its outputs.
pub const LATENT_SCALING_FACTOR: f64 = 0.18215;

/// Volumetric VAE decoder configuration
///
/// The defaults describe the reference decoder:
///
/// ```text
/// [B, 4, d, h, w]
///   -> Conv3d(4, 512, 3) + 3x ResidualBlock(512)
///   -> ConvTranspose3d(512, 512) + 2x ResidualBlock(512)     [B, 512, 2d, 2h, 2w]
///   -> ConvTranspose3d(512, 256) + 2x ResidualBlock(256)     [B, 256, 4d, 4h, 4w]
///   -> ConvTranspose3d(256, 128) + 2x ResidualBlock(128)     [B, 128, 8d, 8h, 8w]
///   -> GroupNorm + SiLU + Conv3d(128, 64, 3)                 [B, 64, 8d, 8h, 8w]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Channels of the incoming latent volume
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,

    /// Channels of the decoded volume
    #[serde(default = "default_out_channels")]
    pub out_channels: usize,

    /// Width of each resolution stage, lowest resolution first.
    /// Every stage after the first starts with a 2x upsample.
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,

    /// Residual blocks per stage
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: Vec<usize>,

    /// GroupNorm group count
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,

    /// GroupNorm epsilon
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,

    /// Latent scale used by the encoder; the decoder divides by it
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f64,

    /// Insert a spatial self-attention block after the first stage
    #[serde(default)]
    pub mid_attention: bool,
}

fn default_latent_channels() -> usize {
    4
}
fn default_out_channels() -> usize {
    64
}
fn default_block_out_channels() -> Vec<usize> {
    vec![512, 512, 256, 128]
}
fn default_layers_per_block() -> Vec<usize> {
    vec![3, 2, 2, 2]
}
fn default_norm_num_groups() -> usize {
    32
}
fn default_norm_eps() -> f64 {
    1e-5
}
fn default_scaling_factor() -> f64 {
    LATENT_SCALING_FACTOR
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            latent_channels: default_latent_channels(),
            out_channels: default_out_channels(),
            block_out_channels: default_block_out_channels(),
            layers_per_block: default_layers_per_block(),
            norm_num_groups: default_norm_num_groups(),
            norm_eps: default_norm_eps(),
            scaling_factor: default_scaling_factor(),
            mid_attention: false,
        }
    }
}

impl DecoderConfig {
    /// Load config from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid decoder config in {}", path.display()))
    }

    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse decoder config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn norm(&self) -> GroupNormConfig {
        GroupNormConfig {
            num_groups: self.norm_num_groups,
            eps: self.norm_eps,
        }
    }

    /// Number of resolution stages
    pub fn num_stages(&self) -> usize {
        self.block_out_channels.len()
    }

    /// Spatial growth per axis from latent to output (`2^(stages - 1)`).
    pub fn upsample_factor(&self) -> Result<usize> {
        u32::try_from(self.num_stages().saturating_sub(1))
            .ok()
            .and_then(|shift| 1usize.checked_shl(shift))
            .with_context(|| {
                format!(
                    "{} stages upsample by more than usize can represent",
                    self.num_stages()
                )
            })
    }

    /// Shape of the decoded volume for a latent of shape `input`.
    pub fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        input.expect_channels(self.latent_channels, "decoder")?;
        let f = self.upsample_factor()?;
        let scale = |extent: usize, axis: &str| {
            extent
                .checked_mul(f)
                .with_context(|| format!("{axis} {extent} x{f} overflows usize"))
        };
        Ok(VolumeShape::new(
            input.batch,
            self.out_channels,
            scale(input.depth, "depth")?,
            scale(input.height, "height")?,
            scale(input.width, "width")?,
        ))
    }

    /// Check that the config describes a buildable decoder.
    pub fn validate(&self) -> Result<()> {
        if self.latent_channels == 0 || self.out_channels == 0 {
            bail!(
                "latent_channels ({}) and out_channels ({}) must be positive",
                self.latent_channels,
                self.out_channels
            );
        }
        if self.block_out_channels.is_empty() {
            bail!("block_out_channels must name at least one stage");
        }
        if self.block_out_channels.len() != self.layers_per_block.len() {
            bail!(
                "block_out_channels has {} stages but layers_per_block has {}",
                self.block_out_channels.len(),
                self.layers_per_block.len()
            );
        }
        if !self.norm_eps.is_finite() || self.norm_eps <= 0.0 {
            bail!("norm_eps must be finite and positive, got {}", self.norm_eps);
        }
        if !self.scaling_factor.is_finite() || self.scaling_factor == 0.0 {
            bail!("scaling_factor must be finite and non-zero, got {}", self.scaling_factor);
        }
        self.upsample_factor()?;
        let norm = self.norm();
        for (i, &channels) in self.block_out_channels.iter().enumerate() {
            norm.check_channels(channels, &format!("block_out_channels[{i}]"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_config_default() {
        let config = DecoderConfig::default();
        assert_eq!(config.latent_channels, 4);
        assert_eq!(config.out_channels, 64);
        assert_eq!(config.block_out_channels, vec![512, 512, 256, 128]);
        assert_eq!(config.layers_per_block, vec![3, 2, 2, 2]);
        assert_eq!(config.norm_num_groups, 32);
        assert_eq!(config.scaling_factor, 0.18215);
        assert!(!config.mid_attention);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_upsample_factor() {
        let config = DecoderConfig::default();
        assert_eq!(config.upsample_factor().unwrap(), 8);

        let single = DecoderConfig {
            block_out_channels: vec![64],
            layers_per_block: vec![1],
            ..Default::default()
        };
        assert_eq!(single.upsample_factor().unwrap(), 1);
    }

    #[test]
    fn test_output_shape() {
        let config = DecoderConfig::default();
        let out = config
            .output_shape(VolumeShape::new(1, 4, 8, 8, 8))
            .unwrap();
        assert_eq!(out, VolumeShape::new(1, 64, 64, 64, 64));

        assert!(config.output_shape(VolumeShape::new(1, 3, 8, 8, 8)).is_err());
    }

    #[test]
    fn test_config_deserialization_with_defaults() {
        let config = DecoderConfig::from_json("{}").unwrap();
        assert_eq!(config, DecoderConfig::default());
    }

    #[test]
    fn test_config_deserialization_custom_values() {
        let json = r#"{
            "out_channels": 3,
            "block_out_channels": [64, 32],
            "layers_per_block": [1, 1],
            "norm_num_groups": 8,
            "mid_attention": true
        }"#;
        let config = DecoderConfig::from_json(json).unwrap();
        assert_eq!(config.latent_channels, 4);
        assert_eq!(config.out_channels, 3);
        assert_eq!(config.block_out_channels, vec![64, 32]);
        assert_eq!(config.norm_num_groups, 8);
        assert!(config.mid_attention);
        assert_eq!(config.upsample_factor().unwrap(), 2);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = DecoderConfig {
            mid_attention: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: DecoderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mismatched = DecoderConfig {
            layers_per_block: vec![3, 2],
            ..Default::default()
        };
        assert!(mismatched.validate().is_err());

        let empty = DecoderConfig {
            block_out_channels: vec![],
            layers_per_block: vec![],
            ..Default::default()
        };
        assert!(empty.validate().is_err());

        let zero_width = DecoderConfig {
            block_out_channels: vec![512, 0, 256, 128],
            ..Default::default()
        };
        assert!(zero_width.validate().is_err());

        let indivisible = DecoderConfig {
            block_out_channels: vec![512, 512, 256, 100],
            ..Default::default()
        };
        assert!(indivisible.validate().is_err());

        let no_out = DecoderConfig {
            out_channels: 0,
            ..Default::default()
        };
        assert!(no_out.validate().is_err());

        let no_scale = DecoderConfig {
            scaling_factor: 0.0,
            ..Default::default()
        };
        assert!(no_scale.validate().is_err());
    }

    #[test]
    fn test_from_file_nonexistent() {
        let result = DecoderConfig::from_file("/nonexistent/config.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"out_channels": 16}"#).unwrap();
        let config = DecoderConfig::from_file(&path).unwrap();
        assert_eq!(config.out_channels, 16);
        assert_eq!(config.block_out_channels, vec![512, 512, 256, 128]);
    }

    #[test]
    fn test_too_many_stages_rejected() {
        let deep = DecoderConfig {
            block_out_channels: vec![32; 70],
            layers_per_block: vec![1; 70],
            ..Default::default()
        };
        assert!(deep.upsample_factor().is_err());
        assert!(deep.validate().is_err());
        assert!(deep.output_shape(VolumeShape::new(1, 4, 1, 1, 1)).is_err());
    }

    #[test]
    fn test_output_shape_overflow_is_an_error() {
        let config = DecoderConfig::default();
        let huge = VolumeShape::new(1, 4, usize::MAX / 2, 1, 1);
        let err = config.output_shape(huge).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_validate_rejects_non_finite_eps() {
        for eps in [f64::NAN, f64::INFINITY, -1e-5, 0.0] {
            let config = DecoderConfig {
                norm_eps: eps,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "eps {eps} accepted");
        }
    }
}
