//! Volumetric VAE decoder
//!
//! Converts a latent volume back to a full-resolution voxel grid by running a
//! fixed, ordered list of stages.

use anyhow::{bail, Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::stage::{prefixed, DecoderStage, VolumeShape};
use super::{
    Conv3d, Conv3dConfig, ConvTranspose3d, ConvTranspose3dConfig, GroupNorm, ResidualBlock, Silu,
    SpatialAttentionBlock,
};
use crate::models::config::DecoderConfig;

/// A stage together with its position-derived checkpoint prefix.
struct NamedStage {
    name: String,
    stage: Box<dyn DecoderStage>,
}

/// Append a stage named after its position in the sequence.
fn push_stage<S, F>(stages: &mut Vec<NamedStage>, vb: &VarBuilder, build: F) -> Result<()>
where
    S: DecoderStage + 'static,
    F: FnOnce(VarBuilder) -> Result<S>,
{
    let name = stages.len().to_string();
    let stage = build(vb.pp(&name)).with_context(|| format!("building decoder stage {name}"))?;
    stages.push(NamedStage {
        name,
        stage: Box::new(stage),
    });
    Ok(())
}

/// Volumetric VAE decoder
///
/// Stage order for the default [`DecoderConfig`]:
///
/// | index | stage                               |
/// |-------|-------------------------------------|
/// | 0     | Conv3d 4 -> 512, k3 p1              |
/// | 1-3   | ResidualBlock 512                   |
/// | 4     | ConvTranspose3d 512 -> 512, k4 s2 p1 |
/// | 5-6   | ResidualBlock 512                   |
/// | 7     | ConvTranspose3d 512 -> 256          |
/// | 8-9   | ResidualBlock 256                   |
/// | 10    | ConvTranspose3d 256 -> 128          |
/// | 11-12 | ResidualBlock 128                   |
/// | 13    | GroupNorm 128                       |
/// | 14    | SiLU                                |
/// | 15    | Conv3d 128 -> 64, k3 p1             |
///
/// The index is also the parameter prefix (`0.weight`, `1.groupnorm_1.weight`,
/// ...). With `mid_attention` an attention block is inserted after stage 3 and
/// every later index shifts by one.
pub struct VaeDecoder {
    config: DecoderConfig,
    stages: Vec<NamedStage>,
}

impl VaeDecoder {
    /// Build the decoder, loading or initializing parameters through `vb`.
    pub fn new(config: DecoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let norm = config.norm();
        let same = Conv3dConfig { padding: 1 };
        let upsample = ConvTranspose3dConfig {
            padding: 1,
            stride: 2,
        };

        let mut stages = Vec::new();
        let first = config.block_out_channels[0];
        push_stage(&mut stages, &vb, |vb| {
            Conv3d::new(config.latent_channels, first, 3, same, vb)
        })?;

        let mut channels = first;
        for (i, (&width, &layers)) in config
            .block_out_channels
            .iter()
            .zip(config.layers_per_block.iter())
            .enumerate()
        {
            if i > 0 {
                let in_channels = channels;
                push_stage(&mut stages, &vb, |vb| {
                    ConvTranspose3d::new(in_channels, width, 4, upsample, vb)
                })?;
            }
            for _ in 0..layers {
                push_stage(&mut stages, &vb, |vb| {
                    ResidualBlock::new(width, width, norm, vb)
                })?;
            }
            if i == 0 && config.mid_attention {
                push_stage(&mut stages, &vb, |vb| {
                    SpatialAttentionBlock::new(width, norm, vb)
                })?;
            }
            channels = width;
        }

        push_stage(&mut stages, &vb, |vb| GroupNorm::new(channels, norm, vb))?;
        push_stage(&mut stages, &vb, |_| Ok(Silu))?;
        push_stage(&mut stages, &vb, |vb| {
            Conv3d::new(channels, config.out_channels, 3, same, vb)
        })?;

        let decoder = Self { config, stages };
        tracing::info!(
            stages = decoder.stages.len(),
            parameters = decoder.num_parameters(),
            mid_attention = decoder.config.mid_attention,
            "Built volumetric VAE decoder"
        );
        Ok(decoder)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// `(name, kind)` of every stage in execution order.
    pub fn stage_kinds(&self) -> Vec<(&str, &'static str)> {
        self.stages
            .iter()
            .map(|s| (s.name.as_str(), s.stage.kind()))
            .collect()
    }

    /// Every learned tensor, keyed by its checkpoint name.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.stages
            .iter()
            .flat_map(|s| prefixed(&s.name, s.stage.parameters()))
            .collect()
    }

    /// Total number of learned scalars.
    pub fn num_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, t)| t.elem_count())
            .sum()
    }

    /// Shape produced for a latent of shape `input`, derived from each stage's
    /// declared contract without running the network.
    pub fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        input.expect_channels(self.config.latent_channels, "decoder")?;
        self.stages.iter().try_fold(input, |shape, s| {
            s.stage
                .output_shape(shape)
                .with_context(|| format!("decoder stage {} ({})", s.name, s.stage.kind()))
        })
    }

    /// Undo the encoder's latent scaling: `latent / scaling_factor`.
    pub fn scale_latent(&self, latent: &Tensor) -> Result<Tensor> {
        Ok((latent / self.config.scaling_factor)?)
    }

    /// Decode a latent volume
    ///
    /// # Arguments
    /// * `latent` - Latent of shape [batch, latent_channels, d, h, w]
    ///
    /// Returns a tensor of shape [batch, out_channels, d*f, h*f, w*f] where
    /// `f` is [`DecoderConfig::upsample_factor`]. The input is left untouched.
    pub fn forward(&self, latent: &Tensor) -> Result<Tensor> {
        let _span = tracing::info_span!("vae_decode").entered();

        let input = VolumeShape::of(latent)?;
        input.expect_channels(self.config.latent_channels, "decoder")?;

        let mut x = self.scale_latent(latent)?;
        for s in &self.stages {
            let expected = s
                .stage
                .output_shape(VolumeShape::of(&x)?)
                .with_context(|| format!("decoder stage {} ({})", s.name, s.stage.kind()))?;
            x = s
                .stage
                .forward(&x)
                .with_context(|| format!("decoder stage {} ({})", s.name, s.stage.kind()))?;

            let actual = VolumeShape::of(&x)?;
            if actual != expected {
                bail!(
                    "decoder stage {} ({}) produced {actual}, declared {expected}",
                    s.name,
                    s.stage.kind()
                );
            }
            tracing::debug!(stage = %s.name, kind = s.stage.kind(), shape = %actual, "decoder stage done");
        }

        Ok(x)
    }
}

impl Module for VaeDecoder {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        VaeDecoder::forward(self, x).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}
