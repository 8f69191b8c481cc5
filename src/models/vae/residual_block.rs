//! Residual block used at every resolution stage of the volumetric decoder

use anyhow::{bail, Result};
use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::stage::{prefixed, DecoderStage, VolumeShape};
use super::{Conv3d, Conv3dConfig, GroupNorm, GroupNormConfig};

/// Skip connection of a [`ResidualBlock`].
pub enum ResidualPath {
    /// `in_channels == out_channels`: the input passes through untouched
    Identity,
    /// 1x1x1 convolution projecting `in_channels` to `out_channels`
    Projection(Conv3d),
}

/// Residual block
///
/// Architecture:
/// 1. GroupNorm over `in_channels`
/// 2. SiLU
/// 3. 3x3x3 conv, `in_channels -> out_channels`
/// 4. GroupNorm over `out_channels`
/// 5. SiLU
/// 6. 3x3x3 conv, `out_channels -> out_channels`
/// 7. Add the skip path (identity or 1x1x1 projection)
pub struct ResidualBlock {
    groupnorm_1: GroupNorm,
    conv_1: Conv3d,
    groupnorm_2: GroupNorm,
    conv_2: Conv3d,
    residual: ResidualPath,
    in_channels: usize,
    out_channels: usize,
}

impl ResidualBlock {
    /// Create a new residual block.
    ///
    /// # Arguments
    /// * `in_channels` - Channels of the incoming volume
    /// * `out_channels` - Channels produced by the block
    /// * `norm` - Group count and epsilon for both normalizations
    /// * `vb` - Variable builder for loading weights
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        norm: GroupNormConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 {
            bail!(
                "residual_block: channel counts must be positive (in={in_channels}, out={out_channels})"
            );
        }
        norm.check_channels(in_channels, "residual_block input")?;
        norm.check_channels(out_channels, "residual_block output")?;

        let same = Conv3dConfig { padding: 1 };
        let groupnorm_1 = GroupNorm::new(in_channels, norm, vb.pp("groupnorm_1"))?;
        let conv_1 = Conv3d::new(in_channels, out_channels, 3, same, vb.pp("conv_1"))?;
        let groupnorm_2 = GroupNorm::new(out_channels, norm, vb.pp("groupnorm_2"))?;
        let conv_2 = Conv3d::new(out_channels, out_channels, 3, same, vb.pp("conv_2"))?;

        let residual = if in_channels == out_channels {
            ResidualPath::Identity
        } else {
            ResidualPath::Projection(Conv3d::new(
                in_channels,
                out_channels,
                1,
                Conv3dConfig::default(),
                vb.pp("residual_layer"),
            )?)
        };

        Ok(Self {
            groupnorm_1,
            conv_1,
            groupnorm_2,
            conv_2,
            residual,
            in_channels,
            out_channels,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn residual_path(&self) -> &ResidualPath {
        &self.residual
    }

    /// Forward pass.
    ///
    /// Input shape: [batch, in_channels, depth, height, width]
    /// Output shape: [batch, out_channels, depth, height, width]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        VolumeShape::of(x)?.expect_channels(self.in_channels, "residual_block")?;

        let hidden = self.groupnorm_1.forward(x)?;
        let hidden = candle_nn::ops::silu(&hidden)?;
        let hidden = self.conv_1.forward(&hidden)?;

        let hidden = self.groupnorm_2.forward(&hidden)?;
        let hidden = candle_nn::ops::silu(&hidden)?;
        let hidden = self.conv_2.forward(&hidden)?;

        let skip = match &self.residual {
            ResidualPath::Identity => x.clone(),
            ResidualPath::Projection(conv) => conv.forward(x)?,
        };

        Ok((hidden + skip)?)
    }
}

impl DecoderStage for ResidualBlock {
    fn kind(&self) -> &'static str {
        "residual_block"
    }

    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        input.expect_channels(self.in_channels, self.kind())?;
        Ok(input.with_channels(self.out_channels))
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        ResidualBlock::forward(self, x)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = prefixed("groupnorm_1", self.groupnorm_1.parameters());
        params.extend(prefixed("conv_1", self.conv_1.parameters()));
        params.extend(prefixed("groupnorm_2", self.groupnorm_2.parameters()));
        params.extend(prefixed("conv_2", self.conv_2.parameters()));
        if let ResidualPath::Projection(conv) = &self.residual {
            params.extend(prefixed("residual_layer", conv.parameters()));
        }
        params
    }
}

impl Module for ResidualBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        ResidualBlock::forward(self, x).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}
