//! Spatial self-attention over every voxel of a volume
//!
//! The volume is flattened into a sequence of `depth * height * width`
//! positions and attended with a single head. Cost is quadratic in the number
//! of voxels, so the block only belongs at the most downsampled resolution.

use anyhow::{bail, Result};
use candle_core::{Module, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use super::stage::{prefixed, DecoderStage, VolumeShape};
use super::{GroupNorm, GroupNormConfig};

/// Single-head self-attention over a `[batch, seq_len, channels]` sequence.
///
/// Query, key and value come from one fused `in_proj` (C -> 3C); no mask and
/// no positional encoding are applied.
pub struct SelfAttention {
    in_proj: Linear,
    out_proj: Linear,
    channels: usize,
    scale: f64,
}

impl SelfAttention {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        if channels == 0 {
            bail!("self_attention: channel count must be positive");
        }
        Ok(Self {
            in_proj: linear(channels, 3 * channels, vb.pp("in_proj"))?,
            out_proj: linear(channels, channels, vb.pp("out_proj"))?,
            channels,
            scale: 1.0 / (channels as f64).sqrt(),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_batch, _seq_len, channels) = x.dims3()?;
        if channels != self.channels {
            bail!(
                "self_attention: expected {} features per position, got {channels}",
                self.channels
            );
        }

        let qkv = self.in_proj.forward(x)?;
        let q = qkv.narrow(D::Minus1, 0, channels)?.contiguous()?;
        let k = qkv.narrow(D::Minus1, channels, channels)?.contiguous()?;
        let v = qkv.narrow(D::Minus1, 2 * channels, channels)?.contiguous()?;

        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights.matmul(&v)?;

        Ok(self.out_proj.forward(&out)?)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = Vec::with_capacity(4);
        for (name, layer) in [("in_proj", &self.in_proj), ("out_proj", &self.out_proj)] {
            params.push((format!("{name}.weight"), layer.weight().clone()));
            if let Some(bias) = layer.bias() {
                params.push((format!("{name}.bias"), bias.clone()));
            }
        }
        params
    }
}

/// Attention block
///
/// Architecture:
/// 1. GroupNorm
/// 2. Flatten `[B, C, D, H, W]` into `[B, D*H*W, C]`
/// 3. Single-head self-attention across all positions
/// 4. Restore `[B, C, D, H, W]`
/// 5. Add the un-normalized input
pub struct SpatialAttentionBlock {
    groupnorm: GroupNorm,
    attention: SelfAttention,
    channels: usize,
}

impl SpatialAttentionBlock {
    pub fn new(channels: usize, norm: GroupNormConfig, vb: VarBuilder) -> Result<Self> {
        norm.check_channels(channels, "attention_block")?;
        Ok(Self {
            groupnorm: GroupNorm::new(channels, norm, vb.pp("groupnorm"))?,
            attention: SelfAttention::new(channels, vb.pp("attention"))?,
            channels,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Forward pass.
    ///
    /// Input and output shape: [batch, channels, depth, height, width]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let shape = VolumeShape::of(x)?;
        shape.expect_channels(self.channels, "attention_block")?;

        let hidden = self.groupnorm.forward(x)?;
        let hidden = hidden
            .reshape((shape.batch, shape.channels, shape.voxels()))?
            .transpose(1, 2)?
            .contiguous()?;

        let hidden = self.attention.forward(&hidden)?;

        let hidden = hidden
            .transpose(1, 2)?
            .reshape(shape.dims().to_vec())?;

        Ok((hidden + x)?)
    }
}

impl DecoderStage for SpatialAttentionBlock {
    fn kind(&self) -> &'static str {
        "attention_block"
    }

    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        input.expect_channels(self.channels, self.kind())?;
        Ok(input)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        SpatialAttentionBlock::forward(self, x)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = prefixed("groupnorm", DecoderStage::parameters(&self.groupnorm));
        params.extend(prefixed("attention", self.attention.parameters()));
        params
    }
}

impl Module for SpatialAttentionBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        SpatialAttentionBlock::forward(self, x).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_norm() -> GroupNormConfig {
        GroupNormConfig {
            num_groups: 4,
            eps: 1e-5,
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn test_attention_block_preserves_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = SpatialAttentionBlock::new(16, small_norm(), vb).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (2, 16, 2, 3, 4), &device).unwrap();
        let output = block.forward(&input).unwrap();
        assert_eq!(output.dims(), &[2, 16, 2, 3, 4]);
    }

    #[test]
    fn test_self_attention_is_permutation_equivariant() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = SelfAttention::new(8, vb).unwrap();

        let seq_len = 6u32;
        let input = Tensor::randn(0.0f32, 1.0, (1, seq_len as usize, 8), &device).unwrap();
        let perm = Tensor::new(&[3u32, 0, 5, 1, 4, 2], &device).unwrap();

        let permuted_then_attended = attn.forward(&input.index_select(&perm, 1).unwrap()).unwrap();
        let attended_then_permuted = attn.forward(&input).unwrap().index_select(&perm, 1).unwrap();

        let diff = max_abs_diff(&permuted_then_attended, &attended_then_permuted);
        assert!(diff < 1e-4, "attention is not permutation equivariant, diff={diff}");
    }

    #[test]
    fn test_attention_block_flatten_order_independent_up_to_rounding() {
        // Flattening in (w, h, d) order instead of (d, h, w) and restoring the
        // axes afterwards gives the same volume; only the summation order in
        // the softmax and matmuls differs, hence the tolerance
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = SpatialAttentionBlock::new(8, small_norm(), vb).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (1, 8, 2, 3, 4), &device).unwrap();
        let reference = block.forward(&input).unwrap();

        let swapped = input.permute([0, 1, 4, 3, 2]).unwrap().contiguous().unwrap();
        let restored = block
            .forward(&swapped)
            .unwrap()
            .permute([0, 1, 4, 3, 2])
            .unwrap()
            .contiguous()
            .unwrap();

        assert_eq!(restored.dims(), reference.dims());
        let diff = max_abs_diff(&restored, &reference);
        assert!(diff < 1e-4, "flatten order changed the output, diff={diff}");
    }

    #[test]
    fn test_attention_block_zero_weights_is_identity() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let block = SpatialAttentionBlock::new(8, small_norm(), vb).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (1, 8, 2, 2, 2), &device).unwrap();
        let output = block.forward(&input).unwrap();
        let expected: Vec<f32> = input.flatten_all().unwrap().to_vec1().unwrap();
        let actual: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_attention_block_channel_mismatch() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let block = SpatialAttentionBlock::new(8, small_norm(), vb).unwrap();

        let input = Tensor::zeros((1, 4, 2, 2, 2), DType::F32, &device).unwrap();
        assert!(block.forward(&input).is_err());
    }

    #[test]
    fn test_attention_block_rejects_indivisible_channels() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        assert!(SpatialAttentionBlock::new(48, GroupNormConfig::default(), vb.clone()).is_err());
        assert!(SpatialAttentionBlock::new(0, GroupNormConfig::default(), vb).is_err());
    }

    #[test]
    fn test_attention_block_parameter_names() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let block = SpatialAttentionBlock::new(8, small_norm(), vb).unwrap();
        let params = DecoderStage::parameters(&block);
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "groupnorm.weight",
                "groupnorm.bias",
                "attention.in_proj.weight",
                "attention.in_proj.bias",
                "attention.out_proj.weight",
                "attention.out_proj.bias",
            ]
        );
        assert_eq!(params[2].1.dims(), &[24, 8]);
    }
}
