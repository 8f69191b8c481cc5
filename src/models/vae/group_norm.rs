//! Channel-group normalization for volumetric tensors

use anyhow::{bail, Result};
use candle_core::{Module, Tensor};
use candle_nn::{Activation, Init, VarBuilder};

use super::stage::{DecoderStage, VolumeShape};

/// Group count and epsilon shared by every normalization in the decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupNormConfig {
    /// Number of channel groups (32 in the reference model)
    pub num_groups: usize,
    pub eps: f64,
}

impl Default for GroupNormConfig {
    fn default() -> Self {
        Self {
            num_groups: 32,
            eps: 1e-5,
        }
    }
}

impl GroupNormConfig {
    /// Fail unless `channels` splits evenly into groups.
    pub fn check_channels(&self, channels: usize, what: &str) -> Result<()> {
        if channels == 0 {
            bail!("{what}: channel count must be positive");
        }
        if self.num_groups == 0 || channels % self.num_groups != 0 {
            bail!(
                "{what}: {channels} channels are not divisible into {} normalization groups",
                self.num_groups
            );
        }
        Ok(())
    }
}

/// GroupNorm over `[batch, channels, depth, height, width]`.
///
/// Wraps [`candle_nn::GroupNorm`]: statistics are taken per sample over each
/// group of `channels / num_groups` channels and the whole volume (in f32 for
/// half-precision inputs), then a per-channel affine transform is applied.
pub struct GroupNorm {
    inner: candle_nn::GroupNorm,
    weight: Tensor,
    bias: Tensor,
    channels: usize,
    config: GroupNormConfig,
}

impl GroupNorm {
    pub fn new(channels: usize, config: GroupNormConfig, vb: VarBuilder) -> Result<Self> {
        config.check_channels(channels, "group_norm")?;
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        Self::from_weights(weight, bias, config)
    }

    pub fn from_weights(weight: Tensor, bias: Tensor, config: GroupNormConfig) -> Result<Self> {
        if weight.rank() != 1 || bias.dims() != weight.dims() {
            bail!(
                "group_norm: weight {:?} and bias {:?} must both be [channels]",
                weight.dims(),
                bias.dims()
            );
        }
        let channels = weight.dim(0)?;
        config.check_channels(channels, "group_norm")?;
        let inner = candle_nn::GroupNorm::new(
            weight.clone(),
            bias.clone(),
            channels,
            config.num_groups,
            config.eps,
        )?;
        Ok(Self {
            inner,
            weight,
            bias,
            channels,
            config,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn num_groups(&self) -> usize {
        self.config.num_groups
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        VolumeShape::of(x)?.expect_channels(self.channels, "group_norm")?;
        Ok(self.inner.forward(x)?)
    }
}

impl DecoderStage for GroupNorm {
    fn kind(&self) -> &'static str {
        "group_norm"
    }

    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        input.expect_channels(self.channels, self.kind())?;
        Ok(input)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        GroupNorm::forward(self, x)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }
}

impl Module for GroupNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        GroupNorm::forward(self, x).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

/// Self-gated activation `x * sigmoid(x)` as a parameterless stage.
pub struct Silu;

impl DecoderStage for Silu {
    fn kind(&self) -> &'static str {
        "silu"
    }

    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        Ok(input)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(Activation::Silu.forward(x)?)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn mean_and_var(values: &[f32]) -> (f32, f32) {
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        (mean, var)
    }

    #[test]
    fn test_group_norm_default_config() {
        let config = GroupNormConfig::default();
        assert_eq!(config.num_groups, 32);
        assert!((config.eps - 1e-5).abs() < 1e-12);
    }

    #[test]
    fn test_group_norm_normalizes_each_group() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = GroupNormConfig {
            num_groups: 2,
            eps: 1e-5,
        };
        let norm = GroupNorm::new(4, config, vb).unwrap();

        let input = (Tensor::randn(0.0f32, 3.0, (2, 4, 2, 3, 2), &device).unwrap() + 5.0).unwrap();
        let output = norm.forward(&input).unwrap();
        assert_eq!(output.dims(), input.dims());

        // Weight is 1 and bias 0, so every (sample, group) slice is standardized
        let grouped = output.reshape((2, 2, 24)).unwrap();
        for b in 0..2 {
            for g in 0..2 {
                let values: Vec<f32> = grouped
                    .get(b)
                    .unwrap()
                    .get(g)
                    .unwrap()
                    .to_vec1()
                    .unwrap();
                let (mean, var) = mean_and_var(&values);
                assert!(mean.abs() < 1e-4, "group mean {mean}");
                assert!((var - 1.0).abs() < 1e-3, "group var {var}");
            }
        }
    }

    #[test]
    fn test_group_norm_affine() {
        let device = Device::Cpu;
        let weight = Tensor::new(&[2.0f32, 2.0], &device).unwrap();
        let bias = Tensor::new(&[1.0f32, -1.0], &device).unwrap();
        let config = GroupNormConfig {
            num_groups: 1,
            eps: 1e-5,
        };
        let norm = GroupNorm::from_weights(weight, bias, config).unwrap();

        // Constant input normalizes to zero, leaving only the bias
        let input = Tensor::ones((1, 2, 2, 2, 2), DType::F32, &device).unwrap();
        let output = norm.forward(&input).unwrap();
        let first: Vec<f32> = output.get(0).unwrap().get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let second: Vec<f32> = output.get(0).unwrap().get(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(first.iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(second.iter().all(|v| (v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_group_norm_rejects_indivisible_channels() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        assert!(GroupNorm::new(48, GroupNormConfig::default(), vb.clone()).is_err());
        assert!(GroupNorm::new(0, GroupNormConfig::default(), vb.clone()).is_err());
        assert!(GroupNorm::new(64, GroupNormConfig::default(), vb).is_ok());
    }

    #[test]
    fn test_group_norm_channel_mismatch() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let norm = GroupNorm::new(64, GroupNormConfig::default(), vb).unwrap();
        let input = Tensor::zeros((1, 32, 2, 2, 2), DType::F32, &device).unwrap();
        assert!(norm.forward(&input).is_err());
    }

    #[test]
    fn test_silu_stage() {
        let device = Device::Cpu;
        let input = Tensor::new(&[0.0f32, 1.0, -1.0], &device)
            .unwrap()
            .reshape((1, 1, 1, 1, 3))
            .unwrap();
        let output = DecoderStage::forward(&Silu, &input).unwrap();
        let values: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        let sigmoid = |v: f32| 1.0 / (1.0 + (-v).exp());
        assert!(values[0].abs() < 1e-6);
        assert!((values[1] - sigmoid(1.0)).abs() < 1e-5);
        assert!((values[2] + sigmoid(-1.0)).abs() < 1e-5);
    }

    #[test]
    fn test_group_norm_matches_hand_computed_statistics() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = GroupNormConfig {
            num_groups: 4,
            eps: 1e-5,
        };
        let weight = (Tensor::randn(0f32, 1.0, 8, &device).unwrap() + 1.0).unwrap();
        let bias = Tensor::randn(0f32, 1.0, 8, &device).unwrap();
        let norm = GroupNorm::from_weights(weight.clone(), bias.clone(), config).unwrap();
        assert!(GroupNorm::new(8, config, vb).is_ok());

        let input = Tensor::randn(0f32, 2.0, (2, 8, 3, 2, 4), &device).unwrap();
        let output = norm.forward(&input).unwrap();

        let x: Vec<f32> = input.flatten_all().unwrap().to_vec1().unwrap();
        let y: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        let w: Vec<f32> = weight.to_vec1().unwrap();
        let b: Vec<f32> = bias.to_vec1().unwrap();
        let voxels = 3 * 2 * 4;
        let group_len = 2 * voxels;
        for (g, chunk) in x.chunks(group_len).enumerate() {
            let (mean, var) = mean_and_var(chunk);
            let std = (var + 1e-5).sqrt();
            for (i, v) in chunk.iter().enumerate() {
                let channel = (g % 4) * 2 + i / voxels;
                let expected = (v - mean) / std * w[channel] + b[channel];
                let got = y[g * group_len + i];
                assert!((got - expected).abs() < 1e-4, "group {g} idx {i}: {got} vs {expected}");
            }
        }
    }

    #[test]
    fn test_group_norm_parameter_names() {
        let device = Device::Cpu;
        let norm = GroupNorm::new(32, GroupNormConfig::default(), VarBuilder::zeros(DType::F32, &device)).unwrap();
        let names: Vec<String> = DecoderStage::parameters(&norm).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["weight", "bias"]);
        assert_eq!(norm.num_groups(), 32);
    }
}
