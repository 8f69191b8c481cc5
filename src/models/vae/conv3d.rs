//! 3D Convolution
//!
//! candle only ships 1D and 2D convolutions, so a cubic-kernel Conv3d is
//! assembled from 2D convolutions: for every kernel depth offset `kz` the
//! matching depth slab of the input is convolved with the `[out, in, k, k]`
//! kernel slice, and the partial results are summed.

use anyhow::{bail, Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::{init, Init, VarBuilder};

use super::stage::{DecoderStage, VolumeShape};

/// Convolution settings. Stride is always 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conv3dConfig {
    /// Zero padding applied on both sides of every spatial axis
    pub padding: usize,
}

/// Cubic-kernel 3D convolution with stride 1.
///
/// Weight layout is `[out_channels, in_channels, k, k, k]`.
pub struct Conv3d {
    weight: Tensor,
    bias: Option<Tensor>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv3dConfig,
}

impl Conv3d {
    /// Create a new conv3d layer.
    ///
    /// # Arguments
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `kernel_size` - Edge length of the cubic kernel
    /// * `config` - Padding
    /// * `vb` - Variable builder for loading weights (`weight`, `bias`)
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv3dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 {
            bail!("conv3d: channel counts must be positive (in={in_channels}, out={out_channels})");
        }
        if kernel_size == 0 {
            bail!("conv3d: kernel size must be positive");
        }

        let weight = vb.get_with_hints(
            (
                out_channels,
                in_channels,
                kernel_size,
                kernel_size,
                kernel_size,
            ),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1.0 / ((in_channels * kernel_size.pow(3)) as f64).sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;

        Self::from_weights(weight, Some(bias), config)
    }

    /// Create from raw weight and bias tensors.
    ///
    /// Weight should have shape [out_channels, in_channels, k, k, k].
    pub fn from_weights(weight: Tensor, bias: Option<Tensor>, config: Conv3dConfig) -> Result<Self> {
        let (out_channels, in_channels, kd, kh, kw) = weight
            .dims5()
            .context("conv3d weight must be [out, in, k, k, k]")?;
        if kd != kh || kh != kw {
            bail!("conv3d: only cubic kernels are supported, got {kd}x{kh}x{kw}");
        }
        if in_channels == 0 || out_channels == 0 || kd == 0 {
            bail!("conv3d: weight has an empty axis: {:?}", weight.dims());
        }
        if let Some(b) = &bias {
            if b.dims() != [out_channels] {
                bail!(
                    "conv3d: bias shape {:?} does not match out_channels={out_channels}",
                    b.dims()
                );
            }
        }

        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel_size: kd,
            config,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Kernel slice at depth offset `kz`, shaped `[out, in, k, k]`.
    fn depth_kernel(&self, kz: usize) -> Result<Tensor> {
        Ok(self.weight.narrow(2, kz, 1)?.squeeze(2)?.contiguous()?)
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn output_extent(&self, extent: usize) -> Result<usize> {
        let padded = extent + 2 * self.config.padding;
        if padded < self.kernel_size {
            bail!(
                "conv3d: padded extent {padded} is smaller than kernel size {}",
                self.kernel_size
            );
        }
        Ok(padded - self.kernel_size + 1)
    }

    /// Forward pass.
    ///
    /// Input shape: [batch, in_channels, depth, height, width]
    /// Output shape: [batch, out_channels, depth', height', width'] where
    /// each extent is `extent + 2 * padding - kernel_size + 1`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out_shape = self.output_shape(VolumeShape::of(x)?)?;
        let (b, c, _, h, w) = x.dims5()?;
        let pad = self.config.padding;
        let d_out = out_shape.depth;

        // Depth padding happens here; height/width padding is done by conv2d
        let x = if pad > 0 {
            x.pad_with_zeros(2, pad, pad)?
        } else {
            x.clone()
        };
        // [B, C, D, H, W] -> [B, D, C, H, W] so depth slabs fold into the batch axis
        let x = x.transpose(1, 2)?;

        let mut acc: Option<Tensor> = None;
        for kz in 0..self.kernel_size {
            let kernel = self.depth_kernel(kz)?;
            let slab = x.narrow(1, kz, d_out)?.reshape((b * d_out, c, h, w))?;
            let y = slab.conv2d(&kernel, pad, 1, 1, 1)?;
            acc = Some(match acc {
                Some(prev) => (prev + y)?,
                None => y,
            });
        }
        let y = acc.context("conv3d: kernel has no depth slices")?;

        let y = y
            .reshape((
                b,
                d_out,
                self.out_channels,
                out_shape.height,
                out_shape.width,
            ))?
            .transpose(1, 2)?
            .contiguous()?;

        match &self.bias {
            Some(bias) => Ok(y.broadcast_add(&bias.reshape((1, self.out_channels, 1, 1, 1))?)?),
            None => Ok(y),
        }
    }
}

impl DecoderStage for Conv3d {
    fn kind(&self) -> &'static str {
        "conv3d"
    }

    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape> {
        input.expect_channels(self.in_channels, self.kind())?;
        Ok(VolumeShape::new(
            input.batch,
            self.out_channels,
            self.output_extent(input.depth)?,
            self.output_extent(input.height)?,
            self.output_extent(input.width)?,
        ))
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Conv3d::forward(self, x)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = vec![("weight".to_string(), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push(("bias".to_string(), bias.clone()));
        }
        params
    }
}

impl Module for Conv3d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        Conv3d::forward(self, x).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}
