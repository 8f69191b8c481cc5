//! Transposed 3D Convolution
//!
//! Learned upsampling for the volumetric decoder. Like [`super::Conv3d`] it is
//! built from candle's 2D primitive: every kernel depth slice runs a 2D
//! transposed convolution on each input depth slab, the results are scattered
//! along depth with the stride, summed, then cropped by the padding.

use anyhow::{bail, Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::{init, Init, VarBuilder};

use super::stage::{DecoderStage, VolumeShape};

/// Transposed convolution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvTranspose3dConfig {
    pub padding: usize,
    pub stride: usize,
}

impl Default for ConvTranspose3dConfig {
    fn default() -> Self {
        Self {
            padding: 0,
            stride: 1,
        }
    }
}

/// Cubic-kernel transposed 3D convolution.
///
/// Weight layout is `[in_channels, out_channels, k, k, k]`.
pub struct ConvTranspose3d {
    weight: Tensor,
    bias: Option<Tensor>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: ConvTranspose3dConfig,
}

impl ConvTranspose3d {
    /// Create a new transposed conv3d layer.
    ///
    /// # Arguments
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `kernel_size` - Edge length of the cubic kernel
    /// * `config` - Stride and padding
    /// * `vb` - Variable builder for loading weights (`weight`, `bias`)
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: ConvTranspose3dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 {
            bail!(
                "conv_transpose3d: channel counts must be positive (in={in_channels}, out={out_channels})"
            );
        }
        if kernel_size == 0 {
            bail!("conv_transpose3d: kernel size must be positive");
        }

        let weight = vb.get_with_hints(
            (
                in_channels,
                out_channels,
                kernel_size,
                kernel_size,
                kernel_size,
            ),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1.0 / ((out_channels * kernel_size.pow(3)) as f64).sqrt();
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
    /// Weight should have shape [in_channels, out_channels, k, k, k].
    pub fn from_weights(
        weight: Tensor,
        bias: Option<Tensor>,
        config: ConvTranspose3dConfig,
    ) -> Result<Self> {
        let (in_channels, out_channels, kd, kh, kw) = weight
            .dims5()
            .context("conv_transpose3d weight must be [in, out, k, k, k]")?;
        if kd != kh || kh != kw {
            bail!("conv_transpose3d: only cubic kernels are supported, got {kd}x{kh}x{kw}");
        }
        if in_channels == 0 || out_channels == 0 || kd == 0 {
            bail!("conv_transpose3d: weight has an empty axis: {:?}", weight.dims());
        }
        if config.stride == 0 {
            bail!("conv_transpose3d: stride must be positive");
        }
        if let Some(b) = &bias {
            if b.dims() != [out_channels] {
                bail!(
                    "conv_transpose3d: bias shape {:?} does not match out_channels={out_channels}",
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

    /// Get the stride (upsampling factor)
    pub fn stride(&self) -> usize {
        self.config.stride
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Kernel slice at depth offset `kz`, shaped `[in, out, k, k]`.
    fn depth_kernel(&self, kz: usize) -> Result<Tensor> {
        Ok(self.weight.narrow(2, kz, 1)?.squeeze(2)?.contiguous()?)
    }

    /// Uncropped extent `(n - 1) * stride + k`.
    fn full_extent(&self, extent: usize) -> usize {
        (extent - 1) * self.config.stride + self.kernel_size
    }

    fn output_extent(&self, extent: usize) -> Result<usize> {
        if extent == 0 {
            bail!("conv_transpose3d: empty spatial axis");
        }
        let full = self.full_extent(extent);
        let crop = 2 * self.config.padding;
        if full <= crop {
            bail!("conv_transpose3d: padding {} consumes the whole output", self.config.padding);
        }
        Ok(full - crop)
    }

    /// Forward pass.
    ///
    /// Input shape: [batch, in_channels, depth, height, width]
    /// Output shape: [batch, out_channels, depth', height', width'] where each
    /// extent is `(extent - 1) * stride + kernel_size - 2 * padding`.
    /// With kernel 4, stride 2, padding 1 every spatial axis doubles exactly.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out_shape = self.output_shape(VolumeShape::of(x)?)?;
        let (b, c, d, h, w) = x.dims5()?;
        let stride = self.config.stride;
        let pad = self.config.padding;
        let k = self.kernel_size;
        let full_depth = self.full_extent(d);
        // Last input slab lands at (d - 1) * stride after spreading
        let spread_len = (d - 1) * stride + 1;

        let slabs = x.transpose(1, 2)?.reshape((b * d, c, h, w))?;

        let mut acc: Option<Tensor> = None;
        for kz in 0..self.kernel_size {
            let kernel = self.depth_kernel(kz)?;
            let y = slabs.conv_transpose2d(&kernel, pad, 0, stride, 1)?;
            let (_, o, ho, wo) = y.dims4()?;
            let y = y.reshape((b, d, o, ho, wo))?;

            // Interleave stride-1 zero slabs so input slab i sits at i * stride
            let y = if stride > 1 {
                y.unsqueeze(2)?
                    .pad_with_zeros(2, 0, stride - 1)?
                    .reshape((b, d * stride, o, ho, wo))?
            } else {
                y
            };
            let y = y
                .narrow(1, 0, spread_len)?
                .pad_with_zeros(1, kz, k - 1 - kz)?;

            acc = Some(match acc {
                Some(prev) => (prev + y)?,
                None => y,
            });
        }
        let y = acc.context("conv_transpose3d: kernel has no depth slices")?;
        debug_assert_eq!(y.dim(1)?, full_depth);

        let y = y
            .narrow(1, pad, out_shape.depth)?
            .transpose(1, 2)?
            .contiguous()?;

        match &self.bias {
            Some(bias) => Ok(y.broadcast_add(&bias.reshape((1, self.out_channels, 1, 1, 1))?)?),
            None => Ok(y),
        }
    }
}

impl DecoderStage for ConvTranspose3d {
    fn kind(&self) -> &'static str {
        "conv_transpose3d"
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
        ConvTranspose3d::forward(self, x)
    }

    fn parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = vec![("weight".to_string(), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push(("bias".to_string(), bias.clone()));
        }
        params
    }
}

impl Module for ConvTranspose3d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        ConvTranspose3d::forward(self, x).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}
