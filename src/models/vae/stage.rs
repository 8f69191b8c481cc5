//! Stage interface shared by every block of the volumetric decoder
//!
//! Each stage declares the shape it will produce for a given input shape, so
//! the decoder can check every step against an explicit contract instead of
//! trusting whatever the tensor engine broadcasts.

use anyhow::{bail, Result};
use candle_core::Tensor;
use std::fmt;

/// Shape of a volumetric tensor: `[batch, channels, depth, height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VolumeShape {
    pub batch: usize,
    pub channels: usize,
    pub depth: usize,
    pub height: usize,
    pub width: usize,
}

impl VolumeShape {
    pub fn new(batch: usize, channels: usize, depth: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            depth,
            height,
            width,
        }
    }

    /// Read the shape of a rank-5 tensor.
    pub fn of(x: &Tensor) -> Result<Self> {
        let dims = x.dims();
        if dims.len() != 5 {
            bail!(
                "expected a 5D [batch, channels, depth, height, width] tensor, got shape {:?}",
                dims
            );
        }
        Ok(Self::new(dims[0], dims[1], dims[2], dims[3], dims[4]))
    }

    /// Same spatial extent with a different channel count.
    pub fn with_channels(self, channels: usize) -> Self {
        Self { channels, ..self }
    }

    /// Number of voxels per channel (`depth * height * width`).
    pub fn voxels(&self) -> usize {
        self.depth * self.height * self.width
    }

    pub fn dims(&self) -> [usize; 5] {
        [
            self.batch,
            self.channels,
            self.depth,
            self.height,
            self.width,
        ]
    }

    /// Fail unless the channel axis matches what a stage was built for.
    pub fn expect_channels(&self, expected: usize, stage: &str) -> Result<()> {
        if self.channels != expected {
            bail!(
                "{stage}: expected {expected} input channels, got {} (input shape {self})",
                self.channels
            );
        }
        Ok(())
    }
}

impl fmt::Display for VolumeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}, {}]",
            self.batch, self.channels, self.depth, self.height, self.width
        )
    }
}

impl From<[usize; 5]> for VolumeShape {
    fn from(d: [usize; 5]) -> Self {
        Self::new(d[0], d[1], d[2], d[3], d[4])
    }
}

/// One step of the decoder pipeline.
///
/// Stages are immutable after construction: `forward` reads the learned
/// parameters but never mutates them, so a stage can be shared across threads
/// and called any number of times.
pub trait DecoderStage: Send + Sync {
    /// Kind of block, used in logs and error messages.
    fn kind(&self) -> &'static str;

    /// Shape this stage produces for `input`, or an error when `input` does
    /// not satisfy the stage's construction parameters.
    fn output_shape(&self, input: VolumeShape) -> Result<VolumeShape>;

    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Learned tensors owned by this stage, keyed relative to the stage.
    fn parameters(&self) -> Vec<(String, Tensor)>;
}

/// Prefix each parameter name with `prefix.`.
pub(crate) fn prefixed(prefix: &str, params: Vec<(String, Tensor)>) -> Vec<(String, Tensor)> {
    params
        .into_iter()
        .map(|(name, t)| (format!("{prefix}.{name}"), t))
        .collect()
}
