//! VAE Encoder: image -> latent distribution parameters
//!
//! Encodes images to the moments (mean and log-variance) of a diagonal
//! Gaussian over the latent space.

use burn::nn::conv::Conv2d;
use burn::prelude::*;
use burn::tensor::activation::silu;

use burn_ldm_core::error::{LdmError, Result, check_dim, ensure_positive};
use burn_ldm_core::groupnorm::GroupNorm;

use crate::blocks::{Downsample, MidAttention, MidBlock, ResnetBlock, VAE_NORM_EPS, VaeBlock, conv3x3};

/// VAE Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Input image channels (typically 3 for RGB)
    pub in_channels: usize,
    /// Latent channels (4 for SD)
    pub latent_channels: usize,
    /// Output channels of each resolution level, highest resolution first
    pub block_out_channels: Vec<usize>,
    /// Number of resnet blocks per encoder block
    pub layers_per_block: usize,
    /// Groups of every group norm
    pub norm_num_groups: usize,
    /// Emit mean and log-variance (`2 * latent_channels` outputs)
    pub double_z: bool,
    /// Bottleneck attention
    pub mid_attention: MidAttention,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            latent_channels: 4,
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            norm_num_groups: 32,
            double_z: true,
            mid_attention: MidAttention::Disabled,
        }
    }
}

impl EncoderConfig {
    /// SD 1.x VAE encoder config
    pub fn sd1x() -> Self {
        Self::default()
    }

    /// Output channels of the final convolution
    pub fn out_channels(&self) -> usize {
        if self.double_z {
            2 * self.latent_channels
        } else {
            self.latent_channels
        }
    }

    /// Number of 2x downsampling stages
    pub fn num_downsamples(&self) -> usize {
        self.block_out_channels.len().saturating_sub(1)
    }

    /// Checks the config without allocating anything
    pub fn validate(&self) -> Result<()> {
        ensure_positive("in_channels", self.in_channels)?;
        ensure_positive("latent_channels", self.latent_channels)?;
        ensure_positive("layers_per_block", self.layers_per_block)?;
        ensure_positive("norm_num_groups", self.norm_num_groups)?;
        validate_block_out_channels(&self.block_out_channels)
    }

    /// Initializes the encoder
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Encoder<B>> {
        Encoder::new(self, device)
    }
}

pub(crate) fn validate_block_out_channels(channels: &[usize]) -> Result<()> {
    if channels.is_empty() {
        return Err(LdmError::Config("block_out_channels must not be empty".into()));
    }
    channels
        .iter()
        .try_for_each(|&ch| ensure_positive("block_out_channels entry", ch))
}

/// VAE Encoder
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    pub conv_in: Conv2d<B>,
    pub down_blocks: Vec<EncoderBlock<B>>,
    pub mid_block: MidBlock<B>,
    pub conv_norm_out: GroupNorm<B>,
    pub conv_out: Conv2d<B>,
    pub in_channels: usize,
}

impl<B: Backend> Encoder<B> {
    /// Creates a new VAE encoder
    ///
    /// # Arguments
    ///
    /// * `config` - Encoder configuration
    /// * `device` - Device to create tensors on
    pub fn new(config: &EncoderConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let channels = &config.block_out_channels;
        let groups = config.norm_num_groups;

        // Input conv: in_channels -> first level width
        let conv_in = conv3x3(config.in_channels, channels[0], device);

        let mut down_blocks = Vec::with_capacity(channels.len());
        let mut in_ch = channels[0];

        for (i, &out_ch) in channels.iter().enumerate() {
            let downsample = i + 1 < channels.len(); // Don't downsample on last block

            down_blocks.push(EncoderBlock::new(
                in_ch,
                out_ch,
                config.layers_per_block,
                downsample,
                groups,
                device,
            )?);
            in_ch = out_ch;
        }

        let mid_block = MidBlock::new(in_ch, config.mid_attention, groups, device)?;

        let conv_norm_out = GroupNorm::new(groups, in_ch, VAE_NORM_EPS, device)?;
        let conv_out = conv3x3(in_ch, config.out_channels(), device);

        log::debug!(
            "Encoder: {} -> {:?} -> {} channels, {} downsamples, mid attention {:?}",
            config.in_channels,
            channels,
            config.out_channels(),
            config.num_downsamples(),
            config.mid_attention
        );

        Ok(Self {
            conv_in,
            down_blocks,
            mid_block,
            conv_norm_out,
            conv_out,
            in_channels: config.in_channels,
        })
    }

    /// Encode image to latent distribution parameters
    ///
    /// Input: `[batch, in_channels, h, w]` image (values in [-1, 1])
    /// Output: `[batch, out_channels, h / 2^k, w / 2^k]` with `k` downsampling stages
    ///
    /// Fails with a shape mismatch when the channels differ from `in_channels`
    /// or when a downsampling stage would see a map smaller than 2x2.
    pub fn forward(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [_, channels, height, width] = x.dims();
        check_dim("Encoder input channels", self.in_channels, channels)?;
        self.check_resolution(height, width)?;

        let h = self.conv_in.forward(x);

        let h = self
            .down_blocks
            .iter()
            .enumerate()
            .fold(h, |h, (i, block)| {
                log::trace!("encoder down_block {i}: {:?}", h.dims());
                block.forward(h)
            });

        let h = self.mid_block.forward(h);

        let h = self.conv_norm_out.forward(h);
        let h = silu(h);
        Ok(self.conv_out.forward(h))
    }
}

impl<B: Backend> Encoder<B> {
    /// Walks the input size through every downsampling stage (`floor(n / 2)`)
    fn check_resolution(&self, height: usize, width: usize) -> Result<()> {
        let too_small = || {
            LdmError::shape(
                "Encoder input spatial",
                "at least 1x1, and 2x2 at every downsampling stage",
                [height, width],
            )
        };
        if height == 0 || width == 0 {
            return Err(too_small());
        }

        let mut downsamples = self.down_blocks.iter().filter(|b| b.downsample.is_some());
        downsamples.try_fold([height, width], |[h, w], _| {
            if h < 2 || w < 2 {
                Err(too_small())
            } else {
                Ok([h / 2, w / 2])
            }
        })?;
        Ok(())
    }
}

/// Encoder block with optional downsampling
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub resnets: Vec<ResnetBlock<B>>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> EncoderBlock<B> {
    /// Creates a new encoder block with optional downsampling
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        downsample: bool,
        num_groups: usize,
        device: &B::Device,
    ) -> Result<Self> {
        // First block handles channel change, the rest keep the width
        let resnets = (0..num_layers)
            .map(|i| {
                let in_ch = if i == 0 { in_channels } else { out_channels };
                ResnetBlock::new(in_ch, out_channels, num_groups, device)
            })
            .collect::<Result<Vec<_>>>()?;

        let downsample = downsample.then(|| Downsample::new(out_channels, device));

        Ok(Self { resnets, downsample })
    }
}

impl<B: Backend> VaeBlock<B> for EncoderBlock<B> {
    /// Residual blocks, then optional downsampling
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.resnets.iter().fold(x, |x, block| block.forward(x));

        match &self.downsample {
            Some(ds) => ds.forward(x),
            None => x,
        }
    }
}
