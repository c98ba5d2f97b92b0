//! VAE Decoder: latent -> image
//!
//! Mirror of the encoder: the resolution levels are walked in reverse and
//! every up block carries one more resnet than the matching down block.

use burn::nn::conv::Conv2d;
use burn::prelude::*;
use burn::tensor::activation::silu;

use burn_ldm_core::error::{Result, check_dim, ensure_positive};
use burn_ldm_core::groupnorm::GroupNorm;

use crate::blocks::{MidAttention, MidBlock, ResnetBlock, Upsample, VAE_NORM_EPS, VaeBlock, conv3x3};
use crate::encoder::validate_block_out_channels;

/// VAE Decoder configuration
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Input latent channels (typically 4)
    pub latent_channels: usize,
    /// Output image channels (typically 3 for RGB)
    pub out_channels: usize,
    /// Output channels of each resolution level, highest resolution first
    /// (same order as the encoder)
    pub block_out_channels: Vec<usize>,
    /// Resnet count of the matching encoder block; up blocks use one more
    pub layers_per_block: usize,
    /// Groups of every group norm
    pub norm_num_groups: usize,
    /// Bottleneck attention
    pub mid_attention: MidAttention,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            latent_channels: 4,
            out_channels: 3,
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            norm_num_groups: 32,
            mid_attention: MidAttention::Enabled {
                num_head_channels: None,
            },
        }
    }
}

impl DecoderConfig {
    /// SD 1.x VAE decoder config
    pub fn sd1x() -> Self {
        Self::default()
    }

    /// Number of 2x upsampling stages
    pub fn num_upsamples(&self) -> usize {
        self.block_out_channels.len().saturating_sub(1)
    }

    /// Checks the config without allocating anything
    pub fn validate(&self) -> Result<()> {
        ensure_positive("latent_channels", self.latent_channels)?;
        ensure_positive("out_channels", self.out_channels)?;
        ensure_positive("layers_per_block", self.layers_per_block)?;
        ensure_positive("norm_num_groups", self.norm_num_groups)?;
        validate_block_out_channels(&self.block_out_channels)
    }

    /// Initializes the decoder
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Decoder<B>> {
        Decoder::new(self, device)
    }
}

/// VAE Decoder
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    pub conv_in: Conv2d<B>,
    pub mid_block: MidBlock<B>,
    pub up_blocks: Vec<DecoderBlock<B>>,
    pub conv_norm_out: GroupNorm<B>,
    pub conv_out: Conv2d<B>,
    pub latent_channels: usize,
}

impl<B: Backend> Decoder<B> {
    /// Creates a new VAE decoder
    ///
    /// # Arguments
    ///
    /// * `config` - Decoder configuration
    /// * `device` - Device to create tensors on
    pub fn new(config: &DecoderConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let groups = config.norm_num_groups;
        let reversed: Vec<usize> = config.block_out_channels.iter().rev().copied().collect();

        // Start with highest channel count (reversed from encoder)
        let block_in = reversed[0];

        let conv_in = conv3x3(config.latent_channels, block_in, device);
        let mid_block = MidBlock::new(block_in, config.mid_attention, groups, device)?;

        let mut up_blocks = Vec::with_capacity(reversed.len());
        let mut in_ch = block_in;

        for (i, &out_ch) in reversed.iter().enumerate() {
            let upsample = i + 1 < reversed.len(); // Don't upsample on last block

            up_blocks.push(DecoderBlock::new(
                in_ch,
                out_ch,
                config.layers_per_block + 1,
                upsample,
                groups,
                device,
            )?);
            in_ch = out_ch;
        }

        let conv_norm_out = GroupNorm::new(groups, in_ch, VAE_NORM_EPS, device)?;
        let conv_out = conv3x3(in_ch, config.out_channels, device);

        log::debug!(
            "Decoder: {} -> {:?} -> {} channels, {} upsamples, mid attention {:?}",
            config.latent_channels,
            reversed,
            config.out_channels,
            config.num_upsamples(),
            config.mid_attention
        );

        Ok(Self {
            conv_in,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            latent_channels: config.latent_channels,
        })
    }

    /// Decode latent to image
    ///
    /// Input: `[batch, latent_channels, h, w]` latent (already unscaled)
    /// Output: `[batch, out_channels, h * 2^k, w * 2^k]` with `k` upsampling stages
    pub fn forward(&self, z: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        check_dim("Decoder latent channels", self.latent_channels, z.dims()[1])?;

        let h = self.conv_in.forward(z);
        let h = self.mid_block.forward(h);

        let h = self.up_blocks.iter().enumerate().fold(h, |h, (i, block)| {
            log::trace!("decoder up_block {i}: {:?}", h.dims());
            block.forward(h)
        });

        let h = self.conv_norm_out.forward(h);
        let h = silu(h);
        Ok(self.conv_out.forward(h))
    }
}

/// Decoder block with optional upsampling
#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub resnets: Vec<ResnetBlock<B>>,
    pub upsample: Option<Upsample<B>>,
}

impl<B: Backend> DecoderBlock<B> {
    /// Creates a new decoder block with optional upsampling
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        upsample: bool,
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

        let upsample = upsample.then(|| Upsample::new(out_channels, device));

        Ok(Self { resnets, upsample })
    }
}

impl<B: Backend> VaeBlock<B> for DecoderBlock<B> {
    /// Residual blocks, then optional upsampling
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.resnets.iter().fold(x, |x, block| block.forward(x));

        match &self.upsample {
            Some(up) => up.forward(x),
            None => x,
        }
    }
}
