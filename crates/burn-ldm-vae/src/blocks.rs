//! VAE building blocks: resnet blocks, resampling, bottleneck attention
//!
//! Every block maps a `[batch, channels, height, width]` feature map to
//! another one and is driven through the [`VaeBlock`] trait, so the encoder
//! and decoder are plain folds over their block lists.

use burn::nn::{
    Linear, LinearConfig, PaddingConfig2d,
    conv::{Conv2d, Conv2dConfig},
};
use burn::prelude::*;
use burn::tensor::activation::silu;

use burn_ldm_core::attention::{batch_to_heads, heads_to_batch, scaled_dot_product};
use burn_ldm_core::error::{LdmError, Result, ensure_divisible, ensure_positive};
use burn_ldm_core::groupnorm::GroupNorm;

/// Epsilon of every group norm inside the VAE
pub const VAE_NORM_EPS: f64 = 1e-6;

/// A feature-map to feature-map stage of the encoder or decoder
///
/// Blocks do not validate their input. [`Encoder`](crate::Encoder) and
/// [`Decoder`](crate::Decoder) check channels and resolution up front, so a
/// block driven directly must be given a feature map of its configured width.
pub trait VaeBlock<B: Backend> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// 3x3 convolution with padding 1
pub(crate) fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// Resnet block with skip connection
///
/// Expects `in_channels` input channels; the width is not checked here.
#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    pub norm1: GroupNorm<B>,
    pub conv1: Conv2d<B>,
    pub norm2: GroupNorm<B>,
    pub conv2: Conv2d<B>,
    /// 1x1 projection of the skip path when the channel count changes
    pub conv_shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ResnetBlock<B> {
    /// Creates a new resnet block with optional skip projection
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        num_groups: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let norm1 = GroupNorm::new(num_groups, in_channels, VAE_NORM_EPS, device)?;
        let conv1 = conv3x3(in_channels, out_channels, device);

        let norm2 = GroupNorm::new(num_groups, out_channels, VAE_NORM_EPS, device)?;
        let conv2 = conv3x3(out_channels, out_channels, device);

        let conv_shortcut = if in_channels != out_channels {
            Some(Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device))
        } else {
            None
        };

        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            conv_shortcut,
        })
    }
}

impl<B: Backend> VaeBlock<B> for ResnetBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.conv_shortcut {
            Some(conv) => conv.forward(x.clone()),
            None => x.clone(),
        };

        let h = self.norm1.forward(x);
        let h = silu(h);
        let h = self.conv1.forward(h);

        let h = self.norm2.forward(h);
        let h = silu(h);
        let h = self.conv2.forward(h);

        h + residual
    }
}

/// 2x Downsampling with strided conv
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> Downsample<B> {
    /// Creates a new 2x downsampling layer
    pub fn new(channels: usize, device: &B::Device) -> Self {
        // Padding is applied by hand in forward (right and bottom only)
        let conv = Conv2dConfig::new([channels, channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(0, 0))
            .init(device);

        Self { conv }
    }
}

impl<B: Backend> VaeBlock<B> for Downsample<B> {
    /// Needs `height, width >= 2`; [`Encoder`](crate::Encoder) checks this before running
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        // Zero pad one column at the right and one row at the bottom
        let padded = x.pad((0, 1, 0, 1), 0.0);

        self.conv.forward(padded)
    }
}

/// 2x Upsampling with conv
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> Upsample<B> {
    /// Creates a new 2x upsampling layer
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv: conv3x3(channels, channels, device),
        }
    }
}

impl<B: Backend> VaeBlock<B> for Upsample<B> {
    /// Nearest neighbor 2x upsample followed by a 3x3 convolution
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();

        let x = x.reshape([b, c, h, 1, w, 1]);
        let x = x.repeat_dim(3, 2).repeat_dim(5, 2);
        let x = x.reshape([b, c, h * 2, w * 2]);

        self.conv.forward(x)
    }
}

/// Self-attention over the pixels of the bottleneck feature map
///
/// Expects `channels` input channels; the width is not checked here.
#[derive(Module, Debug)]
pub struct AttentionBlock<B: Backend> {
    pub group_norm: GroupNorm<B>,
    pub query: Linear<B>,
    pub key: Linear<B>,
    pub value: Linear<B>,
    pub proj_attn: Linear<B>,
    pub heads: usize,
    /// The residual sum is divided by this factor
    pub rescale_output_factor: f64,
}

impl<B: Backend> AttentionBlock<B> {
    /// Creates the attention block
    ///
    /// `num_head_channels` splits the channels into heads of that width;
    /// `None` means a single head over all channels.
    pub fn new(
        channels: usize,
        num_head_channels: Option<usize>,
        num_groups: usize,
        device: &B::Device,
    ) -> Result<Self> {
        ensure_positive("attention channels", channels)?;
        let heads = match num_head_channels {
            Some(head_channels) => {
                ensure_divisible("attention channels", channels, "num_head_channels", head_channels)?;
                channels / head_channels
            }
            None => 1,
        };

        Ok(Self {
            group_norm: GroupNorm::new(num_groups, channels, VAE_NORM_EPS, device)?,
            query: LinearConfig::new(channels, channels).init(device),
            key: LinearConfig::new(channels, channels).init(device),
            value: LinearConfig::new(channels, channels).init(device),
            proj_attn: LinearConfig::new(channels, channels).init(device),
            heads,
            rescale_output_factor: 1.0,
        })
    }

    /// Divide the residual sum by `factor` (1.0 leaves it unchanged)
    pub fn with_rescale_output_factor(mut self, factor: f64) -> Result<Self> {
        if !(factor.is_finite() && factor > 0.0) {
            return Err(LdmError::Config(format!(
                "rescale_output_factor must be positive, got {factor}"
            )));
        }
        self.rescale_output_factor = factor;
        Ok(self)
    }
}

impl<B: Backend> VaeBlock<B> for AttentionBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let residual = x.clone();

        // [b, c, h, w] -> [b, h*w, c]
        let x = self.group_norm.forward(x);
        let x = x.reshape([b, c, h * w]).swap_dims(1, 2);

        let q = heads_to_batch(self.query.forward(x.clone()), self.heads);
        let k = heads_to_batch(self.key.forward(x.clone()), self.heads);
        let v = heads_to_batch(self.value.forward(x), self.heads);

        let scale = ((c / self.heads) as f64).powf(-0.5);
        let out = batch_to_heads(scaled_dot_product(q, k, v, scale), self.heads);
        let out = self.proj_attn.forward(out);

        // [b, h*w, c] -> [b, c, h, w]
        let out = out.swap_dims(1, 2).reshape([b, c, h, w]);

        (out + residual) / self.rescale_output_factor
    }
}

/// Whether the bottleneck carries an attention layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidAttention {
    /// Two resnet blocks back to back
    Disabled,
    /// Resnet, attention, resnet
    Enabled {
        /// Channels per attention head, `None` for a single head
        num_head_channels: Option<usize>,
    },
}

/// Bottleneck block at the lowest resolution
///
/// Expects `channels` input channels; the width is not checked here.
#[derive(Module, Debug)]
pub struct MidBlock<B: Backend> {
    pub resnet_in: ResnetBlock<B>,
    pub attention: Option<AttentionBlock<B>>,
    pub resnet_out: ResnetBlock<B>,
}

impl<B: Backend> MidBlock<B> {
    pub fn new(
        channels: usize,
        attention: MidAttention,
        num_groups: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let attention = match attention {
            MidAttention::Disabled => None,
            MidAttention::Enabled { num_head_channels } => Some(AttentionBlock::new(
                channels,
                num_head_channels,
                num_groups,
                device,
            )?),
        };

        Ok(Self {
            resnet_in: ResnetBlock::new(channels, channels, num_groups, device)?,
            attention,
            resnet_out: ResnetBlock::new(channels, channels, num_groups, device)?,
        })
    }
}

impl<B: Backend> VaeBlock<B> for MidBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.resnet_in.forward(x);
        let x = match &self.attention {
            Some(attention) => attention.forward(x),
            None => x,
        };
        self.resnet_out.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::Param;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn random(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn test_resnet_block_channel_change() {
        let device = Default::default();
        let same = ResnetBlock::<TestBackend>::new(8, 8, 4, &device).unwrap();
        assert!(same.conv_shortcut.is_none());

        let wider = ResnetBlock::<TestBackend>::new(8, 16, 4, &device).unwrap();
        assert!(wider.conv_shortcut.is_some());
        assert_eq!(wider.forward(random([1, 8, 4, 4])).dims(), [1, 16, 4, 4]);
    }

    #[test]
    fn test_resnet_block_rejects_bad_groups() {
        let device = Default::default();
        assert!(ResnetBlock::<TestBackend>::new(8, 12, 8, &device).is_err());
    }

    #[test]
    fn test_downsample_halves_even_and_odd() {
        let device = Default::default();
        let down = Downsample::<TestBackend>::new(4, &device);

        assert_eq!(down.forward(random([2, 4, 8, 6])).dims(), [2, 4, 4, 3]);
        assert_eq!(down.forward(random([1, 4, 7, 5])).dims(), [1, 4, 3, 2]);
    }

    #[test]
    fn test_downsample_pads_with_zeros() {
        let device = Default::default();
        let mut down = Downsample::<TestBackend>::new(1, &device);
        // all-ones kernel sums the 3x3 window
        down.conv.weight = Param::from_tensor(Tensor::ones([1, 1, 3, 3], &device));
        down.conv.bias = down.conv.bias.map(|b| Param::from_tensor(b.val().zeros_like()));

        // a 2x2 map padded to 3x3 gives one window over 4 ones and 5 zeros
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let y: Vec<f32> = down.forward(x).into_data().to_vec().unwrap();
        assert_eq!(y, vec![4.0]);
    }

    #[test]
    fn test_upsample_nearest_layout() {
        let device = Default::default();
        let mut up = Upsample::<TestBackend>::new(1, &device);
        // identity 3x3 kernel: only the center tap is one
        let mut kernel = [0.0f32; 9];
        kernel[4] = 1.0;
        up.conv.weight = Param::from_tensor(Tensor::<TestBackend, 1>::from_floats(kernel, &device).reshape([1, 1, 3, 3]));
        up.conv.bias = up.conv.bias.map(|b| Param::from_tensor(b.val().zeros_like()));

        let x = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0], &device).reshape([1, 1, 2, 2]);
        let y: Vec<f32> = up.forward(x).into_data().to_vec().unwrap();

        assert_eq!(
            y,
            vec![
                1.0, 1.0, 2.0, 2.0, //
                1.0, 1.0, 2.0, 2.0, //
                3.0, 3.0, 4.0, 4.0, //
                3.0, 3.0, 4.0, 4.0,
            ]
        );
    }

    #[test]
    fn test_attention_block_heads() {
        let device = Default::default();
        let single = AttentionBlock::<TestBackend>::new(8, None, 4, &device).unwrap();
        assert_eq!(single.heads, 1);

        let multi = AttentionBlock::<TestBackend>::new(8, Some(2), 4, &device).unwrap();
        assert_eq!(multi.heads, 4);
        assert_eq!(multi.forward(random([2, 8, 3, 3])).dims(), [2, 8, 3, 3]);

        assert!(AttentionBlock::<TestBackend>::new(8, Some(3), 4, &device).is_err());
    }

    #[test]
    fn test_attention_block_rescale_output_factor() {
        let device = Default::default();
        let block = AttentionBlock::<TestBackend>::new(8, None, 4, &device).unwrap();
        let halved = block.clone().with_rescale_output_factor(2.0).unwrap();
        assert_eq!(halved.rescale_output_factor, 2.0);

        let x = random([1, 8, 3, 3]);
        let full: Vec<f32> = block.forward(x.clone()).into_data().to_vec().unwrap();
        let half: Vec<f32> = halved.forward(x).into_data().to_vec().unwrap();
        for (f, h) in full.iter().zip(half.iter()) {
            assert!((f / 2.0 - h).abs() <= 1e-6 * (1.0 + f.abs()));
        }

        assert!(block.clone().with_rescale_output_factor(0.0).is_err());
        assert!(block.with_rescale_output_factor(f64::NAN).is_err());
    }

    #[test]
    fn test_mid_block_variants() {
        let device = Default::default();
        let plain = MidBlock::<TestBackend>::new(8, MidAttention::Disabled, 4, &device).unwrap();
        assert!(plain.attention.is_none());

        let attn = MidBlock::<TestBackend>::new(
            8,
            MidAttention::Enabled {
                num_head_channels: None,
            },
            4,
            &device,
        )
        .unwrap();
        assert!(attn.attention.is_some());
        assert_eq!(attn.forward(random([1, 8, 4, 4])).dims(), [1, 8, 4, 4]);
    }
}
