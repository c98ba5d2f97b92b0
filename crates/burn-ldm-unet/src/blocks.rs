//! Transformer building blocks: cross-attention, transformer block, spatial transformer

use burn::nn::{
    Linear, LinearConfig,
    conv::{Conv2d, Conv2dConfig},
};
use burn::prelude::*;

use burn_ldm_core::attention::{AttentionStrategy, batch_to_heads, heads_to_batch};
use burn_ldm_core::error::{Result, check_dim, ensure_divisible, ensure_positive};
use burn_ldm_core::glu::{FeedForward, FeedForwardConfig};
use burn_ldm_core::groupnorm::GroupNorm;
use burn_ldm_core::layernorm::LayerNorm;

fn ensure_slice_size(slice_size: Option<usize>) -> Result<()> {
    match slice_size {
        Some(size) => ensure_positive("slice_size", size),
        None => Ok(()),
    }
}

/// Configuration for [`CrossAttention`]
#[derive(Debug, Clone)]
pub struct CrossAttentionConfig {
    /// Width of the query input
    pub query_dim: usize,
    /// Width of the key/value context, `None` means self-attention width
    pub context_dim: Option<usize>,
    /// Number of attention heads
    pub heads: usize,
    /// Width of each head
    pub dim_head: usize,
    /// Rows of the folded batch processed at once, `None` disables slicing
    pub slice_size: Option<usize>,
}

impl CrossAttentionConfig {
    /// Self-attention config with `heads * dim_head` inner width
    pub fn new(query_dim: usize, heads: usize, dim_head: usize) -> Self {
        Self {
            query_dim,
            context_dim: None,
            heads,
            dim_head,
            slice_size: None,
        }
    }

    /// Config from a total inner width, which must split evenly over `heads`
    pub fn from_inner_dim(query_dim: usize, inner_dim: usize, heads: usize) -> Result<Self> {
        ensure_positive("heads", heads)?;
        ensure_positive("inner_dim", inner_dim)?;
        ensure_divisible("inner_dim", inner_dim, "heads", heads)?;
        Ok(Self::new(query_dim, heads, inner_dim / heads))
    }

    pub fn with_context_dim(mut self, context_dim: Option<usize>) -> Self {
        self.context_dim = context_dim;
        self
    }

    pub fn with_slice_size(mut self, slice_size: Option<usize>) -> Self {
        self.slice_size = slice_size;
        self
    }

    pub fn inner_dim(&self) -> usize {
        self.heads * self.dim_head
    }

    /// Initializes the attention module
    ///
    /// `to_q`, `to_k` and `to_v` carry no bias, `to_out` does.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CrossAttention<B>> {
        ensure_positive("query_dim", self.query_dim)?;
        ensure_positive("heads", self.heads)?;
        ensure_positive("dim_head", self.dim_head)?;
        ensure_slice_size(self.slice_size)?;
        let context_dim = self.context_dim.unwrap_or(self.query_dim);
        ensure_positive("context_dim", context_dim)?;

        let inner_dim = self.inner_dim();
        log::debug!(
            "CrossAttention: query_dim={}, context_dim={}, heads={}, dim_head={}, slice_size={:?}",
            self.query_dim,
            context_dim,
            self.heads,
            self.dim_head,
            self.slice_size
        );

        Ok(CrossAttention {
            to_q: LinearConfig::new(self.query_dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_k: LinearConfig::new(context_dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_v: LinearConfig::new(context_dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_out: LinearConfig::new(inner_dim, self.query_dim).init(device),
            query_dim: self.query_dim,
            context_dim,
            heads: self.heads,
            dim_head: self.dim_head,
            scale: (self.dim_head as f64).powf(-0.5),
            slice_size: self.slice_size,
        })
    }
}

/// Cross-attention (or self-attention if context is None)
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    /// Query projection
    pub to_q: Linear<B>,
    /// Key projection
    pub to_k: Linear<B>,
    /// Value projection
    pub to_v: Linear<B>,
    /// Output projection
    pub to_out: Linear<B>,
    pub query_dim: usize,
    pub context_dim: usize,
    /// Number of attention heads
    pub heads: usize,
    /// Dimension per head
    pub dim_head: usize,
    /// `1 / sqrt(dim_head)`
    pub scale: f64,
    pub slice_size: Option<usize>,
}

impl<B: Backend> CrossAttention<B> {
    /// Same parameters, different slicing
    pub fn with_slice_size(mut self, slice_size: Option<usize>) -> Result<Self> {
        ensure_slice_size(slice_size)?;
        self.slice_size = slice_size;
        Ok(self)
    }

    /// Computes multi-head scaled dot-product attention
    ///
    /// # Arguments
    ///
    /// * `x` - Query input of shape `[batch, seq_len, query_dim]`
    /// * `context` - Key/value context `[batch, ctx_len, context_dim]`, `None` attends to `x`
    ///
    /// # Returns
    ///
    /// Attention output of shape `[batch, seq_len, query_dim]`
    pub fn forward(&self, x: Tensor<B, 3>, context: Option<Tensor<B, 3>>) -> Result<Tensor<B, 3>> {
        let [batch, _, width] = x.dims();
        check_dim("CrossAttention query", self.query_dim, width)?;

        let context = match context {
            Some(context) => {
                let [ctx_batch, _, ctx_width] = context.dims();
                check_dim("CrossAttention context batch", batch, ctx_batch)?;
                check_dim("CrossAttention context", self.context_dim, ctx_width)?;
                context
            }
            None => {
                check_dim("CrossAttention context", self.context_dim, width)?;
                x.clone()
            }
        };

        let q = heads_to_batch(self.to_q.forward(x), self.heads);
        let k = heads_to_batch(self.to_k.forward(context.clone()), self.heads);
        let v = heads_to_batch(self.to_v.forward(context), self.heads);

        let strategy = AttentionStrategy::select(self.slice_size, batch * self.heads);
        let out = strategy.attend(q, k, v, self.scale);

        Ok(self.to_out.forward(batch_to_heads(out, self.heads)))
    }
}

/// Configuration for [`TransformerBlock`]
#[derive(Debug, Clone)]
pub struct TransformerBlockConfig {
    /// Model width
    pub dim: usize,
    pub heads: usize,
    pub dim_head: usize,
    /// Width of the cross-attention context, `None` uses `dim`
    pub context_dim: Option<usize>,
    pub slice_size: Option<usize>,
}

impl TransformerBlockConfig {
    pub fn new(dim: usize, heads: usize, dim_head: usize) -> Self {
        Self {
            dim,
            heads,
            dim_head,
            context_dim: None,
            slice_size: None,
        }
    }

    pub fn with_context_dim(mut self, context_dim: Option<usize>) -> Self {
        self.context_dim = context_dim;
        self
    }

    pub fn with_slice_size(mut self, slice_size: Option<usize>) -> Self {
        self.slice_size = slice_size;
        self
    }

    /// Config of the self-attention sublayer
    pub fn self_attention(&self) -> CrossAttentionConfig {
        CrossAttentionConfig::new(self.dim, self.heads, self.dim_head)
            .with_slice_size(self.slice_size)
    }

    /// Config of the cross-attention sublayer
    pub fn cross_attention(&self) -> CrossAttentionConfig {
        self.self_attention().with_context_dim(self.context_dim)
    }

    pub fn feed_forward(&self) -> FeedForwardConfig {
        FeedForwardConfig::new(self.dim)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TransformerBlock<B>> {
        Ok(TransformerBlock {
            norm1: LayerNorm::new(self.dim, device)?,
            attn1: self.self_attention().init(device)?,
            norm2: LayerNorm::new(self.dim, device)?,
            attn2: self.cross_attention().init(device)?,
            norm3: LayerNorm::new(self.dim, device)?,
            ff: self.feed_forward().init(device)?,
        })
    }
}

/// Transformer block with self-attention, cross-attention, and FFN
///
/// Each sublayer sees a pre-normalized copy of the running sequence and its
/// output is added back to the un-normalized input.
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    /// Self-attention layer norm
    pub norm1: LayerNorm<B>,
    /// Self-attention
    pub attn1: CrossAttention<B>,
    /// Cross-attention layer norm
    pub norm2: LayerNorm<B>,
    /// Cross-attention
    pub attn2: CrossAttention<B>,
    /// FFN layer norm
    pub norm3: LayerNorm<B>,
    /// Feed-forward network
    pub ff: FeedForward<B>,
}

impl<B: Backend> TransformerBlock<B> {
    /// Same parameters, different slicing in both attention layers
    pub fn with_slice_size(mut self, slice_size: Option<usize>) -> Result<Self> {
        self.attn1 = self.attn1.with_slice_size(slice_size)?;
        self.attn2 = self.attn2.with_slice_size(slice_size)?;
        Ok(self)
    }

    /// Forward pass through self-attention, cross-attention, and FFN
    ///
    /// # Arguments
    ///
    /// * `x` - Input sequence of shape `[batch, seq_len, dim]`
    /// * `context` - Cross-attention context `[batch, ctx_len, context_dim]`;
    ///   `None` makes the second attention layer attend to the sequence itself
    ///
    /// # Returns
    ///
    /// Output sequence with same shape as input
    pub fn forward(&self, x: Tensor<B, 3>, context: Option<Tensor<B, 3>>) -> Result<Tensor<B, 3>> {
        // attn1 never sees the context
        let x = self.attn1.forward(self.norm1.forward(x.clone()), None)? + x;
        let x = self.attn2.forward(self.norm2.forward(x.clone()), context)? + x;
        Ok(self.ff.forward(self.norm3.forward(x.clone()))? + x)
    }
}

/// Configuration for [`SpatialTransformer`]
#[derive(Debug, Clone)]
pub struct SpatialTransformerConfig {
    /// Channels of the feature map
    pub in_channels: usize,
    pub heads: usize,
    pub dim_head: usize,
    /// Number of stacked transformer blocks
    pub depth: usize,
    pub context_dim: Option<usize>,
    /// Groups of the input group norm
    pub num_groups: usize,
    pub slice_size: Option<usize>,
}

impl SpatialTransformerConfig {
    pub fn new(in_channels: usize, heads: usize, dim_head: usize) -> Self {
        Self {
            in_channels,
            heads,
            dim_head,
            depth: 1,
            context_dim: None,
            num_groups: 32,
            slice_size: None,
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_context_dim(mut self, context_dim: Option<usize>) -> Self {
        self.context_dim = context_dim;
        self
    }

    pub fn with_num_groups(mut self, num_groups: usize) -> Self {
        self.num_groups = num_groups;
        self
    }

    pub fn with_slice_size(mut self, slice_size: Option<usize>) -> Self {
        self.slice_size = slice_size;
        self
    }

    /// Config shared by every transformer block of the stack
    pub fn block(&self) -> TransformerBlockConfig {
        TransformerBlockConfig::new(self.heads * self.dim_head, self.heads, self.dim_head)
            .with_context_dim(self.context_dim)
            .with_slice_size(self.slice_size)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SpatialTransformer<B>> {
        ensure_positive("depth", self.depth)?;
        ensure_positive("heads", self.heads)?;
        ensure_positive("dim_head", self.dim_head)?;
        let inner_dim = self.heads * self.dim_head;

        let norm = GroupNorm::new(self.num_groups, self.in_channels, 1e-6, device)?;
        let proj_in = Conv2dConfig::new([self.in_channels, inner_dim], [1, 1]).init(device);

        let block = self.block();
        let transformer_blocks = (0..self.depth)
            .map(|_| block.init(device))
            .collect::<Result<Vec<_>>>()?;

        let proj_out = Conv2dConfig::new([inner_dim, self.in_channels], [1, 1]).init(device);

        Ok(SpatialTransformer {
            norm,
            proj_in,
            transformer_blocks,
            proj_out,
        })
    }
}

/// Spatial transformer: runs transformer blocks over the pixels of a feature map
#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    /// Input normalization
    pub norm: GroupNorm<B>,
    /// Input projection
    pub proj_in: Conv2d<B>,
    /// Transformer blocks
    pub transformer_blocks: Vec<TransformerBlock<B>>,
    /// Output projection
    pub proj_out: Conv2d<B>,
}

impl<B: Backend> SpatialTransformer<B> {
    /// Same parameters, different slicing in every block
    pub fn with_slice_size(mut self, slice_size: Option<usize>) -> Result<Self> {
        self.transformer_blocks = self
            .transformer_blocks
            .into_iter()
            .map(|block| block.with_slice_size(slice_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(self)
    }

    /// Forward pass with cross-attention to an optional context
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, channels, height, width]`
    /// * `context` - Context of shape `[batch, seq_len, context_dim]`
    ///
    /// # Returns
    ///
    /// Output tensor with same shape as input
    pub fn forward(&self, x: Tensor<B, 4>, context: Option<Tensor<B, 3>>) -> Result<Tensor<B, 4>> {
        let [b, c, h, w] = x.dims();
        check_dim("SpatialTransformer channels", self.norm.num_channels(), c)?;
        let residual = x.clone();

        let x = self.norm.forward(x);
        let x = self.proj_in.forward(x);

        // Reshape to sequence: [b, c, h, w] -> [b, h*w, c]
        let inner_dim = x.dims()[1];
        let x = x.reshape([b, inner_dim, h * w]).swap_dims(1, 2);

        let x = self
            .transformer_blocks
            .iter()
            .try_fold(x, |x, block| block.forward(x, context.clone()))?;

        // Reshape back: [b, h*w, c] -> [b, c, h, w]
        let x = x.swap_dims(1, 2).reshape([b, inner_dim, h, w]);
        let x = self.proj_out.forward(x);

        Ok(x + residual)
    }
}
