//! Transformer Blocks of the Latent Diffusion Backbone
//!
//! The attention half of the denoising network: multi-head cross-attention,
//! the pre-norm transformer block built from it, and the spatial transformer
//! that runs those blocks over the pixels of a feature map.
//!
//! # Building Blocks
//!
//! - [`CrossAttention`] - Self- or cross-attention with optional sliced evaluation
//! - [`TransformerBlock`] - Self-attention, cross-attention and GeGLU feed-forward,
//!   each pre-normalized and residual
//! - [`SpatialTransformer`] - Feature map to sequence, transformer stack, and back
//!
//! # Example
//!
//! ```ignore
//! use burn_ldm_unet::TransformerBlockConfig;
//!
//! let block = TransformerBlockConfig::new(320, 8, 40)
//!     .with_context_dim(Some(768))
//!     .with_slice_size(Some(4))
//!     .init::<Backend>(&device)?;
//!
//! let hidden = block.forward(hidden, Some(text_embeddings))?;
//! ```

pub mod blocks;

pub use blocks::{
    CrossAttention, CrossAttentionConfig, SpatialTransformer, SpatialTransformerConfig,
    TransformerBlock, TransformerBlockConfig,
};
