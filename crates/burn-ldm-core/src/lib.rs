//! Core Building Blocks for Latent Diffusion Models
//!
//! This crate provides the layers shared by the transformer blocks of the
//! denoising backbone and by the VAE.
//!
//! # Modules
//!
//! - [`attention`] - Scaled dot-product attention over heads folded into the batch axis,
//!   with an optional sliced (memory-bounded) evaluation
//! - [`glu`] - GeGLU gated projection and the feed-forward sublayer
//! - [`layernorm`] - Layer normalization
//! - [`groupnorm`] - Group normalization (used in VAE and spatial transformers)
//! - [`error`] - Shape and configuration errors
//!
//! # Example
//!
//! ```ignore
//! use burn_ldm_core::glu::FeedForwardConfig;
//!
//! let ff = FeedForwardConfig::new(320).init::<Backend>(&device)?;
//! let y = ff.forward(x)?; // [batch, seq, 320]
//! ```

pub mod attention;
pub mod error;
pub mod glu;
pub mod groupnorm;
pub mod layernorm;

pub use error::{LdmError, Result};
