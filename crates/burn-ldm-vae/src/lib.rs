//! Variational Autoencoder (VAE) for Latent Diffusion
//!
//! This crate provides the convolutional VAE used to move between pixel
//! space and latent space.
//!
//! # Components
//!
//! - [`Encoder`] - Compresses images to latent distribution moments
//! - [`Decoder`] - Reconstructs images from latents
//! - [`AutoEncoderKl`] - Both halves plus the 1x1 quant convolutions,
//!   returning a [`DiagonalGaussian`] from `encode`
//!
//! # Scaling Factors
//!
//! Different models use different latent scaling:
//! - SD 1.x: `0.18215`
//! - SDXL: `0.13025`
//!
//! Use [`scaling`] constants for correct scaling.
//!
//! # Example
//!
//! ```ignore
//! use burn_ldm_vae::{AutoEncoderKlConfig, scaling};
//!
//! let vae = AutoEncoderKlConfig::sd1x().init::<Backend>(&device)?;
//!
//! let latents = vae.encode(image)?.mode();
//! let image = vae.decode(latents)?;
//! ```

pub mod autoencoder;
pub mod blocks;
pub mod decoder;
pub mod encoder;

pub use autoencoder::{AutoEncoderKl, AutoEncoderKlConfig, DiagonalGaussian, scaling};
pub use blocks::{
    AttentionBlock, Downsample, MidAttention, MidBlock, ResnetBlock, Upsample, VaeBlock,
};
pub use decoder::{Decoder, DecoderBlock, DecoderConfig};
pub use encoder::{Encoder, EncoderBlock, EncoderConfig};
