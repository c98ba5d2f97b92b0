//! Weight Loading for burn-ldm Modules
//!
//! This crate maps diffusers-style parameter names onto the attention and
//! VAE modules. Reading checkpoint files is left to the caller: any reader
//! that can produce `name -> TensorData` pairs fills a [`TensorStore`].
//!
//! # Weight Loading
//!
//! ```ignore
//! use burn_ldm_convert::{TensorStore, load_autoencoder};
//! use burn_ldm_vae::AutoEncoderKlConfig;
//!
//! let mut store = TensorStore::new();
//! for (name, data) in checkpoint {
//!     store.insert(name, data);
//! }
//!
//! let vae = load_autoencoder::<Backend>(&AutoEncoderKlConfig::sd1x(), &store.root(), &device)?;
//! ```
//!
//! # Naming
//!
//! - attention: `to_q`, `to_k`, `to_v`, `to_out.0`
//! - feed-forward: `ff.net.0.proj`, `ff.net.2`
//! - VAE: `down_blocks.{i}.resnets.{j}`, `down_blocks.{i}.downsamplers.0.conv`,
//!   `up_blocks.{i}.resnets.{j}`, `up_blocks.{i}.upsamplers.0.conv`,
//!   `mid_block.resnets.{0,1}`, `mid_block.attentions.0`

pub mod loader;
pub mod store;

pub use loader::{
    load_attention_block_into, load_autoencoder, load_autoencoder_into, load_conv2d_into,
    load_cross_attention, load_cross_attention_into, load_decoder, load_decoder_into,
    load_encoder, load_encoder_into, load_feed_forward_into, load_geglu_into,
    load_group_norm_into, load_layer_norm_into, load_linear_into, load_mid_block_into,
    load_resnet_into, load_spatial_transformer, load_spatial_transformer_into,
    load_transformer_block, load_transformer_block_into,
};
pub use store::{LoadError, TensorStore, VarPath};
