//! Diffusers-named weight loading for the attention and VAE modules
//!
//! Every module is first built from its config, so all shapes come from the
//! config, then its parameters are overwritten from the store. The names
//! follow the HuggingFace diffusers layout (`to_q`, `to_out.0`,
//! `ff.net.0.proj`, `down_blocks.0.resnets.1`, ...).
//!
//! PyTorch stores linear weights as `[out_features, in_features]` while burn
//! keeps `[in_features, out_features]`, so linear weights are transposed on
//! load. Convolution weights share the `[out, in, kh, kw]` layout and are
//! copied as is.

use burn::module::Param;
use burn::nn::Linear;
use burn::nn::conv::Conv2d;
use burn::prelude::*;

use burn_ldm_core::glu::{FeedForward, GeGlu};
use burn_ldm_core::groupnorm::GroupNorm;
use burn_ldm_core::layernorm::LayerNorm;
use burn_ldm_unet::{
    CrossAttention, CrossAttentionConfig, SpatialTransformer, SpatialTransformerConfig,
    TransformerBlock, TransformerBlockConfig,
};
use burn_ldm_vae::{
    AttentionBlock, AutoEncoderKl, AutoEncoderKlConfig, Decoder, DecoderConfig, Encoder,
    EncoderConfig, MidBlock, ResnetBlock,
};

use crate::store::{LoadError, VarPath};

// Primitive layers

/// Overwrite a Linear from `weight` (`[out, in]`) and, if the layer has one, `bias`
pub fn load_linear_into<B: Backend>(
    linear: &mut Linear<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    let [d_in, d_out] = linear.weight.val().dims();

    let weight: Tensor<B, 2> = path.get("weight", [d_out, d_in], device)?;
    linear.weight = Param::from_tensor(weight.transpose());

    if linear.bias.is_some() {
        let bias: Tensor<B, 1> = path.get("bias", [d_out], device)?;
        linear.bias = Some(Param::from_tensor(bias));
    }

    Ok(())
}

/// Overwrite a Conv2d from `weight` (`[out, in, kh, kw]`) and, if present, `bias`
pub fn load_conv2d_into<B: Backend>(
    conv: &mut Conv2d<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    let shape = conv.weight.val().dims();

    let weight: Tensor<B, 4> = path.get("weight", shape, device)?;
    conv.weight = Param::from_tensor(weight);

    if conv.bias.is_some() {
        let bias: Tensor<B, 1> = path.get("bias", [shape[0]], device)?;
        conv.bias = Some(Param::from_tensor(bias));
    }

    Ok(())
}

pub fn load_group_norm_into<B: Backend>(
    norm: &mut GroupNorm<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    let channels = norm.num_channels();
    norm.weight = path.get("weight", [channels], device)?;
    norm.bias = path.get("bias", [channels], device)?;
    Ok(())
}

pub fn load_layer_norm_into<B: Backend>(
    norm: &mut LayerNorm<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    let size = norm.weight.dims()[0];
    norm.weight = path.get("weight", [size], device)?;
    norm.bias = path.get("bias", [size], device)?;
    Ok(())
}

// Attention and feed-forward

/// `proj` holds the value and gate halves in one `[2 * dim_out, dim_in]` matrix
pub fn load_geglu_into<B: Backend>(
    geglu: &mut GeGlu<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    load_linear_into(&mut geglu.proj, &path.push("proj"), device)
}

/// `net.0` is the gated projection, `net.2` the output projection
pub fn load_feed_forward_into<B: Backend>(
    ff: &mut FeedForward<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    let net = path.push("net");
    load_geglu_into(&mut ff.geglu, &net.push_index(0), device)?;
    load_linear_into(&mut ff.proj_out, &net.push_index(2), device)
}

pub fn load_cross_attention_into<B: Backend>(
    attn: &mut CrossAttention<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    load_linear_into(&mut attn.to_q, &path.push("to_q"), device)?;
    load_linear_into(&mut attn.to_k, &path.push("to_k"), device)?;
    load_linear_into(&mut attn.to_v, &path.push("to_v"), device)?;
    load_linear_into(&mut attn.to_out, &path.push("to_out").push_index(0), device)
}

pub fn load_transformer_block_into<B: Backend>(
    block: &mut TransformerBlock<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    load_layer_norm_into(&mut block.norm1, &path.push("norm1"), device)?;
    load_cross_attention_into(&mut block.attn1, &path.push("attn1"), device)?;
    load_layer_norm_into(&mut block.norm2, &path.push("norm2"), device)?;
    load_cross_attention_into(&mut block.attn2, &path.push("attn2"), device)?;
    load_layer_norm_into(&mut block.norm3, &path.push("norm3"), device)?;
    load_feed_forward_into(&mut block.ff, &path.push("ff"), device)
}

pub fn load_spatial_transformer_into<B: Backend>(
    st: &mut SpatialTransformer<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    load_group_norm_into(&mut st.norm, &path.push("norm"), device)?;
    load_conv2d_into(&mut st.proj_in, &path.push("proj_in"), device)?;

    let blocks = path.push("transformer_blocks");
    for (i, block) in st.transformer_blocks.iter_mut().enumerate() {
        load_transformer_block_into(block, &blocks.push_index(i), device)?;
    }

    load_conv2d_into(&mut st.proj_out, &path.push("proj_out"), device)
}

// VAE blocks

pub fn load_resnet_into<B: Backend>(
    resnet: &mut ResnetBlock<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    load_group_norm_into(&mut resnet.norm1, &path.push("norm1"), device)?;
    load_conv2d_into(&mut resnet.conv1, &path.push("conv1"), device)?;
    load_group_norm_into(&mut resnet.norm2, &path.push("norm2"), device)?;
    load_conv2d_into(&mut resnet.conv2, &path.push("conv2"), device)?;

    if let Some(shortcut) = &mut resnet.conv_shortcut {
        load_conv2d_into(shortcut, &path.push("conv_shortcut"), device)?;
    }

    Ok(())
}

pub fn load_attention_block_into<B: Backend>(
    attn: &mut AttentionBlock<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    load_group_norm_into(&mut attn.group_norm, &path.push("group_norm"), device)?;
    load_linear_into(&mut attn.query, &path.push("query"), device)?;
    load_linear_into(&mut attn.key, &path.push("key"), device)?;
    load_linear_into(&mut attn.value, &path.push("value"), device)?;
    load_linear_into(&mut attn.proj_attn, &path.push("proj_attn"), device)
}

/// `resnets.0`, optional `attentions.0`, `resnets.1`
pub fn load_mid_block_into<B: Backend>(
    mid: &mut MidBlock<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    let resnets = path.push("resnets");
    load_resnet_into(&mut mid.resnet_in, &resnets.push_index(0), device)?;

    if let Some(attention) = &mut mid.attention {
        load_attention_block_into(attention, &path.push("attentions").push_index(0), device)?;
    }

    load_resnet_into(&mut mid.resnet_out, &resnets.push_index(1), device)
}

pub fn load_encoder_into<B: Backend>(
    encoder: &mut Encoder<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    load_conv2d_into(&mut encoder.conv_in, &path.push("conv_in"), device)?;

    let down_blocks = path.push("down_blocks");
    for (i, block) in encoder.down_blocks.iter_mut().enumerate() {
        let block_path = down_blocks.push_index(i);
        let resnets = block_path.push("resnets");

        for (j, resnet) in block.resnets.iter_mut().enumerate() {
            load_resnet_into(resnet, &resnets.push_index(j), device)?;
        }

        if let Some(downsample) = &mut block.downsample {
            let conv_path = block_path.push("downsamplers").push_index(0).push("conv");
            load_conv2d_into(&mut downsample.conv, &conv_path, device)?;
        }
    }

    load_mid_block_into(&mut encoder.mid_block, &path.push("mid_block"), device)?;
    load_group_norm_into(&mut encoder.conv_norm_out, &path.push("conv_norm_out"), device)?;
    load_conv2d_into(&mut encoder.conv_out, &path.push("conv_out"), device)
}

/// `up_blocks` are indexed from the lowest resolution, matching the decoder's walk
pub fn load_decoder_into<B: Backend>(
    decoder: &mut Decoder<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    load_conv2d_into(&mut decoder.conv_in, &path.push("conv_in"), device)?;
    load_mid_block_into(&mut decoder.mid_block, &path.push("mid_block"), device)?;

    let up_blocks = path.push("up_blocks");
    for (i, block) in decoder.up_blocks.iter_mut().enumerate() {
        let block_path = up_blocks.push_index(i);
        let resnets = block_path.push("resnets");

        for (j, resnet) in block.resnets.iter_mut().enumerate() {
            load_resnet_into(resnet, &resnets.push_index(j), device)?;
        }

        if let Some(upsample) = &mut block.upsample {
            let conv_path = block_path.push("upsamplers").push_index(0).push("conv");
            load_conv2d_into(&mut upsample.conv, &conv_path, device)?;
        }
    }

    load_group_norm_into(&mut decoder.conv_norm_out, &path.push("conv_norm_out"), device)?;
    load_conv2d_into(&mut decoder.conv_out, &path.push("conv_out"), device)
}

pub fn load_autoencoder_into<B: Backend>(
    vae: &mut AutoEncoderKl<B>,
    path: &VarPath,
    device: &B::Device,
) -> Result<(), LoadError> {
    load_encoder_into(&mut vae.encoder, &path.push("encoder"), device)?;
    load_conv2d_into(&mut vae.quant_conv, &path.push("quant_conv"), device)?;
    load_conv2d_into(&mut vae.post_quant_conv, &path.push("post_quant_conv"), device)?;
    load_decoder_into(&mut vae.decoder, &path.push("decoder"), device)
}

// Build from config, then load

/// Build a CrossAttention from `config` and load its weights from `path`
pub fn load_cross_attention<B: Backend>(
    config: &CrossAttentionConfig,
    path: &VarPath,
    device: &B::Device,
) -> Result<CrossAttention<B>, LoadError> {
    log::debug!("Loading CrossAttention from {path}");
    let mut attn = config.init(device)?;
    load_cross_attention_into(&mut attn, path, device)?;
    Ok(attn)
}

/// Build a TransformerBlock from `config` and load its weights from `path`
pub fn load_transformer_block<B: Backend>(
    config: &TransformerBlockConfig,
    path: &VarPath,
    device: &B::Device,
) -> Result<TransformerBlock<B>, LoadError> {
    log::debug!("Loading TransformerBlock from {path}");
    let mut block = config.init(device)?;
    load_transformer_block_into(&mut block, path, device)?;
    Ok(block)
}

/// Build a SpatialTransformer from `config` and load its weights from `path`
pub fn load_spatial_transformer<B: Backend>(
    config: &SpatialTransformerConfig,
    path: &VarPath,
    device: &B::Device,
) -> Result<SpatialTransformer<B>, LoadError> {
    log::debug!(
        "Loading SpatialTransformer ({} blocks) from {path}",
        config.depth
    );
    let mut st = config.init(device)?;
    load_spatial_transformer_into(&mut st, path, device)?;
    Ok(st)
}

/// Build a VAE encoder from `config` and load its weights from `path`
pub fn load_encoder<B: Backend>(
    config: &EncoderConfig,
    path: &VarPath,
    device: &B::Device,
) -> Result<Encoder<B>, LoadError> {
    log::debug!("Loading VAE encoder from {path}");
    let mut encoder = config.init(device)?;
    load_encoder_into(&mut encoder, path, device)?;
    Ok(encoder)
}

/// Build a VAE decoder from `config` and load its weights from `path`
pub fn load_decoder<B: Backend>(
    config: &DecoderConfig,
    path: &VarPath,
    device: &B::Device,
) -> Result<Decoder<B>, LoadError> {
    log::debug!("Loading VAE decoder from {path}");
    let mut decoder = config.init(device)?;
    load_decoder_into(&mut decoder, path, device)?;
    Ok(decoder)
}

/// Build an AutoEncoderKl from `config` and load its weights from `path`
///
/// Expects `encoder.*`, `decoder.*`, `quant_conv.*` and `post_quant_conv.*`
/// under `path`.
pub fn load_autoencoder<B: Backend>(
    config: &AutoEncoderKlConfig,
    path: &VarPath,
    device: &B::Device,
) -> Result<AutoEncoderKl<B>, LoadError> {
    log::debug!("Loading AutoEncoderKl from {path}");
    let mut vae = config.init(device)?;
    load_autoencoder_into(&mut vae, path, device)?;
    Ok(vae)
}
