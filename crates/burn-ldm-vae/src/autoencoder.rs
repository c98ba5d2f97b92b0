//! KL autoencoder: encoder and decoder joined through a diagonal Gaussian
//! latent distribution.

use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;
use burn::tensor::Distribution;

use burn_ldm_core::error::{LdmError, Result, check_dim};

use crate::decoder::{Decoder, DecoderConfig};
use crate::encoder::{Encoder, EncoderConfig};

/// Latent scaling factors applied between the VAE and the denoiser
pub mod scaling {
    /// SD 1.x / 2.x latent scale
    pub const SD1X_SCALE_FACTOR: f64 = 0.18215;
    /// SDXL latent scale
    pub const SDXL_SCALE_FACTOR: f64 = 0.13025;
}

/// Bounds applied to the predicted log-variance
const LOG_VAR_MIN: f64 = -30.0;
const LOG_VAR_MAX: f64 = 20.0;

/// Diagonal Gaussian over the latent space
///
/// Built from the `2 * latent_channels` moments the encoder predicts: the
/// first half is the mean, the second half the log-variance.
#[derive(Debug, Clone)]
pub struct DiagonalGaussian<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub log_var: Tensor<B, 4>,
}

impl<B: Backend> DiagonalGaussian<B> {
    /// Splits `[batch, 2 * latent, h, w]` moments into mean and log-variance
    pub fn from_moments(moments: Tensor<B, 4>) -> Result<Self> {
        let channels = moments.dims()[1];
        if channels == 0 || channels % 2 != 0 {
            return Err(LdmError::shape(
                "DiagonalGaussian moments",
                "an even, non-zero channel count",
                channels,
            ));
        }
        let latent = channels / 2;

        let mean = moments.clone().narrow(1, 0, latent);
        let log_var = moments.narrow(1, latent, latent).clamp(LOG_VAR_MIN, LOG_VAR_MAX);

        Ok(Self { mean, log_var })
    }

    /// Standard deviation, `exp(0.5 * log_var)`
    pub fn std(&self) -> Tensor<B, 4> {
        (self.log_var.clone() * 0.5).exp()
    }

    /// Variance, `exp(log_var)`
    pub fn var(&self) -> Tensor<B, 4> {
        self.log_var.clone().exp()
    }

    /// Reparameterized sample `mean + std * noise` with caller-supplied noise
    pub fn sample(&self, noise: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        if noise.dims() != self.mean.dims() {
            return Err(LdmError::shape(
                "DiagonalGaussian noise",
                self.mean.dims(),
                noise.dims(),
            ));
        }
        Ok(self.mean.clone() + self.std() * noise)
    }

    /// Sample with standard normal noise drawn on the mean's device
    pub fn sample_random(&self) -> Tensor<B, 4> {
        let noise = Tensor::random(
            self.mean.shape(),
            Distribution::Normal(0.0, 1.0),
            &self.mean.device(),
        );
        self.mean.clone() + self.std() * noise
    }

    /// Most likely latent (the mean)
    pub fn mode(&self) -> Tensor<B, 4> {
        self.mean.clone()
    }
}

/// KL autoencoder configuration
#[derive(Debug, Clone)]
pub struct AutoEncoderKlConfig {
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    /// Multiplier applied to latents before they reach the denoiser
    pub scaling_factor: f64,
}

impl Default for AutoEncoderKlConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::sd1x(),
            decoder: DecoderConfig::sd1x(),
            scaling_factor: scaling::SD1X_SCALE_FACTOR,
        }
    }
}

impl AutoEncoderKlConfig {
    /// SD 1.x autoencoder
    pub fn sd1x() -> Self {
        Self::default()
    }

    pub fn with_scaling_factor(mut self, scaling_factor: f64) -> Self {
        self.scaling_factor = scaling_factor;
        self
    }

    /// Checks that encoder and decoder agree on the latent space
    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        self.decoder.validate()?;
        if !self.encoder.double_z {
            return Err(LdmError::Config(
                "autoencoder encoder must predict mean and log-variance (double_z)".into(),
            ));
        }
        if self.encoder.latent_channels != self.decoder.latent_channels {
            return Err(LdmError::Config(format!(
                "encoder latent_channels {} != decoder latent_channels {}",
                self.encoder.latent_channels, self.decoder.latent_channels
            )));
        }
        if !(self.scaling_factor.is_finite() && self.scaling_factor > 0.0) {
            return Err(LdmError::Config(format!(
                "scaling_factor must be positive, got {}",
                self.scaling_factor
            )));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<AutoEncoderKl<B>> {
        AutoEncoderKl::new(self, device)
    }
}

fn conv1x1<B: Backend>(channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([channels, channels], [1, 1])
        .with_padding(PaddingConfig2d::Explicit(0, 0))
        .init(device)
}

/// Encoder and decoder with the 1x1 moment and latent projections
#[derive(Module, Debug)]
pub struct AutoEncoderKl<B: Backend> {
    pub encoder: Encoder<B>,
    pub quant_conv: Conv2d<B>,
    pub post_quant_conv: Conv2d<B>,
    pub decoder: Decoder<B>,
    pub scaling_factor: f64,
}

impl<B: Backend> AutoEncoderKl<B> {
    pub fn new(config: &AutoEncoderKlConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let latent = config.encoder.latent_channels;

        let encoder = config.encoder.init(device)?;
        let decoder = config.decoder.init(device)?;

        log::debug!(
            "AutoEncoderKl: {latent} latent channels, scaling factor {}",
            config.scaling_factor
        );

        Ok(Self {
            encoder,
            quant_conv: conv1x1(2 * latent, device),
            post_quant_conv: conv1x1(latent, device),
            decoder,
            scaling_factor: config.scaling_factor,
        })
    }

    /// Image `[batch, in, h, w]` to the latent distribution at `h / 2^k, w / 2^k`
    pub fn encode(&self, x: Tensor<B, 4>) -> Result<DiagonalGaussian<B>> {
        let moments = self.encoder.forward(x)?;
        let moments = self.quant_conv.forward(moments);
        DiagonalGaussian::from_moments(moments)
    }

    /// Latent `[batch, latent, h, w]` (unscaled) to an image
    pub fn decode(&self, z: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        check_dim(
            "AutoEncoderKl latent channels",
            self.decoder.latent_channels,
            z.dims()[1],
        )?;
        let z = self.post_quant_conv.forward(z);
        self.decoder.forward(z)
    }

    /// Latent in the denoiser's range
    pub fn scale_latents(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        z * self.scaling_factor
    }

    /// Inverse of [`scale_latents`](Self::scale_latents)
    pub fn unscale_latents(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        z / self.scaling_factor
    }
}
