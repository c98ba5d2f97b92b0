//! Layer normalization implementation
//!
//! Normalizes across the last dimension of the input tensor. Used as the
//! pre-normalization of every transformer sublayer.

use burn::prelude::*;

use crate::error::{Result, ensure_positive};

/// Layer normalization module
///
/// # Formula
///
/// For input x with last dimension of size D:
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
/// ```
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    /// Scale parameter
    pub weight: Tensor<B, 1>,
    /// Shift parameter
    pub bias: Tensor<B, 1>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Creates a new layer normalization module over a last dimension of `size`
    pub fn new(size: usize, device: &B::Device) -> Result<Self> {
        ensure_positive("layer norm size", size)?;
        Ok(Self {
            weight: Tensor::ones([size], device),
            bias: Tensor::zeros([size], device),
            eps: 1e-5,
        })
    }

    /// Creates layer norm from pre-loaded weight and bias
    pub fn from_weight_bias(weight: Tensor<B, 1>, bias: Tensor<B, 1>) -> Self {
        Self {
            weight,
            bias,
            eps: 1e-5,
        }
    }

    /// Applies layer normalization, output has the input's shape
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        // Population variance, matching the usual LayerNorm definition
        let var = x.clone().var_bias(last_dim);

        let x_norm = (x - mean) / (var + self.eps).sqrt();

        x_norm * self.weight.clone().unsqueeze() + self.bias.clone().unsqueeze()
    }
}
