//! Group normalization implementation
//!
//! Provides group normalization as used in the VAE and in spatial transformers.
//! Divides channels into groups and normalizes within each group.

use burn::prelude::*;
use burn::tensor::DType;

use crate::error::{Result, ensure_divisible, ensure_positive};

/// Group normalization module
///
/// # Formula
///
/// For input with C channels divided into G groups:
/// ```text
/// y = (x - mean(x_group)) / sqrt(var(x_group) + eps) * weight + bias
/// ```
///
/// # Reference
///
/// "Group Normalization" - Wu & He, 2018
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    /// Number of groups to divide channels into
    pub num_groups: usize,
    /// Scale parameter (gamma), shape [num_channels]
    pub weight: Tensor<B, 1>,
    /// Bias parameter (beta), shape [num_channels]
    pub bias: Tensor<B, 1>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    /// Creates a new group normalization module
    ///
    /// # Arguments
    ///
    /// * `num_groups` - Number of groups to divide channels into (typically 32)
    /// * `num_channels` - Total number of input channels (must be divisible by num_groups)
    /// * `eps` - Epsilon added to the variance
    /// * `device` - Device to create tensors on
    pub fn new(num_groups: usize, num_channels: usize, eps: f64, device: &B::Device) -> Result<Self> {
        ensure_positive("num_channels", num_channels)?;
        ensure_divisible("num_channels", num_channels, "num_groups", num_groups)?;

        Ok(Self {
            num_groups,
            weight: Tensor::ones([num_channels], device),
            bias: Tensor::zeros([num_channels], device),
            eps,
        })
    }

    /// Number of channels this norm was built for
    pub fn num_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Applies group normalization to a 4D tensor
    ///
    /// Input and output are `[batch, channels, height, width]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let group_size = channels / self.num_groups;

        let x = x.reshape([batch, self.num_groups, group_size * height * width]);

        // Statistics are reduced in f32 so half-precision backends do not overflow
        let original_dtype = x.dtype();
        let x_f32 = x.clone().cast(DType::F32);
        let mean_f32 = x_f32.clone().mean_dim(2);
        let diff_f32 = x_f32 - mean_f32.clone();
        let var_f32 = (diff_f32.clone() * diff_f32).mean_dim(2);

        let mean = mean_f32.cast(original_dtype);
        let var = var_f32.cast(original_dtype);

        let x = (x - mean) / (var + self.eps).sqrt();
        let x = x.reshape([batch, channels, height, width]);

        let weight = self.weight.clone().reshape([1, channels, 1, 1]);
        let bias = self.bias.clone().reshape([1, channels, 1, 1]);

        x * weight + bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_group_norm_rejects_indivisible_channels() {
        let device = Default::default();
        assert!(GroupNorm::<TestBackend>::new(32, 48, 1e-6, &device).is_err());
        assert!(GroupNorm::<TestBackend>::new(0, 48, 1e-6, &device).is_err());
    }

    #[test]
    fn test_group_norm_zero_mean_per_group() {
        let device = Default::default();
        let norm = GroupNorm::<TestBackend>::new(2, 4, 1e-6, &device).unwrap();

        let x = Tensor::<TestBackend, 1, Int>::arange(0..64, &device)
            .float()
            .reshape([2, 4, 2, 4]);
        let y = norm.forward(x);
        assert_eq!(y.dims(), [2, 4, 2, 4]);

        let group_means: Vec<f32> = y
            .reshape([2, 2, 16])
            .mean_dim(2)
            .into_data()
            .to_vec()
            .unwrap();
        for m in group_means {
            assert!(m.abs() < 1e-4, "group mean {m} not centered");
        }
    }
}
