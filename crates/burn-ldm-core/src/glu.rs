//! GeGLU gated projection and the transformer feed-forward built on it
//!
//! A single linear layer projects to twice the target width; the second half
//! goes through an exact (erf) GELU and gates the first half.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use crate::error::{Result, check_dim, ensure_positive};

/// GeGLU gated projection
///
/// # Architecture
///
/// ```text
/// value, gate = split(proj(x), 2)
/// output = value * GELU(gate)
/// ```
///
/// # References
///
/// - [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)
#[derive(Module, Debug)]
pub struct GeGlu<B: Backend> {
    /// Projection to `2 * dim_out`
    pub proj: Linear<B>,
    pub dim_in: usize,
    pub dim_out: usize,
}

impl<B: Backend> GeGlu<B> {
    /// Creates a gated projection from `dim_in` to `dim_out`
    pub fn new(dim_in: usize, dim_out: usize, device: &B::Device) -> Result<Self> {
        ensure_positive("GeGlu input width", dim_in)?;
        ensure_positive("GeGlu output width", dim_out)?;

        Ok(Self {
            proj: LinearConfig::new(dim_in, dim_out * 2).init(device),
            dim_in,
            dim_out,
        })
    }

    /// Applies the gated projection, `[..., dim_in] -> [..., dim_out]`
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        check_dim("GeGlu", self.dim_in, x.dims()[D - 1])?;
        Ok(geglu(self.proj.forward(x)))
    }
}

/// Configuration for [`FeedForward`]
#[derive(Debug, Clone)]
pub struct FeedForwardConfig {
    /// Input width
    pub dim: usize,
    /// Output width, defaults to `dim`
    pub dim_out: Option<usize>,
    /// Hidden width multiplier
    pub mult: usize,
}

impl FeedForwardConfig {
    /// Creates a config with the usual 4x expansion and `dim_out = dim`
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            dim_out: None,
            mult: 4,
        }
    }

    pub fn with_dim_out(mut self, dim_out: usize) -> Self {
        self.dim_out = Some(dim_out);
        self
    }

    pub fn with_mult(mut self, mult: usize) -> Self {
        self.mult = mult;
        self
    }

    /// Hidden width of the gated projection
    pub fn inner_dim(&self) -> usize {
        self.dim * self.mult
    }

    /// Initializes the feed-forward module
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<FeedForward<B>> {
        ensure_positive("feed-forward dim", self.dim)?;
        ensure_positive("feed-forward mult", self.mult)?;
        let dim_out = self.dim_out.unwrap_or(self.dim);
        ensure_positive("feed-forward dim_out", dim_out)?;

        let inner_dim = self.inner_dim();
        Ok(FeedForward {
            geglu: GeGlu::new(self.dim, inner_dim, device)?,
            proj_out: LinearConfig::new(inner_dim, dim_out).init(device),
        })
    }
}

/// Feed-forward sublayer with GeGLU gating
///
/// ```text
/// output = proj_out(GeGlu(x))
/// ```
///
/// No activation follows `proj_out`; the nonlinearity lives in the gate.
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    pub geglu: GeGlu<B>,
    pub proj_out: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    /// Applies the feed-forward network, `[..., dim] -> [..., dim_out]`
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let hidden = self.geglu.forward(x)?;
        Ok(self.proj_out.forward(hidden))
    }
}

/// Standalone GeGLU activation
///
/// Applies GeGLU to a tensor that has already been projected to twice the
/// target width. The first half is the value, the second half the gate.
pub fn geglu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let last_dim = x.dims()[D - 1];
    debug_assert!(last_dim % 2 == 0, "Last dimension must be even for GeGLU");

    let (value, gate) = split_last_dim(x, last_dim / 2);
    value * burn::tensor::activation::gelu(gate)
}

/// Helper to split a tensor along the last dimension
fn split_last_dim<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    split_at: usize,
) -> (Tensor<B, D>, Tensor<B, D>) {
    let last_dim = x.dims()[D - 1];

    let x1 = x.clone().narrow(D - 1, 0, split_at);
    let x2 = x.narrow(D - 1, split_at, last_dim - split_at);

    (x1, x2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::Param;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// GeGlu with a zero weight so the output only depends on the bias
    fn bias_only_geglu(bias: [f32; 4]) -> GeGlu<TestBackend> {
        let device = Default::default();
        let mut geglu = GeGlu::<TestBackend>::new(3, 2, &device).unwrap();
        geglu.proj.weight = Param::from_tensor(Tensor::zeros([3, 4], &device));
        geglu.proj.bias = Some(Param::from_tensor(Tensor::from_floats(bias, &device)));
        geglu
    }

    #[test]
    fn test_geglu_shape() {
        let device = Default::default();
        let geglu = GeGlu::<TestBackend>::new(16, 24, &device).unwrap();

        let x = Tensor::<TestBackend, 3>::ones([2, 5, 16], &device);
        let y = geglu.forward(x).unwrap();

        assert_eq!(y.dims(), [2, 5, 24]);
    }

    #[test]
    fn test_geglu_rejects_wrong_width() {
        let device = Default::default();
        let geglu = GeGlu::<TestBackend>::new(16, 24, &device).unwrap();

        let x = Tensor::<TestBackend, 3>::ones([2, 5, 12], &device);
        assert!(geglu.forward(x).is_err());
    }

    #[test]
    fn test_geglu_negative_gate_closes() {
        let geglu = bias_only_geglu([3.0, -2.0, -20.0, -20.0]);
        let x = Tensor::<TestBackend, 2>::ones([1, 3], &Default::default());

        let y: Vec<f32> = geglu.forward(x).unwrap().into_data().to_vec().unwrap();
        for v in y {
            assert!(v.abs() < 1e-6, "gated output {v} should vanish");
        }
    }

    #[test]
    fn test_geglu_positive_gate_passes_value() {
        let geglu = bias_only_geglu([3.0, -2.0, 20.0, 20.0]);
        let x = Tensor::<TestBackend, 2>::ones([1, 3], &Default::default());

        // GELU(g) ~ g for large g, so the output is value scaled by the gate
        let y: Vec<f32> = geglu.forward(x).unwrap().into_data().to_vec().unwrap();
        assert!((y[0] / 20.0 - 3.0).abs() < 1e-4);
        assert!((y[1] / 20.0 + 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_feed_forward_shapes() {
        let device = Default::default();
        let ff = FeedForwardConfig::new(8).init::<TestBackend>(&device).unwrap();
        assert_eq!(ff.geglu.dim_out, 32);

        let x = Tensor::<TestBackend, 3>::ones([2, 3, 8], &device);
        assert_eq!(ff.forward(x).unwrap().dims(), [2, 3, 8]);

        let ff = FeedForwardConfig::new(8)
            .with_mult(2)
            .with_dim_out(5)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 3>::ones([1, 4, 8], &device);
        assert_eq!(ff.forward(x).unwrap().dims(), [1, 4, 5]);
    }

    #[test]
    fn test_geglu_standalone() {
        let device = Default::default();
        let x: Tensor<TestBackend, 3> = Tensor::ones([2, 8, 64], &device);
        let y = geglu(x);

        assert_eq!(y.dims(), [2, 8, 32]);
    }
}
