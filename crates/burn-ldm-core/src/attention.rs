//! Scaled dot-product attention kernels with heads folded into the batch axis
//!
//! Attention modules project to `[batch, seq, heads * head_dim]` and fold the
//! heads into the leading axis, so every kernel here works on rank-3 tensors
//! of shape `[batch * heads, seq, head_dim]`.
//!
//! The fold keeps heads of the same batch element adjacent: row `b * heads + h`
//! of the folded tensor holds head `h` of batch element `b`.

use burn::prelude::*;
use burn::tensor::DType;
use burn::tensor::activation::softmax;

/// Folds heads into the batch axis
///
/// `[batch, seq, heads * head_dim] -> [batch * heads, seq, head_dim]`
///
/// The width must be divisible by `heads`; modules guarantee this at construction.
pub fn heads_to_batch<B: Backend>(x: Tensor<B, 3>, heads: usize) -> Tensor<B, 3> {
    let [batch, seq_len, dim] = x.dims();
    let head_dim = dim / heads;

    x.reshape([batch, seq_len, heads, head_dim])
        .swap_dims(1, 2)
        .reshape([batch * heads, seq_len, head_dim])
}

/// Inverse of [`heads_to_batch`]
///
/// `[batch * heads, seq, head_dim] -> [batch, seq, heads * head_dim]`
pub fn batch_to_heads<B: Backend>(x: Tensor<B, 3>, heads: usize) -> Tensor<B, 3> {
    let [folded, seq_len, head_dim] = x.dims();
    let batch = folded / heads;

    x.reshape([batch, heads, seq_len, head_dim])
        .swap_dims(1, 2)
        .reshape([batch, seq_len, heads * head_dim])
}

/// Softmax over the last axis, accumulated in f32 and cast back
fn softmax_f32<B: Backend, const D: usize>(scores: Tensor<B, D>) -> Tensor<B, D> {
    let dtype = scores.dtype();
    softmax(scores.cast(DType::F32), D - 1).cast(dtype)
}

/// Full attention over folded heads
///
/// Computes `softmax(Q @ K^T * scale) @ V` for
/// `q: [n, q_len, d]`, `k: [n, kv_len, d]`, `v: [n, kv_len, d_v]`.
pub fn scaled_dot_product<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    v: Tensor<B, 3>,
    scale: f64,
) -> Tensor<B, 3> {
    let scores = q.matmul(k.swap_dims(1, 2)) * scale;
    softmax_f32(scores).matmul(v)
}

/// Sliced attention over folded heads
///
/// Splits the folded batch axis into contiguous chunks of `slice_size` rows
/// and runs [`scaled_dot_product`] on each, writing the result into a zeroed
/// accumulator at the chunk's offset. Peak memory for the score matrix drops
/// from `n * q_len * kv_len` to `slice_size * q_len * kv_len`.
///
/// A trailing chunk shorter than `slice_size` is processed as well, so every
/// row of the output is written.
pub fn sliced_scaled_dot_product<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    v: Tensor<B, 3>,
    scale: f64,
    slice_size: usize,
) -> Tensor<B, 3> {
    let [batch, q_len, head_dim] = q.dims();
    let [_, kv_len, v_dim] = v.dims();
    let slice_size = slice_size.max(1);

    let mut out = Tensor::<B, 3>::zeros([batch, q_len, v_dim], &q.device());

    for start in (0..batch).step_by(slice_size) {
        let end = (start + slice_size).min(batch);
        log::trace!("sliced attention: rows {start}..{end} of {batch}");

        let q_slice = q.clone().slice([start..end, 0..q_len, 0..head_dim]);
        let k_slice = k.clone().slice([start..end, 0..kv_len, 0..head_dim]);
        let v_slice = v.clone().slice([start..end, 0..kv_len, 0..v_dim]);

        let chunk = scaled_dot_product(q_slice, k_slice, v_slice, scale);
        out = out.slice_assign([start..end, 0..q_len, 0..v_dim], chunk);
    }

    out
}

/// How attention is evaluated over the folded batch axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionStrategy {
    /// One pass over the whole folded batch
    Full,
    /// Chunks of the given number of rows
    Sliced(usize),
}

impl AttentionStrategy {
    /// Picks the strategy for a folded batch of `batch` rows
    ///
    /// Slicing only pays off when it produces more than one chunk, so a slice
    /// size with `batch / slice_size <= 1` falls back to full attention.
    pub fn select(slice_size: Option<usize>, batch: usize) -> Self {
        match slice_size {
            Some(size) if size > 0 && batch / size > 1 => AttentionStrategy::Sliced(size),
            Some(_) | None => AttentionStrategy::Full,
        }
    }

    /// Runs attention with this strategy
    pub fn attend<B: Backend>(
        self,
        q: Tensor<B, 3>,
        k: Tensor<B, 3>,
        v: Tensor<B, 3>,
        scale: f64,
    ) -> Tensor<B, 3> {
        match self {
            AttentionStrategy::Full => scaled_dot_product(q, k, v, scale),
            AttentionStrategy::Sliced(size) => sliced_scaled_dot_product(q, k, v, scale, size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn to_vec<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    fn assert_close(a: Vec<f32>, b: Vec<f32>, tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            let bound = tol * (1.0 + y.abs());
            assert!((x - y).abs() <= bound, "index {i}: {x} vs {y}");
        }
    }

    fn random(shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn test_heads_to_batch_layout() {
        let device = Default::default();
        // batch 2, seq 3, heads 2, head_dim 2; value encodes (b, s, h, d)
        let x = Tensor::<TestBackend, 1, Int>::arange(0..24, &device)
            .float()
            .reshape([2, 3, 4]);

        let folded = heads_to_batch(x, 2);
        assert_eq!(folded.dims(), [4, 3, 2]);

        // row b * heads + h, position s, lane d reads x[b, s, h * 2 + d]
        let data = to_vec(folded);
        for b in 0..2 {
            for h in 0..2 {
                for s in 0..3 {
                    for d in 0..2 {
                        let folded_idx = ((b * 2 + h) * 3 + s) * 2 + d;
                        let source_idx = (b * 3 + s) * 4 + h * 2 + d;
                        assert_eq!(data[folded_idx], source_idx as f32);
                    }
                }
            }
        }
    }

    #[test]
    fn test_fold_matches_bhld_layout() {
        let x = random([2, 5, 12]);

        let folded = heads_to_batch(x.clone(), 3);
        let bhld = x.reshape([2, 5, 3, 4]).swap_dims(1, 2).reshape([6, 5, 4]);

        assert_eq!(to_vec(folded), to_vec(bhld));
    }

    #[test]
    fn test_fold_unfold_identity() {
        let x = random([3, 7, 8]);
        let back = batch_to_heads(heads_to_batch(x.clone(), 4), 4);
        assert_eq!(to_vec(back), to_vec(x));
    }

    #[test]
    fn test_attention_rows_sum_to_one() {
        let device = Default::default();
        let q = random([2, 4, 8]);
        let k = random([2, 6, 8]);
        let v = Tensor::<TestBackend, 3>::ones([2, 6, 8], &device);

        // attention over constant values returns the value regardless of weights
        let out = scaled_dot_product(q, k, v, 8f64.powf(-0.5));
        assert_eq!(out.dims(), [2, 4, 8]);
        assert_close(to_vec(out), vec![1.0; 64], 1e-5);
    }

    #[test]
    fn test_sliced_matches_full() {
        let q = random([8, 5, 4]);
        let k = random([8, 7, 4]);
        let v = random([8, 7, 4]);

        let full = scaled_dot_product(q.clone(), k.clone(), v.clone(), 0.5);
        let sliced = sliced_scaled_dot_product(q, k, v, 0.5, 2);

        assert_close(to_vec(sliced), to_vec(full), 1e-5);
    }

    #[test]
    fn test_sliced_covers_remainder_rows() {
        let q = random([7, 3, 4]);
        let k = random([7, 3, 4]);
        let v = random([7, 3, 4]);

        let full = scaled_dot_product(q.clone(), k.clone(), v.clone(), 0.5);
        let sliced = sliced_scaled_dot_product(q, k, v, 0.5, 3);

        // 7 rows in chunks of 3: the last row is its own chunk
        assert_close(to_vec(sliced), to_vec(full), 1e-5);
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(AttentionStrategy::select(None, 16), AttentionStrategy::Full);
        assert_eq!(AttentionStrategy::select(Some(8), 16), AttentionStrategy::Sliced(8));
        // a single chunk is not worth slicing
        assert_eq!(AttentionStrategy::select(Some(16), 16), AttentionStrategy::Full);
        assert_eq!(AttentionStrategy::select(Some(10), 16), AttentionStrategy::Full);
        assert_eq!(AttentionStrategy::select(Some(32), 16), AttentionStrategy::Full);
    }
}
