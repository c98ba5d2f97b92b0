//! Numerical equivalence of the attention evaluation paths
//!
//! Run with: `cargo test -p burn-ldm-unet --test attention_equivalence`

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_ldm_unet::{CrossAttentionConfig, SpatialTransformerConfig, TransformerBlockConfig};
use burn_ndarray::NdArray;

type TestBackend = NdArray<f32>;

fn random<const D: usize>(shape: [usize; D]) -> Tensor<TestBackend, D> {
    Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
}

fn to_vec<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
    t.into_data().to_vec().unwrap()
}

/// Compare two tensors for approximate equality (relative tolerance)
fn assert_tensors_approx_eq<const D: usize>(
    actual: Tensor<TestBackend, D>,
    expected: Tensor<TestBackend, D>,
    tolerance: f32,
    name: &str,
) {
    assert_eq!(actual.dims(), expected.dims(), "{name}: shape");
    let actual = to_vec(actual);
    let expected = to_vec(expected);
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        let diff = (a - e).abs();
        assert!(
            diff <= tolerance * (1.0 + e.abs()),
            "{name}: index {i} expected {e}, got {a} (diff: {diff})"
        );
    }
}

#[test]
fn self_attention_equals_explicit_context() {
    let device = Default::default();
    let attn = CrossAttentionConfig::new(16, 4, 4)
        .init::<TestBackend>(&device)
        .unwrap();

    let x = random([2, 7, 16]);
    let implicit = attn.forward(x.clone(), None).unwrap();
    let explicit = attn.forward(x.clone(), Some(x)).unwrap();

    assert_eq!(to_vec(implicit), to_vec(explicit));
}

#[test]
fn sliced_attention_matches_unsliced() {
    let device = Default::default();
    let attn = CrossAttentionConfig::new(16, 4, 4)
        .with_context_dim(Some(12))
        .init::<TestBackend>(&device)
        .unwrap();
    // batch 2 * heads 4 = 8 folded rows, 4 chunks of 2
    let sliced = attn.clone().with_slice_size(Some(2)).unwrap();

    let x = random([2, 9, 16]);
    let context = random([2, 5, 12]);

    let expected = attn.forward(x.clone(), Some(context.clone())).unwrap();
    let actual = sliced.forward(x, Some(context)).unwrap();

    assert_tensors_approx_eq(actual, expected, 1e-5, "slice 2");
}

#[test]
fn sliced_attention_with_uneven_chunks_matches_unsliced() {
    let device = Default::default();
    let attn = CrossAttentionConfig::new(12, 3, 4)
        .init::<TestBackend>(&device)
        .unwrap();
    // batch 3 * heads 3 = 9 folded rows, chunks of 4, 4 and 1
    let sliced = attn.clone().with_slice_size(Some(4)).unwrap();

    let x = random([3, 6, 12]);
    let expected = attn.forward(x.clone(), None).unwrap();
    let actual = sliced.forward(x, None).unwrap();

    assert_tensors_approx_eq(actual, expected, 1e-5, "slice 4 of 9");
}

#[test]
fn transformer_block_slicing_is_transparent() {
    let device = Default::default();
    let block = TransformerBlockConfig::new(16, 2, 8)
        .with_context_dim(Some(8))
        .init::<TestBackend>(&device)
        .unwrap();
    let sliced = block.clone().with_slice_size(Some(1)).unwrap();

    let x = random([2, 5, 16]);
    let context = random([2, 3, 8]);
    let expected = block.forward(x.clone(), Some(context.clone())).unwrap();
    let actual = sliced.forward(x, Some(context)).unwrap();

    assert_tensors_approx_eq(actual, expected, 1e-5, "transformer block");
}

#[test]
fn spatial_transformer_slicing_is_transparent() {
    let device = Default::default();
    let st = SpatialTransformerConfig::new(8, 2, 4)
        .with_num_groups(2)
        .with_context_dim(Some(6))
        .init::<TestBackend>(&device)
        .unwrap();
    let sliced = st.clone().with_slice_size(Some(1)).unwrap();

    let x = random([2, 8, 4, 4]);
    let context = random([2, 3, 6]);
    let expected = st.forward(x.clone(), Some(context.clone())).unwrap();
    let actual = sliced.forward(x, Some(context)).unwrap();

    assert_tensors_approx_eq(actual, expected, 1e-5, "spatial transformer");
}

#[test]
fn repeated_forward_is_deterministic() {
    let device = Default::default();
    let block = TransformerBlockConfig::new(16, 4, 4)
        .with_context_dim(Some(8))
        .with_slice_size(Some(2))
        .init::<TestBackend>(&device)
        .unwrap();

    let x = random([2, 5, 16]);
    let context = random([2, 3, 8]);
    let first = block.forward(x.clone(), Some(context.clone())).unwrap();
    let second = block.forward(x, Some(context)).unwrap();

    assert_eq!(to_vec(first), to_vec(second));
}
