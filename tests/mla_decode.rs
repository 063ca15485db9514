mod common;

use std::sync::Arc;

use common::{KV_LORA_RANK, PagedBatch, QK_HEAD_DIM, assert_close, default_scale, engine};
use half::bf16;
use mla_rs::{
    Element, LaunchConfig, MlaDecodeParams, MlaError, PartialBuffers, ReduceParams, ReferenceStage1,
    SplitCache, Stage1Inputs, Stage1Kernel, Stage1Mode, Tensor3DMut, mla_decode_fwd,
    reduce_partials,
};
use proptest::prelude::*;

fn decode_params<T: Element>(batch: &PagedBatch<T>) -> MlaDecodeParams<'_, T> {
    MlaDecodeParams::new(
        batch.q_view(),
        batch.kv_view(),
        &batch.qo_indptr,
        &batch.kv_indptr,
        &batch.kv_indices,
        &batch.kv_last_page_lens,
        batch.max_seqlen_q,
    )
}

#[test]
fn single_token_sixteen_heads_widens_min_chunk() {
    let batch = PagedBatch::<f32>::new(&[1], &[21], 16, QK_HEAD_DIM, 1);
    let mut out = vec![0.0_f32; 16 * KV_LORA_RANK];
    let result = engine()
        .decode_forward(
            &decode_params(&batch),
            &mut Tensor3DMut::new(&mut out, 1, 16, KV_LORA_RANK),
        )
        .expect("decode");

    assert_eq!(result.min_chunk_size, 64);
    let expected = batch.reference(KV_LORA_RANK, default_scale());
    assert_close(&out, &expected.out, 1e-4, 1e-3, "out");
    assert_close(&result.lse, &expected.lse, 1e-4, 1e-3, "lse");
}

#[test]
fn three_requests_with_128_heads_match_reference() {
    let kv_lora_rank = 128;
    let head_dim = kv_lora_rank + common::QK_ROPE_HEAD_DIM;
    let batch = PagedBatch::<f32>::new(&[1, 1, 1], &[64, 256, 21], 128, head_dim, 1);
    let mut out = vec![0.0_f32; 3 * 128 * kv_lora_rank];
    let result = engine()
        .decode_forward(
            &decode_params(&batch),
            &mut Tensor3DMut::new(&mut out, 3, 128, kv_lora_rank),
        )
        .expect("decode");

    assert_eq!(result.lse_dims, [3, 128, 1]);
    assert_eq!(result.lse.len(), 3 * 128);
    assert_eq!(out.len(), 3 * 128 * 128);
    assert_eq!(result.min_chunk_size, 16);

    let expected = batch.reference(kv_lora_rank, 1.0 / (head_dim as f32).sqrt());
    assert_close(&out, &expected.out, 1e-4, 1e-3, "out");
    assert_close(&result.lse, &expected.lse, 1e-4, 1e-3, "lse");
}

#[test]
fn split_count_does_not_change_the_result() {
    let batch = PagedBatch::<f32>::new(&[1, 1], &[300, 45], 128, QK_HEAD_DIM, 1);
    let expected = batch.reference(KV_LORA_RANK, default_scale());

    let mut baseline = vec![0.0_f32; 2 * 128 * KV_LORA_RANK];
    engine()
        .decode_forward(
            &decode_params(&batch).with_num_kv_splits(1),
            &mut Tensor3DMut::new(&mut baseline, 2, 128, KV_LORA_RANK),
        )
        .expect("decode");

    for splits in [2, 4, 8, 16] {
        let mut out = vec![0.0_f32; 2 * 128 * KV_LORA_RANK];
        let result = engine()
            .decode_forward(
                &decode_params(&batch).with_num_kv_splits(splits),
                &mut Tensor3DMut::new(&mut out, 2, 128, KV_LORA_RANK),
            )
            .expect("decode");
        assert_eq!(result.num_kv_splits, splits);
        assert_close(&out, &baseline, 1e-5, 1e-4, "split vs single");
        assert_close(&out, &expected.out, 1e-4, 1e-3, "split vs reference");
        assert_close(&result.lse, &expected.lse, 1e-4, 1e-3, "lse");
    }
}

#[test]
fn single_split_shortcut_equals_one_split_reduction() {
    let batch = PagedBatch::<f32>::new(&[1, 1, 1], &[40, 7, 90], 128, QK_HEAD_DIM, 1);
    let params = decode_params(&batch).with_num_kv_splits(1);

    let mut direct = vec![0.0_f32; 3 * 128 * KV_LORA_RANK];
    let direct_result = engine()
        .decode_forward(
            &params,
            &mut Tensor3DMut::new(&mut direct, 3, 128, KV_LORA_RANK),
        )
        .expect("decode");

    let layout = mla_rs::BatchLayout::resolve(
        &params.q,
        &params.kv_buffer,
        [3, 128, KV_LORA_RANK],
        params.qo_indptr,
        params.kv_indptr,
        params.kv_indices,
        params.kv_last_page_lens,
        params.max_seqlen_q,
    )
    .expect("layout");
    let inputs = Stage1Inputs {
        q: params.q,
        kv_buffer: params.kv_buffer,
        qo_indptr: params.qo_indptr,
        kv_indptr: params.kv_indptr,
        kv_indices: params.kv_indices,
        kv_last_page_lens: params.kv_last_page_lens,
        max_seqlen_q: params.max_seqlen_q,
        sm_scale: params.sm_scale,
        layout,
        num_kv_splits: 1,
        min_chunk_size: direct_result.min_chunk_size,
        mode: Stage1Mode::Decode,
    };
    let mut partials = PartialBuffers::allocate(&inputs).expect("scratch");
    ReferenceStage1::new()
        .forward(&inputs, &mut partials.output, &mut partials.lse)
        .expect("stage 1");
    let mut reduced = vec![0.0_f32; 3 * 128 * KV_LORA_RANK];
    let mut reduced_lse = vec![0.0_f32; 3 * 128];
    reduce_partials(
        &partials.output,
        &partials.lse,
        params.qo_indptr,
        params.kv_indptr,
        &layout,
        &ReduceParams {
            num_kv_splits: 1,
            min_chunk_size: direct_result.min_chunk_size,
            launch: LaunchConfig::for_value_dim(KV_LORA_RANK),
        },
        &mut reduced,
        &mut reduced_lse,
    )
    .expect("reduce");

    assert_eq!(direct, reduced);
    assert_eq!(direct_result.lse, reduced_lse);
}

#[test]
fn multi_token_prediction_applies_causal_mask() {
    let batch = PagedBatch::<f32>::new(&[2, 2, 2], &[33, 2, 130], 128, QK_HEAD_DIM, 1);
    let mut out = vec![0.0_f32; 6 * 128 * KV_LORA_RANK];
    let result = engine()
        .decode_forward(
            &decode_params(&batch).with_num_kv_splits(4),
            &mut Tensor3DMut::new(&mut out, 6, 128, KV_LORA_RANK),
        )
        .expect("decode");

    let expected = batch.reference(KV_LORA_RANK, default_scale());
    assert_close(&out, &expected.out, 1e-4, 1e-3, "out");
    assert_close(&result.lse, &expected.lse, 1e-4, 1e-3, "lse");
}

#[test]
fn sixteen_heads_with_two_token_speculation() {
    let batch = PagedBatch::<f32>::new(&[2, 1], &[70, 19], 16, QK_HEAD_DIM, 1);
    let mut out = vec![0.0_f32; 3 * 16 * KV_LORA_RANK];
    let result = engine()
        .decode_forward(
            &decode_params(&batch).with_num_kv_splits(8),
            &mut Tensor3DMut::new(&mut out, 3, 16, KV_LORA_RANK),
        )
        .expect("decode");

    assert_eq!(result.min_chunk_size, 16);
    let expected = batch.reference(KV_LORA_RANK, default_scale());
    assert_close(&out, &expected.out, 1e-4, 1e-3, "out");
}

#[test]
fn partially_filled_pages_are_honoured() {
    let batch = PagedBatch::<f32>::new(&[1, 2], &[37, 10], 16, QK_HEAD_DIM, 4);
    assert_eq!(batch.kv_last_page_lens, vec![1, 2]);
    let mut out = vec![0.0_f32; 3 * 16 * KV_LORA_RANK];
    let result = engine()
        .decode_forward(
            &decode_params(&batch).with_num_kv_splits(3),
            &mut Tensor3DMut::new(&mut out, 3, 16, KV_LORA_RANK),
        )
        .expect("decode");

    let expected = batch.reference(KV_LORA_RANK, default_scale());
    assert_close(&out, &expected.out, 1e-4, 1e-3, "out");
    assert_close(&result.lse, &expected.lse, 1e-4, 1e-3, "lse");
}

#[test]
fn empty_sequence_yields_zero_row_and_neg_inf_lse() {
    let batch = PagedBatch::<f32>::new(&[1, 1], &[0, 30], 128, QK_HEAD_DIM, 1);
    for splits in [1, 4] {
        let mut out = vec![f32::NAN; 2 * 128 * KV_LORA_RANK];
        let result = engine()
            .decode_forward(
                &decode_params(&batch).with_num_kv_splits(splits),
                &mut Tensor3DMut::new(&mut out, 2, 128, KV_LORA_RANK),
            )
            .expect("decode");

        let (empty, rest) = out.split_at(128 * KV_LORA_RANK);
        assert!(empty.iter().all(|&x| x == 0.0), "splits={splits}");
        assert!(result.lse[..128].iter().all(|&l| l == f32::NEG_INFINITY));
        assert!(rest.iter().all(|x| x.is_finite()));
        assert!(result.lse[128..].iter().all(|l| l.is_finite()));
    }
}

#[test]
fn bf16_storage_accumulates_in_f32() {
    let batch = PagedBatch::<bf16>::new(&[1, 1], &[120, 17], 16, QK_HEAD_DIM, 1);
    let mut out = vec![bf16::ZERO; 2 * 16 * KV_LORA_RANK];
    let result = engine()
        .decode_forward(
            &decode_params(&batch).with_num_kv_splits(5),
            &mut Tensor3DMut::new(&mut out, 2, 16, KV_LORA_RANK),
        )
        .expect("decode");

    let expected = batch.reference(KV_LORA_RANK, default_scale());
    assert_close(&out, &expected.out, 1e-2, 1e-2, "out");
    assert_close(&result.lse, &expected.lse, 1e-3, 1e-3, "lse");
}

#[test]
fn split_decisions_are_memoised_per_shape() {
    let cache = Arc::new(SplitCache::new());
    let attention = engine().with_split_cache(Arc::clone(&cache));
    let batch = PagedBatch::<f32>::new(&[1, 1], &[500, 12], 128, QK_HEAD_DIM, 1);

    let mut first = vec![0.0_f32; 2 * 128 * KV_LORA_RANK];
    let a = attention
        .decode_forward(
            &decode_params(&batch),
            &mut Tensor3DMut::new(&mut first, 2, 128, KV_LORA_RANK),
        )
        .expect("decode");
    let mut second = vec![0.0_f32; 2 * 128 * KV_LORA_RANK];
    let b = attention
        .decode_forward(
            &decode_params(&batch),
            &mut Tensor3DMut::new(&mut second, 2, 128, KV_LORA_RANK),
        )
        .expect("decode");

    assert_eq!(cache.len(), 1);
    assert_eq!(a, b);
    assert_eq!(first, second);
}

#[test]
fn positive_logit_cap_fails_before_writing() {
    let batch = PagedBatch::<f32>::new(&[1], &[8], 128, QK_HEAD_DIM, 1);
    let mut out = vec![3.0_f32; 128 * KV_LORA_RANK];
    let err = engine()
        .decode_forward(
            &decode_params(&batch).with_logit_cap(50.0),
            &mut Tensor3DMut::new(&mut out, 1, 128, KV_LORA_RANK),
        )
        .expect_err("logit cap");
    assert!(matches!(err, MlaError::UnsupportedLogitCap { .. }));
    assert!(out.iter().all(|&x| x == 3.0));
}

#[test]
fn unsupported_head_count_is_rejected() {
    let batch = PagedBatch::<f32>::new(&[1], &[8], 32, QK_HEAD_DIM, 1);
    let mut out = vec![0.0_f32; 32 * KV_LORA_RANK];
    let err = engine()
        .decode_forward(
            &decode_params(&batch),
            &mut Tensor3DMut::new(&mut out, 1, 32, KV_LORA_RANK),
        )
        .expect_err("32 heads");
    assert!(matches!(err, MlaError::UnsupportedHeadCount { num_heads: 32 }));
}

#[test]
fn value_dim_wider_than_cache_is_rejected() {
    let batch = PagedBatch::<f32>::new(&[1], &[8], 16, QK_HEAD_DIM, 1);
    let mut out = vec![0.0_f32; 16 * (QK_HEAD_DIM + 1)];
    let err = engine()
        .decode_forward(
            &decode_params(&batch),
            &mut Tensor3DMut::new(&mut out, 1, 16, QK_HEAD_DIM + 1),
        )
        .expect_err("value dim");
    assert!(matches!(err, MlaError::ShapeMismatch { name: "out", .. }));
}

#[test]
fn free_function_uses_host_kernel() {
    let batch = PagedBatch::<f32>::new(&[1], &[50], 16, QK_HEAD_DIM, 1);
    let mut out = vec![0.0_f32; 16 * KV_LORA_RANK];
    let result = mla_decode_fwd(
        &decode_params(&batch),
        &mut Tensor3DMut::new(&mut out, 1, 16, KV_LORA_RANK),
    )
    .expect("decode");
    let expected = batch.reference(KV_LORA_RANK, default_scale());
    assert_close(&out, &expected.out, 1e-4, 1e-3, "out");
    assert_close(&result.lse, &expected.lse, 1e-4, 1e-3, "lse");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_split_count_invariance(
        kv_lens in prop::collection::vec(0usize..200, 1..4),
        splits in 1usize..=16,
        mtp in 1usize..=2,
    ) {
        let seqlens_q = vec![mtp; kv_lens.len()];
        let batch = PagedBatch::<f32>::new(&seqlens_q, &kv_lens, 16, QK_HEAD_DIM, 1);
        let rows = batch.total_q;
        let mut out = vec![0.0_f32; rows * 16 * KV_LORA_RANK];
        let result = engine()
            .decode_forward(
                &decode_params(&batch).with_num_kv_splits(splits),
                &mut Tensor3DMut::new(&mut out, rows, 16, KV_LORA_RANK),
            )
            .expect("decode");
        let expected = batch.reference(KV_LORA_RANK, default_scale());
        for (a, e) in out.iter().zip(&expected.out) {
            prop_assert!((a - e).abs() <= 1e-4 + 1e-3 * e.abs(), "{} vs {}", a, e);
        }
        for (a, e) in result.lse.iter().zip(&expected.lse) {
            prop_assert!(a == e || (a - e).abs() <= 1e-4 + 1e-3 * e.abs(), "{} vs {}", a, e);
        }
    }
}
