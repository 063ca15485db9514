#![allow(dead_code)]

use std::sync::Arc;

use mla_rs::{
    Element, MlaAttention, ReferenceOutput, ReferenceStage1, SplitCache, Tensor3D, Tensor4D,
    masked_attention,
};

pub const KV_LORA_RANK: usize = 64;
pub const QK_ROPE_HEAD_DIM: usize = 16;
pub const QK_HEAD_DIM: usize = KV_LORA_RANK + QK_ROPE_HEAD_DIM;

/// Host-side batch over a paged latent cache. Pages are handed out in
/// reverse order so every lookup goes through `kv_indices`.
pub struct PagedBatch<T> {
    pub q: Vec<T>,
    pub kv: Vec<T>,
    pub qo_indptr: Vec<i32>,
    pub kv_indptr: Vec<i32>,
    pub kv_indices: Vec<i32>,
    pub kv_last_page_lens: Vec<i32>,
    pub total_q: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub num_pages: usize,
    pub page_size: usize,
    pub max_seqlen_q: usize,
}

impl<T: Element> PagedBatch<T> {
    pub fn new(
        seqlens_q: &[usize],
        seqlens_kv: &[usize],
        num_heads: usize,
        head_dim: usize,
        page_size: usize,
    ) -> Self {
        assert_eq!(seqlens_q.len(), seqlens_kv.len());

        let mut qo_indptr = vec![0_i32];
        let mut kv_indptr = vec![0_i32];
        let mut kv_last_page_lens = Vec::new();
        for (&sq, &sk) in seqlens_q.iter().zip(seqlens_kv) {
            qo_indptr.push(qo_indptr.last().copied().unwrap_or(0) + sq as i32);
            let pages = sk.div_ceil(page_size);
            kv_indptr.push(kv_indptr.last().copied().unwrap_or(0) + pages as i32);
            let last = if pages == 0 {
                0
            } else {
                sk - (pages - 1) * page_size
            };
            kv_last_page_lens.push(last as i32);
        }

        let total_q = *qo_indptr.last().expect("indptr") as usize;
        let used_pages = *kv_indptr.last().expect("indptr") as usize;
        let num_pages = used_pages.max(1) + 1;
        let kv_indices = (0..used_pages)
            .map(|p| (num_pages - 1 - p) as i32)
            .collect();

        Self {
            q: fill(total_q * num_heads * head_dim, 13, 0.05),
            kv: fill(num_pages * page_size * head_dim, 17, 0.05),
            qo_indptr,
            kv_indptr,
            kv_indices,
            kv_last_page_lens,
            total_q,
            num_heads,
            head_dim,
            num_pages,
            page_size,
            max_seqlen_q: seqlens_q.iter().copied().max().unwrap_or(1).max(1),
        }
    }

    pub fn q_view(&self) -> Tensor3D<'_, T> {
        Tensor3D::new(&self.q, self.total_q, self.num_heads, self.head_dim)
    }

    pub fn kv_view(&self) -> Tensor4D<'_, T> {
        Tensor4D::new(&self.kv, self.num_pages, self.page_size, 1, self.head_dim)
    }

    pub fn reference(&self, value_head_dim: usize, sm_scale: f32) -> ReferenceOutput {
        masked_attention(
            &self.q_view(),
            &self.kv_view(),
            &self.qo_indptr,
            &self.kv_indptr,
            &self.kv_indices,
            &self.kv_last_page_lens,
            value_head_dim,
            sm_scale,
        )
        .expect("reference attention")
    }
}

/// Deterministic values in roughly `[-scale * period / 2, scale * period / 2]`.
pub fn fill<T: Element>(len: usize, period: usize, scale: f32) -> Vec<T> {
    (0..len)
        .map(|i| {
            let v = ((i * 7 + i / period) % period) as f32 - (period / 2) as f32;
            T::from_f32(v * scale)
        })
        .collect()
}

pub fn engine() -> MlaAttention<ReferenceStage1> {
    MlaAttention::new(ReferenceStage1::new())
        .expect("engine")
        .with_split_cache(Arc::new(SplitCache::new()))
        .with_compute_units(80)
}

pub fn default_scale() -> f32 {
    1.0 / (QK_HEAD_DIM as f32).sqrt()
}

pub fn assert_close<T: Element>(actual: &[T], expected: &[f32], atol: f32, rtol: f32, what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length");
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let a = a.to_f32();
        if a == e {
            continue;
        }
        assert!(
            (a - e).abs() <= atol + rtol * e.abs(),
            "{what}[{i}]: got {a}, expected {e}"
        );
    }
}
