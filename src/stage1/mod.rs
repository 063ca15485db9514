mod cpu;

pub use cpu::ReferenceStage1;

use crate::error::MlaError;
use crate::heuristic::MAX_KV_SPLITS;
use crate::layout::BatchLayout;
use crate::tensor::{Element, Tensor3D, Tensor4D};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage1Mode {
    Decode,
    Prefill,
}

/// KV range covered by one split, in page-index units of `kv_indptr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRange {
    pub start: usize,
    pub end: usize,
}

impl SplitRange {
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Entries handled by each split of a request holding `kv_len` entries.
#[inline]
pub fn split_chunk_size(kv_len: usize, num_kv_splits: usize, min_chunk_size: usize) -> usize {
    min_chunk_size.max(kv_len.div_ceil(num_kv_splits))
}

/// Range of split `split` for a request holding `kv_len` entries.
#[inline]
pub fn split_range(kv_len: usize, split: usize, chunk_size: usize) -> SplitRange {
    let start = chunk_size * split;
    let end = (start + chunk_size).min(kv_len);
    SplitRange { start, end }
}

/// Everything the stage-1 kernel reads.
#[derive(Debug, Clone, Copy)]
pub struct Stage1Inputs<'a, T> {
    /// Queries, `[total_q, num_heads, qk_head_dim]`.
    pub q: Tensor3D<'a, T>,
    /// Paged latent cache, `[num_pages, page_size, num_kv_heads, qk_head_dim]`.
    pub kv_buffer: Tensor4D<'a, T>,
    pub qo_indptr: &'a [i32],
    pub kv_indptr: &'a [i32],
    pub kv_indices: &'a [i32],
    pub kv_last_page_lens: &'a [i32],
    pub max_seqlen_q: usize,
    pub sm_scale: f32,
    pub layout: BatchLayout,
    pub num_kv_splits: usize,
    pub min_chunk_size: usize,
    pub mode: Stage1Mode,
}

impl<T: Element> Stage1Inputs<'_, T> {
    /// `[total_q, num_kv_splits, num_heads, Lv]` element count.
    pub fn partial_out_len(&self) -> Result<usize, MlaError> {
        self.partial_lse_len()?
            .checked_mul(self.layout.value_head_dim)
            .ok_or_else(|| MlaError::invalid_argument("partial_out element count overflows"))
    }

    pub fn partial_lse_len(&self) -> Result<usize, MlaError> {
        self.layout
            .total_query_tokens
            .checked_mul(self.num_kv_splits)
            .and_then(|n| n.checked_mul(self.layout.num_heads))
            .ok_or_else(|| MlaError::invalid_argument("partial_lse element count overflows"))
    }

    /// Re-derives the layout from the index arrays and checks the output
    /// buffers against it. Kernels call this before touching any buffer.
    pub fn validate(&self, partial_out_len: usize, partial_lse_len: usize) -> Result<(), MlaError> {
        if self.num_kv_splits == 0 || self.num_kv_splits > MAX_KV_SPLITS {
            return Err(MlaError::invalid_argument(format!(
                "num_kv_splits ({}) must be in 1..={MAX_KV_SPLITS}",
                self.num_kv_splits
            )));
        }
        let layout = BatchLayout::resolve(
            &self.q,
            &self.kv_buffer,
            [
                self.layout.total_query_tokens,
                self.layout.num_heads,
                self.layout.value_head_dim,
            ],
            self.qo_indptr,
            self.kv_indptr,
            self.kv_indices,
            self.kv_last_page_lens,
            self.max_seqlen_q,
        )?;
        if layout != self.layout {
            return Err(MlaError::invalid_argument(
                "stage-1 layout does not match the index arrays",
            ));
        }

        let expected_out = self.partial_out_len()?;
        if partial_out_len != expected_out {
            return Err(MlaError::shape_mismatch(
                "partial_out",
                expected_out,
                partial_out_len,
            ));
        }
        let expected_lse = self.partial_lse_len()?;
        if partial_lse_len != expected_lse {
            return Err(MlaError::shape_mismatch(
                "partial_lse",
                expected_lse,
                partial_lse_len,
            ));
        }
        Ok(())
    }
}

/// Producer of per-split partial attention results.
///
/// `partial_out` is `[total_q, num_kv_splits, num_heads, Lv]` and
/// `partial_lse` is `[total_q, num_kv_splits, num_heads]`, both row-major.
/// Slots of splits whose KV range is empty are left untouched.
pub trait Stage1Kernel: Send + Sync {
    fn name(&self) -> &str;

    fn forward<T: Element, O: Element>(
        &self,
        inputs: &Stage1Inputs<'_, T>,
        partial_out: &mut [O],
        partial_lse: &mut [f32],
    ) -> Result<(), MlaError>;
}

impl<K: Stage1Kernel> Stage1Kernel for &K {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn forward<T: Element, O: Element>(
        &self,
        inputs: &Stage1Inputs<'_, T>,
        partial_out: &mut [O],
        partial_lse: &mut [f32],
    ) -> Result<(), MlaError> {
        (**self).forward(inputs, partial_out, partial_lse)
    }
}

/// Stage-1 scratch for the split path. Always `f32`, whatever the storage
/// precision of the caller's tensors.
#[derive(Debug)]
pub struct PartialBuffers {
    pub output: Vec<f32>,
    pub lse: Vec<f32>,
}

impl PartialBuffers {
    pub fn allocate<T: Element>(inputs: &Stage1Inputs<'_, T>) -> Result<Self, MlaError> {
        Ok(Self {
            output: vec![0.0; inputs.partial_out_len()?],
            lse: vec![f32::NEG_INFINITY; inputs.partial_lse_len()?],
        })
    }
}
