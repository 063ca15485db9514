use std::sync::Arc;

use crate::config::{LaunchConfig, RuntimeConfig};
use crate::error::MlaError;
use crate::heuristic::{MAX_KV_SPLITS, SplitCache, SplitKey, min_chunk_size};
use crate::layout::BatchLayout;
use crate::reduce::{ReduceParams, reduce_partials};
use crate::stage1::{PartialBuffers, ReferenceStage1, Stage1Inputs, Stage1Kernel, Stage1Mode};
use crate::tensor::{Element, Tensor3D, Tensor3DMut, Tensor4D};

/// Split-KV decode over a paged latent cache.
#[derive(Debug, Clone, Copy)]
pub struct MlaDecodeParams<'a, T> {
    /// Queries, `[total_q, num_heads, qk_head_dim]`.
    pub q: Tensor3D<'a, T>,
    /// Paged latent cache, `[num_pages, page_size, num_kv_heads, kv_lora_rank + qk_rope_head_dim]`.
    pub kv_buffer: Tensor4D<'a, T>,
    /// Query offsets per request, `[batch_size + 1]`.
    pub qo_indptr: &'a [i32],
    /// Page offsets per request into `kv_indices`, `[batch_size + 1]`.
    pub kv_indptr: &'a [i32],
    /// Physical page ids, `[kv_indptr[batch_size]]`.
    pub kv_indices: &'a [i32],
    /// Valid slots in each request's final page, `[batch_size]`.
    pub kv_last_page_lens: &'a [i32],
    pub max_seqlen_q: usize,
    /// Softmax scale; default is `1 / sqrt(kv feature dim)`.
    pub sm_scale: f32,
    /// Logit soft cap; only `<= 0` (disabled) is supported.
    pub logit_cap: f32,
    /// Expert override of the split heuristic, at most [`MAX_KV_SPLITS`].
    pub num_kv_splits: Option<usize>,
}

impl<'a, T> MlaDecodeParams<'a, T> {
    pub fn new(
        q: Tensor3D<'a, T>,
        kv_buffer: Tensor4D<'a, T>,
        qo_indptr: &'a [i32],
        kv_indptr: &'a [i32],
        kv_indices: &'a [i32],
        kv_last_page_lens: &'a [i32],
        max_seqlen_q: usize,
    ) -> Self {
        let sm_scale = default_sm_scale(kv_buffer.dim3);
        Self {
            q,
            kv_buffer,
            qo_indptr,
            kv_indptr,
            kv_indices,
            kv_last_page_lens,
            max_seqlen_q,
            sm_scale,
            logit_cap: 0.0,
            num_kv_splits: None,
        }
    }

    pub fn with_sm_scale(mut self, sm_scale: f32) -> Self {
        self.sm_scale = sm_scale;
        self
    }

    pub fn with_logit_cap(mut self, logit_cap: f32) -> Self {
        self.logit_cap = logit_cap;
        self
    }

    pub fn with_num_kv_splits(mut self, num_kv_splits: usize) -> Self {
        self.num_kv_splits = Some(num_kv_splits);
        self
    }

    /// Checks the unsupported-configuration preconditions. Shape checks run
    /// against the output tensor in [`MlaAttention::decode_forward`].
    pub fn validate(&self) -> Result<(), MlaError> {
        check_config(self.logit_cap, self.sm_scale, self.q.dim1, self.max_seqlen_q)?;
        if let Some(splits) = self.num_kv_splits {
            if splits == 0 || splits > MAX_KV_SPLITS {
                return Err(MlaError::invalid_argument(format!(
                    "num_kv_splits ({splits}) must be in 1..={MAX_KV_SPLITS}"
                )));
            }
        }
        Ok(())
    }
}

/// Single-split prefill over the absorbed latent cache.
#[derive(Debug, Clone, Copy)]
pub struct MlaPrefillParams<'a, T> {
    /// Queries, `[total_q, num_heads, kv_lora_rank + qk_rope_head_dim]`.
    pub q: Tensor3D<'a, T>,
    pub kv_buffer: Tensor4D<'a, T>,
    pub qo_indptr: &'a [i32],
    pub kv_indptr: &'a [i32],
    pub kv_indices: &'a [i32],
    pub kv_last_page_lens: &'a [i32],
    pub max_seqlen_q: usize,
    pub sm_scale: f32,
    pub logit_cap: f32,
}

impl<'a, T> MlaPrefillParams<'a, T> {
    pub fn new(
        q: Tensor3D<'a, T>,
        kv_buffer: Tensor4D<'a, T>,
        qo_indptr: &'a [i32],
        kv_indptr: &'a [i32],
        kv_indices: &'a [i32],
        kv_last_page_lens: &'a [i32],
        max_seqlen_q: usize,
    ) -> Self {
        let sm_scale = default_sm_scale(kv_buffer.dim3);
        Self {
            q,
            kv_buffer,
            qo_indptr,
            kv_indptr,
            kv_indices,
            kv_last_page_lens,
            max_seqlen_q,
            sm_scale,
            logit_cap: 0.0,
        }
    }

    pub fn with_sm_scale(mut self, sm_scale: f32) -> Self {
        self.sm_scale = sm_scale;
        self
    }

    pub fn with_logit_cap(mut self, logit_cap: f32) -> Self {
        self.logit_cap = logit_cap;
        self
    }

    pub fn validate(&self) -> Result<(), MlaError> {
        check_config(self.logit_cap, self.sm_scale, self.q.dim1, self.max_seqlen_q)
    }
}

/// Result of one forward call. The attention output itself is written into
/// the caller's `out` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct MlaForwardOutput {
    /// Aggregate log-sum-exp per `(q, h)`, row-major `[total_q, num_heads, 1]`.
    pub lse: Vec<f32>,
    pub lse_dims: [usize; 3],
    pub num_kv_splits: usize,
    pub min_chunk_size: usize,
}

/// Two-stage MLA engine over a stage-1 kernel.
pub struct MlaAttention<K> {
    kernel: K,
    split_cache: Arc<SplitCache>,
    compute_units: usize,
    launch: Option<LaunchConfig>,
}

impl<K: Stage1Kernel> MlaAttention<K> {
    /// Engine sharing the process-wide split cache, sized from
    /// [`RuntimeConfig`] (environment or available parallelism).
    pub fn new(kernel: K) -> Result<Self, MlaError> {
        let resolved = RuntimeConfig::default().resolve()?;
        Ok(Self {
            kernel,
            split_cache: SplitCache::global(),
            compute_units: resolved.compute_units,
            launch: None,
        })
    }

    pub fn with_split_cache(mut self, split_cache: Arc<SplitCache>) -> Self {
        self.split_cache = split_cache;
        self
    }

    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = compute_units;
        self
    }

    pub fn with_launch_config(mut self, launch: LaunchConfig) -> Self {
        self.launch = Some(launch);
        self
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn split_cache(&self) -> &SplitCache {
        &self.split_cache
    }

    pub fn compute_units(&self) -> usize {
        self.compute_units
    }

    pub fn decode_forward<T: Element, O: Element>(
        &self,
        params: &MlaDecodeParams<'_, T>,
        out: &mut Tensor3DMut<'_, O>,
    ) -> Result<MlaForwardOutput, MlaError> {
        params.validate()?;
        out.validate("out")?;
        let layout = BatchLayout::resolve(
            &params.q,
            &params.kv_buffer,
            out.dims(),
            params.qo_indptr,
            params.kv_indptr,
            params.kv_indices,
            params.kv_last_page_lens,
            params.max_seqlen_q,
        )?;

        let decision = self.split_cache.resolve(SplitKey {
            requested_splits: params.num_kv_splits,
            batch_size: layout.batch_size,
            total_kv: layout.total_kv_entries,
            num_heads: layout.num_heads,
            max_seqlen_q: layout.max_seqlen_q,
            compute_units: self.compute_units,
        })?;

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
            num_kv_splits: decision.num_kv_splits,
            min_chunk_size: decision.min_chunk_size,
            mode: Stage1Mode::Decode,
        };

        let single_token_wide = layout.num_heads == 16 && layout.max_seqlen_q == 1;
        if decision.num_kv_splits == 1 && !single_token_wide {
            tracing::debug!(
                kernel = self.kernel.name(),
                path = "direct",
                batch_size = layout.batch_size,
                total_q = layout.total_query_tokens,
                num_heads = layout.num_heads,
                "mla decode"
            );
            return self.run_direct(&inputs, out);
        }

        let launch = self
            .launch
            .unwrap_or_else(|| LaunchConfig::for_value_dim(layout.value_head_dim));
        launch.validate(layout.value_head_dim)?;

        tracing::debug!(
            kernel = self.kernel.name(),
            path = "split-reduce",
            batch_size = layout.batch_size,
            total_q = layout.total_query_tokens,
            num_heads = layout.num_heads,
            num_kv_splits = decision.num_kv_splits,
            min_chunk_size = decision.min_chunk_size,
            "mla decode"
        );

        let mut partials = PartialBuffers::allocate(&inputs)?;
        self.kernel
            .forward(&inputs, &mut partials.output, &mut partials.lse)?;

        let mut lse = vec![f32::NEG_INFINITY; layout.total_query_tokens * layout.num_heads];
        reduce_partials(
            &partials.output,
            &partials.lse,
            params.qo_indptr,
            params.kv_indptr,
            &layout,
            &ReduceParams {
                num_kv_splits: decision.num_kv_splits,
                min_chunk_size: decision.min_chunk_size,
                launch,
            },
            out.data,
            &mut lse,
        )?;

        Ok(MlaForwardOutput {
            lse,
            lse_dims: [layout.total_query_tokens, layout.num_heads, 1],
            num_kv_splits: decision.num_kv_splits,
            min_chunk_size: decision.min_chunk_size,
        })
    }

    pub fn prefill_forward<T: Element, O: Element>(
        &self,
        params: &MlaPrefillParams<'_, T>,
        out: &mut Tensor3DMut<'_, O>,
    ) -> Result<MlaForwardOutput, MlaError> {
        params.validate()?;
        out.validate("out")?;
        let layout = BatchLayout::resolve(
            &params.q,
            &params.kv_buffer,
            out.dims(),
            params.qo_indptr,
            params.kv_indptr,
            params.kv_indices,
            params.kv_last_page_lens,
            params.max_seqlen_q,
        )?;

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
            min_chunk_size: min_chunk_size(layout.num_heads, layout.max_seqlen_q)?,
            mode: Stage1Mode::Prefill,
        };

        tracing::debug!(
            kernel = self.kernel.name(),
            path = "direct",
            batch_size = layout.batch_size,
            total_q = layout.total_query_tokens,
            num_heads = layout.num_heads,
            "mla prefill"
        );
        self.run_direct(&inputs, out)
    }

    /// Single split: stage 1 writes the final rows and lse in place.
    fn run_direct<T: Element, O: Element>(
        &self,
        inputs: &Stage1Inputs<'_, T>,
        out: &mut Tensor3DMut<'_, O>,
    ) -> Result<MlaForwardOutput, MlaError> {
        let layout = inputs.layout;
        // Requests without KV entries are never written by stage 1.
        out.data.fill(O::from_f32(0.0));
        let mut lse = vec![f32::NEG_INFINITY; layout.total_query_tokens * layout.num_heads];
        self.kernel.forward(inputs, out.data, &mut lse)?;

        Ok(MlaForwardOutput {
            lse,
            lse_dims: [layout.total_query_tokens, layout.num_heads, 1],
            num_kv_splits: 1,
            min_chunk_size: inputs.min_chunk_size,
        })
    }
}

/// Decode with the host stage-1 kernel and the process-wide split cache.
pub fn mla_decode_fwd<T: Element, O: Element>(
    params: &MlaDecodeParams<'_, T>,
    out: &mut Tensor3DMut<'_, O>,
) -> Result<MlaForwardOutput, MlaError> {
    MlaAttention::new(ReferenceStage1::new())?.decode_forward(params, out)
}

/// Prefill with the host stage-1 kernel.
pub fn mla_prefill_fwd<T: Element, O: Element>(
    params: &MlaPrefillParams<'_, T>,
    out: &mut Tensor3DMut<'_, O>,
) -> Result<MlaForwardOutput, MlaError> {
    MlaAttention::new(ReferenceStage1::new())?.prefill_forward(params, out)
}

fn default_sm_scale(head_dim: usize) -> f32 {
    if head_dim > 0 {
        1.0 / (head_dim as f32).sqrt()
    } else {
        1.0
    }
}

fn check_config(
    logit_cap: f32,
    sm_scale: f32,
    num_heads: usize,
    max_seqlen_q: usize,
) -> Result<(), MlaError> {
    if logit_cap > 0.0 || logit_cap.is_nan() {
        return Err(MlaError::UnsupportedLogitCap { logit_cap });
    }
    min_chunk_size(num_heads, max_seqlen_q)?;
    if !sm_scale.is_finite() {
        return Err(MlaError::invalid_argument(format!(
            "sm_scale must be finite, got {sm_scale}"
        )));
    }
    Ok(())
}
