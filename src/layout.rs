use crate::error::MlaError;
use crate::tensor::{Element, Tensor3D, Tensor4D};

/// Batch geometry derived from the offset arrays and tensor shapes of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLayout {
    /// Number of requests, `qo_indptr.len() - 1`.
    pub batch_size: usize,
    /// Flattened query rows, `qo_indptr[batch_size]`.
    pub total_query_tokens: usize,
    /// Flattened KV page entries, `kv_indptr[batch_size]`.
    pub total_kv_entries: usize,
    /// Query/output heads.
    pub num_heads: usize,
    /// Query feature width; equals the KV buffer feature width.
    pub qk_head_dim: usize,
    /// Output (value) feature width, `Lv`.
    pub value_head_dim: usize,
    /// Physical pages in the KV buffer.
    pub num_pages: usize,
    /// Token slots per page.
    pub page_size: usize,
    /// KV heads in the buffer; `num_heads` must be a multiple of it.
    pub num_kv_heads: usize,
    /// Upper bound on per-request query length.
    pub max_seqlen_q: usize,
}

impl BatchLayout {
    #[allow(clippy::too_many_arguments)]
    pub fn resolve<T: Element>(
        q: &Tensor3D<'_, T>,
        kv_buffer: &Tensor4D<'_, T>,
        out_dims: [usize; 3],
        qo_indptr: &[i32],
        kv_indptr: &[i32],
        kv_indices: &[i32],
        kv_last_page_lens: &[i32],
        max_seqlen_q: usize,
    ) -> Result<Self, MlaError> {
        q.validate("q")?;
        kv_buffer.validate("kv_buffer")?;

        let batch_size = validate_indptr("qo_indptr", qo_indptr)?;
        let kv_batch_size = validate_indptr("kv_indptr", kv_indptr)?;
        if kv_batch_size != batch_size {
            return Err(MlaError::shape_mismatch(
                "kv_indptr",
                format!("batch_size {batch_size}"),
                format!("batch_size {kv_batch_size}"),
            ));
        }

        let [total_q, num_heads, qk_head_dim] = q.dims();
        let [num_pages, page_size, num_kv_heads, kv_head_dim] = kv_buffer.dims();
        let [out_tokens, out_heads, value_head_dim] = out_dims;

        if out_tokens != total_q || out_heads != num_heads {
            return Err(MlaError::shape_mismatch(
                "out",
                [total_q, num_heads, value_head_dim],
                out_dims,
            ));
        }
        if value_head_dim == 0 {
            return Err(MlaError::invalid_argument("out head dim must be positive"));
        }
        if kv_head_dim != qk_head_dim {
            return Err(MlaError::shape_mismatch(
                "kv_buffer",
                format!("feature dim {qk_head_dim} (from q)"),
                format!("feature dim {kv_head_dim}"),
            ));
        }
        if value_head_dim > kv_head_dim {
            return Err(MlaError::shape_mismatch(
                "out",
                format!("value head dim <= {kv_head_dim}"),
                value_head_dim,
            ));
        }
        if num_heads % num_kv_heads != 0 {
            return Err(MlaError::invalid_argument(format!(
                "num_heads ({num_heads}) must be divisible by num_kv_heads ({num_kv_heads})"
            )));
        }

        let total_query_tokens = indptr_at(qo_indptr, batch_size);
        if total_query_tokens != total_q {
            return Err(MlaError::shape_mismatch(
                "qo_indptr",
                format!("last offset {total_q} (q rows)"),
                total_query_tokens,
            ));
        }

        let total_kv_entries = indptr_at(kv_indptr, batch_size);
        if total_kv_entries != kv_indices.len() {
            return Err(MlaError::shape_mismatch(
                "kv_indptr",
                format!("last offset {} (kv_indices length)", kv_indices.len()),
                total_kv_entries,
            ));
        }
        if let Some(bad) = kv_indices
            .iter()
            .find(|&&page| page < 0 || page as usize >= num_pages)
        {
            return Err(MlaError::invalid_argument(format!(
                "kv_indices entry {bad} is outside [0, {num_pages})"
            )));
        }

        if kv_last_page_lens.len() != batch_size {
            return Err(MlaError::shape_mismatch(
                "kv_last_page_lens",
                batch_size,
                kv_last_page_lens.len(),
            ));
        }
        if let Some(bad) = kv_last_page_lens
            .iter()
            .find(|&&len| len < 0 || len as usize > page_size)
        {
            return Err(MlaError::invalid_argument(format!(
                "kv_last_page_lens entry {bad} is outside [0, {page_size}]"
            )));
        }

        if max_seqlen_q == 0 {
            return Err(MlaError::invalid_argument("max_seqlen_q must be positive"));
        }
        let longest = (0..batch_size)
            .map(|b| indptr_at(qo_indptr, b + 1) - indptr_at(qo_indptr, b))
            .max()
            .unwrap_or(0);
        if longest > max_seqlen_q {
            return Err(MlaError::invalid_argument(format!(
                "max_seqlen_q ({max_seqlen_q}) is smaller than the longest query range ({longest})"
            )));
        }

        Ok(Self {
            batch_size,
            total_query_tokens,
            total_kv_entries,
            num_heads,
            qk_head_dim,
            value_head_dim,
            num_pages,
            page_size,
            num_kv_heads,
            max_seqlen_q,
        })
    }

    /// Query heads sharing one KV head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Token count held by request `b`, honouring a partially filled last page.
    pub fn kv_tokens(&self, kv_indptr: &[i32], kv_last_page_lens: &[i32], b: usize) -> usize {
        let pages = indptr_at(kv_indptr, b + 1) - indptr_at(kv_indptr, b);
        if pages == 0 {
            return 0;
        }
        (pages - 1) * self.page_size + kv_last_page_lens[b] as usize
    }
}

/// Reads an offset from an indptr already accepted by [`validate_indptr`].
#[inline]
pub(crate) fn indptr_at(indptr: &[i32], i: usize) -> usize {
    indptr[i] as usize
}

/// Request index owning each flattened query row.
pub(crate) fn row_owners(qo_indptr: &[i32], total_rows: usize) -> Vec<usize> {
    let mut owners = vec![0_usize; total_rows];
    for b in 0..qo_indptr.len().saturating_sub(1) {
        let start = indptr_at(qo_indptr, b);
        let end = indptr_at(qo_indptr, b + 1);
        owners[start..end].fill(b);
    }
    owners
}

pub(crate) fn validate_indptr(name: &str, indptr: &[i32]) -> Result<usize, MlaError> {
    if indptr.len() < 2 {
        return Err(MlaError::invalid_argument(format!(
            "{name} length must be at least 2"
        )));
    }
    if indptr[0] != 0 {
        return Err(MlaError::invalid_argument(format!("{name}[0] must be 0")));
    }
    for window in indptr.windows(2) {
        if window[1] < window[0] {
            return Err(MlaError::invalid_argument(format!(
                "{name} must be non-decreasing",
            )));
        }
    }
    Ok(indptr.len() - 1)
}
