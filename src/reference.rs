use crate::error::MlaError;
use crate::layout::{BatchLayout, indptr_at};
use crate::tensor::{Element, Tensor3D, Tensor4D};

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceOutput {
    /// `[total_q, num_heads, value_head_dim]`.
    pub out: Vec<f32>,
    /// `[total_q, num_heads]`; `-inf` for rows with no visible keys.
    pub lse: Vec<f32>,
}

/// Full causal softmax per `(q, h)` in `f64`, gathered through the page table.
#[allow(clippy::too_many_arguments)]
pub fn masked_attention<T: Element>(
    q: &Tensor3D<'_, T>,
    kv_buffer: &Tensor4D<'_, T>,
    qo_indptr: &[i32],
    kv_indptr: &[i32],
    kv_indices: &[i32],
    kv_last_page_lens: &[i32],
    value_head_dim: usize,
    sm_scale: f32,
) -> Result<ReferenceOutput, MlaError> {
    let layout = BatchLayout::resolve(
        q,
        kv_buffer,
        [q.dim0, q.dim1, value_head_dim],
        qo_indptr,
        kv_indptr,
        kv_indices,
        kv_last_page_lens,
        q.dim0,
    )?;

    let num_heads = layout.num_heads;
    let d = layout.qk_head_dim;
    let lv = value_head_dim;
    let mut out = vec![0.0_f32; layout.total_query_tokens * num_heads * lv];
    let mut lse = vec![f32::NEG_INFINITY; layout.total_query_tokens * num_heads];

    for b in 0..layout.batch_size {
        let qo_start = indptr_at(qo_indptr, b);
        let seqlen_q = indptr_at(qo_indptr, b + 1) - qo_start;
        let kv_start = indptr_at(kv_indptr, b);
        let seqlen_k = layout.kv_tokens(kv_indptr, kv_last_page_lens, b);

        for i in 0..seqlen_q {
            let row = qo_start + i;
            let visible = (i + seqlen_k + 1).saturating_sub(seqlen_q).min(seqlen_k);
            if visible == 0 {
                continue;
            }
            for h in 0..num_heads {
                let kv_head = h / layout.group_size();
                let q_row = &q.data[(row * num_heads + h) * d..][..d];
                let keys: Vec<&[T]> = (0..visible)
                    .map(|t| {
                        let page = kv_indices[kv_start + t / layout.page_size] as usize;
                        let slot = t % layout.page_size;
                        let offset =
                            ((page * layout.page_size + slot) * layout.num_kv_heads + kv_head) * d;
                        &kv_buffer.data[offset..offset + d]
                    })
                    .collect();

                let logits: Vec<f64> = keys
                    .iter()
                    .map(|k| {
                        let dot: f64 = q_row
                            .iter()
                            .zip(k.iter())
                            .map(|(&a, &b)| a.to_f32() as f64 * b.to_f32() as f64)
                            .sum();
                        dot * sm_scale as f64
                    })
                    .collect();
                let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let weights: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
                let sum: f64 = weights.iter().sum();

                let dst = &mut out[(row * num_heads + h) * lv..][..lv];
                for (c, o) in dst.iter_mut().enumerate() {
                    let v: f64 = keys
                        .iter()
                        .zip(&weights)
                        .map(|(k, w)| w * k[c].to_f32() as f64)
                        .sum();
                    *o = (v / sum) as f32;
                }
                lse[row * num_heads + h] = (max + sum.ln()) as f32;
            }
        }
    }

    Ok(ReferenceOutput { out, lse })
}
