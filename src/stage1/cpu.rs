use rayon::prelude::*;

use super::{Stage1Inputs, Stage1Kernel, split_chunk_size, split_range};
use crate::error::MlaError;
use crate::layout::{indptr_at, row_owners};
use crate::tensor::Element;

/// Host implementation of the stage-1 kernel contract.
///
/// Reads the paged latent cache through `kv_indices`, applies the causal mask
/// aligned to the end of each request (query `i` of `s_q` sees keys
/// `j <= i + s_k - s_q`) and computes every non-empty split in `f32`. A split
/// whose keys are all masked for a row gets `lse = -inf` and a zero row.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceStage1;

impl ReferenceStage1 {
    pub fn new() -> Self {
        Self
    }
}

impl Stage1Kernel for ReferenceStage1 {
    fn name(&self) -> &str {
        "reference-cpu"
    }

    fn forward<T: Element, O: Element>(
        &self,
        inputs: &Stage1Inputs<'_, T>,
        partial_out: &mut [O],
        partial_lse: &mut [f32],
    ) -> Result<(), MlaError> {
        inputs.validate(partial_out.len(), partial_lse.len())?;

        let layout = inputs.layout;
        let num_splits = inputs.num_kv_splits;
        let num_heads = layout.num_heads;
        let lv = layout.value_head_dim;
        let owners = row_owners(inputs.qo_indptr, layout.total_query_tokens);

        partial_out
            .par_chunks_mut(num_splits * num_heads * lv)
            .zip(partial_lse.par_chunks_mut(num_splits * num_heads))
            .enumerate()
            .for_each(|(row, (out_row, lse_row))| {
                let b = owners[row];
                let qo_start = indptr_at(inputs.qo_indptr, b);
                let seqlen_q = indptr_at(inputs.qo_indptr, b + 1) - qo_start;
                let kv_start = indptr_at(inputs.kv_indptr, b);
                let kv_pages = indptr_at(inputs.kv_indptr, b + 1) - kv_start;
                let kv_tokens = layout.kv_tokens(inputs.kv_indptr, inputs.kv_last_page_lens, b);

                // Keys visible to this row under the end-aligned causal mask.
                let visible = (row - qo_start + kv_tokens + 1).saturating_sub(seqlen_q);
                let visible = visible.min(kv_tokens);

                let chunk = split_chunk_size(kv_pages, num_splits, inputs.min_chunk_size);
                let mut logits = Vec::new();
                for split in 0..num_splits {
                    let pages = split_range(kv_pages, split, chunk);
                    if pages.is_empty() {
                        continue;
                    }
                    let token_start = pages.start * layout.page_size;
                    let token_end = (pages.end * layout.page_size).min(visible);

                    for h in 0..num_heads {
                        let slot = split * num_heads + h;
                        let out = &mut out_row[slot * lv..(slot + 1) * lv];
                        if token_end <= token_start {
                            out.fill(O::from_f32(0.0));
                            lse_row[slot] = f32::NEG_INFINITY;
                            continue;
                        }
                        lse_row[slot] = attend_split(
                            inputs,
                            row,
                            h,
                            kv_start,
                            token_start..token_end,
                            &mut logits,
                            out,
                        );
                    }
                }
            });
        Ok(())
    }
}

/// Attention of one (row, head) over `tokens`; returns the split's lse.
fn attend_split<T: Element, O: Element>(
    inputs: &Stage1Inputs<'_, T>,
    row: usize,
    head: usize,
    kv_start: usize,
    tokens: std::ops::Range<usize>,
    logits: &mut Vec<f32>,
    out: &mut [O],
) -> f32 {
    let layout = inputs.layout;
    let d = layout.qk_head_dim;
    let lv = layout.value_head_dim;
    let kv_head = head / layout.group_size();
    let q_offset = (row * layout.num_heads + head) * d;
    let q = &inputs.q.data[q_offset..q_offset + d];

    logits.clear();
    let mut max_logit = f32::NEG_INFINITY;
    for t in tokens.clone() {
        let k = kv_row(inputs, kv_start, t, kv_head);
        let dot: f32 = q
            .iter()
            .zip(k)
            .map(|(&a, &b)| a.to_f32() * b.to_f32())
            .sum();
        let logit = dot * inputs.sm_scale;
        max_logit = max_logit.max(logit);
        logits.push(logit);
    }

    let mut acc = vec![0.0_f32; lv];
    let mut sum = 0.0_f32;
    for (t, &logit) in tokens.zip(logits.iter()) {
        let p = (logit - max_logit).exp();
        sum += p;
        let v = &kv_row(inputs, kv_start, t, kv_head)[..lv];
        for (a, &x) in acc.iter_mut().zip(v) {
            *a += p * x.to_f32();
        }
    }

    for (o, a) in out.iter_mut().zip(acc) {
        *o = O::from_f32(a / sum);
    }
    max_logit + sum.ln()
}

/// Latent row of logical token `t` of the request starting at `kv_start`.
#[inline]
fn kv_row<'a, T>(inputs: &Stage1Inputs<'a, T>, kv_start: usize, t: usize, kv_head: usize) -> &'a [T] {
    let layout = inputs.layout;
    let page = inputs.kv_indices[kv_start + t / layout.page_size] as usize;
    let slot = t % layout.page_size;
    let d = layout.qk_head_dim;
    let offset = ((page * layout.page_size + slot) * layout.num_kv_heads + kv_head) * d;
    &inputs.kv_buffer.data[offset..offset + d]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BatchLayout;
    use crate::stage1::Stage1Mode;
    use crate::tensor::{Tensor3D, Tensor4D};

    #[test]
    fn single_key_split_copies_value_row() {
        // One request, one query, one KV token: softmax weight is exactly 1.
        let q = vec![1.0_f32, 0.0, 0.0, 0.0];
        let kv = vec![0.5_f32, -2.0, 3.0, 7.0];
        let qo_indptr = [0, 1];
        let kv_indptr = [0, 1];
        let kv_indices = [0];
        let last = [1];
        let q_view = Tensor3D::new(&q, 1, 1, 4);
        let kv_view = Tensor4D::new(&kv, 1, 1, 1, 4);
        let layout = BatchLayout::resolve(
            &q_view, &kv_view, [1, 1, 3], &qo_indptr, &kv_indptr, &kv_indices, &last, 1,
        )
        .expect("layout");
        let inputs = Stage1Inputs {
            q: q_view,
            kv_buffer: kv_view,
            qo_indptr: &qo_indptr,
            kv_indptr: &kv_indptr,
            kv_indices: &kv_indices,
            kv_last_page_lens: &last,
            max_seqlen_q: 1,
            sm_scale: 1.0,
            layout,
            num_kv_splits: 2,
            min_chunk_size: 1,
            mode: Stage1Mode::Decode,
        };
        let mut out = vec![9.0_f32; inputs.partial_out_len().expect("len")];
        let mut lse = vec![9.0_f32; inputs.partial_lse_len().expect("len")];
        ReferenceStage1.forward(&inputs, &mut out, &mut lse).expect("forward");

        assert_eq!(&out[..3], &[0.5, -2.0, 3.0]);
        assert!((lse[0] - 0.5).abs() < 1e-6);
        // Split 1 covers no KV entries and is never written.
        assert_eq!(&out[3..], &[9.0, 9.0, 9.0]);
        assert_eq!(lse[1], 9.0);
    }
}
