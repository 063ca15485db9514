use rayon::prelude::*;

use crate::config::LaunchConfig;
use crate::error::MlaError;
use crate::heuristic::MAX_KV_SPLITS;
use crate::layout::{BatchLayout, indptr_at, row_owners, validate_indptr};
use crate::stage1::{split_chunk_size, split_range};
use crate::tensor::Element;

/// Running state of one output row. Always `f32`.
///
/// ```text
/// m' = max(m, lse_s)
/// acc = acc * exp(m - m') + exp(lse_s - m') * o_s
/// sum = sum * exp(m - m') + exp(lse_s - m')
/// ```
#[derive(Debug, Clone)]
pub struct OnlineSoftmax {
    e_max: f32,
    e_sum: f32,
    acc: Vec<f32>,
}

impl OnlineSoftmax {
    /// `lanes` is the padded accumulator width (`LaunchConfig::block_dv`).
    pub fn new(lanes: usize) -> Self {
        Self {
            e_max: f32::NEG_INFINITY,
            e_sum: 0.0,
            acc: vec![0.0; lanes],
        }
    }

    pub fn reset(&mut self) {
        self.e_max = f32::NEG_INFINITY;
        self.e_sum = 0.0;
        self.acc.fill(0.0);
    }

    /// Folds one partial result into the running state.
    ///
    /// `partial` may be shorter than the accumulator; missing lanes count as
    /// zero. A contribution with `lse == -inf` carries no weight and is ignored.
    #[inline]
    pub fn merge(&mut self, lse: f32, partial: &[f32]) {
        if lse == f32::NEG_INFINITY {
            return;
        }
        let new_max = lse.max(self.e_max);
        let old_scale = (self.e_max - new_max).exp();
        let weight = (lse - new_max).exp();

        let (head, tail) = self.acc.split_at_mut(partial.len());
        for (a, &x) in head.iter_mut().zip(partial) {
            *a = *a * old_scale + weight * x;
        }
        for a in tail {
            *a *= old_scale;
        }

        self.e_sum = self.e_sum * old_scale + weight;
        self.e_max = new_max;
    }

    /// Writes the normalised row into `out` (masked to `out.len()` lanes) and
    /// returns the aggregate log-sum-exp.
    ///
    /// With nothing merged the row is zero and the lse is `-inf`.
    pub fn finish<O: Element>(&self, out: &mut [O]) -> f32 {
        if self.e_sum == 0.0 {
            out.fill(O::from_f32(0.0));
            return f32::NEG_INFINITY;
        }
        for (o, &a) in out.iter_mut().zip(&self.acc) {
            *o = O::from_f32(a / self.e_sum);
        }
        self.e_max + self.e_sum.ln()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceParams {
    pub num_kv_splits: usize,
    pub min_chunk_size: usize,
    pub launch: LaunchConfig,
}

/// Combines stage-1 partials into `out` (`[total_q, num_heads, Lv]`) and
/// `lse_out` (`[total_q, num_heads]`).
///
/// `partial_out` is `[total_q, num_kv_splits, num_heads, Lv]` and
/// `partial_lse` is `[total_q, num_kv_splits, num_heads]`. Slots of empty
/// splits are never read.
#[allow(clippy::too_many_arguments)]
pub fn reduce_partials<O: Element>(
    partial_out: &[f32],
    partial_lse: &[f32],
    qo_indptr: &[i32],
    kv_indptr: &[i32],
    layout: &BatchLayout,
    params: &ReduceParams,
    out: &mut [O],
    lse_out: &mut [f32],
) -> Result<(), MlaError> {
    let total_q = layout.total_query_tokens;
    let num_heads = layout.num_heads;
    let lv = layout.value_head_dim;
    let num_splits = params.num_kv_splits;

    if num_splits == 0 || num_splits > MAX_KV_SPLITS {
        return Err(MlaError::invalid_argument(format!(
            "num_kv_splits ({num_splits}) must be in 1..={MAX_KV_SPLITS}"
        )));
    }
    params.launch.validate(lv)?;
    check_len(
        "partial_out",
        partial_out.len(),
        element_count("partial_out", &[total_q, num_splits, num_heads, lv])?,
    )?;
    check_len(
        "partial_lse",
        partial_lse.len(),
        element_count("partial_lse", &[total_q, num_splits, num_heads])?,
    )?;
    check_len("out", out.len(), element_count("out", &[total_q, num_heads, lv])?)?;
    check_len("lse", lse_out.len(), element_count("lse", &[total_q, num_heads])?)?;
    let batch_size = validate_indptr("qo_indptr", qo_indptr)?;
    if batch_size != layout.batch_size || validate_indptr("kv_indptr", kv_indptr)? != batch_size {
        return Err(MlaError::invalid_argument(format!(
            "indptr lengths must equal batch_size + 1 ({})",
            layout.batch_size + 1
        )));
    }
    if indptr_at(qo_indptr, batch_size) != total_q {
        return Err(MlaError::shape_mismatch(
            "qo_indptr",
            format!("last offset {total_q}"),
            qo_indptr[batch_size],
        ));
    }

    let owners = row_owners(qo_indptr, total_q);
    let block_dv = params.launch.block_dv;

    out.par_chunks_mut(num_heads * lv)
        .zip(lse_out.par_chunks_mut(num_heads))
        .enumerate()
        .with_min_len(params.launch.min_rows_per_task)
        .for_each_init(
            || OnlineSoftmax::new(block_dv),
            |state, (row, (out_row, lse_row))| {
                let b = owners[row];
                let kv_len = indptr_at(kv_indptr, b + 1) - indptr_at(kv_indptr, b);
                let chunk = split_chunk_size(kv_len, num_splits, params.min_chunk_size);
                let row_base = row * num_splits * num_heads;

                for h in 0..num_heads {
                    state.reset();
                    for split in 0..num_splits {
                        if split_range(kv_len, split, chunk).is_empty() {
                            continue;
                        }
                        let slot = row_base + split * num_heads + h;
                        state.merge(partial_lse[slot], &partial_out[slot * lv..(slot + 1) * lv]);
                    }
                    lse_row[h] = state.finish(&mut out_row[h * lv..(h + 1) * lv]);
                }
            },
        );
    Ok(())
}

fn element_count(name: &str, dims: &[usize]) -> Result<usize, MlaError> {
    dims.iter()
        .try_fold(1_usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| MlaError::invalid_argument(format!("{name} element count overflows")))
}

fn check_len(name: &'static str, found: usize, expected: usize) -> Result<(), MlaError> {
    if found != expected {
        return Err(MlaError::shape_mismatch(name, expected, found));
    }
    Ok(())
}
