use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::MlaError;

/// Fixed per-split cost, in KV entries.
pub const SPLIT_OVERHEAD: f64 = 84.1;
/// Largest split count the heuristic picks or an override may request.
pub const MAX_KV_SPLITS: usize = 16;
/// Minimum chunk used for single-token decode with 16 heads.
pub const SINGLE_TOKEN_MIN_CHUNK: usize = 64;

/// `(num_heads, min_chunk_size)` policy table.
const MIN_CHUNK_POLICY: [(usize, usize); 2] = [(16, 16), (128, 16)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SplitKey {
    /// Caller override; bypasses the occupancy model when set.
    pub requested_splits: Option<usize>,
    pub batch_size: usize,
    pub total_kv: usize,
    pub num_heads: usize,
    pub max_seqlen_q: usize,
    pub compute_units: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitDecision {
    pub num_kv_splits: usize,
    /// Floor on the KV entries each split covers ("mgc").
    pub min_chunk_size: usize,
}

/// Looks up the minimum chunk size for a head count.
pub fn min_chunk_size(num_heads: usize, max_seqlen_q: usize) -> Result<usize, MlaError> {
    let mgc = MIN_CHUNK_POLICY
        .iter()
        .find(|(heads, _)| *heads == num_heads)
        .map(|(_, mgc)| *mgc)
        .ok_or(MlaError::UnsupportedHeadCount { num_heads })?;
    if max_seqlen_q == 1 && num_heads == 16 {
        return Ok(SINGLE_TOKEN_MIN_CHUNK);
    }
    Ok(mgc)
}

/// Picks the split count in `1..=MAX_KV_SPLITS` with the best modelled
/// utilisation. Ties keep the smallest count.
pub fn choose_num_splits(batch_size: usize, total_kv: usize, compute_units: usize) -> usize {
    let avg_kv = total_kv as f64 / batch_size as f64;
    let mut best = (f64::NEG_INFINITY, 1_usize);
    for splits in 1..=MAX_KV_SPLITS {
        let score = split_score(batch_size, avg_kv, splits, compute_units);
        if score > best.0 {
            best = (score, splits);
        }
    }
    best.1
}

fn split_score(batch_size: usize, avg_kv: f64, splits: usize, compute_units: usize) -> f64 {
    let work_items = batch_size * splits;
    let padded = work_items.div_ceil(compute_units) * compute_units;
    let occupancy = work_items as f64 / padded as f64;
    occupancy * avg_kv / (avg_kv + SPLIT_OVERHEAD * splits as f64)
}

/// Uncached split decision for one call shape.
pub fn resolve_splits(key: SplitKey) -> Result<SplitDecision, MlaError> {
    let min_chunk_size = min_chunk_size(key.num_heads, key.max_seqlen_q)?;
    if key.batch_size == 0 {
        return Err(MlaError::invalid_argument("batch_size must be positive"));
    }
    if key.compute_units == 0 {
        return Err(MlaError::invalid_argument("compute_units must be positive"));
    }
    let num_kv_splits = match key.requested_splits {
        Some(n) if n == 0 || n > MAX_KV_SPLITS => {
            return Err(MlaError::invalid_argument(format!(
                "num_kv_splits ({n}) must be in 1..={MAX_KV_SPLITS}"
            )));
        }
        Some(n) => n,
        None => choose_num_splits(key.batch_size, key.total_kv, key.compute_units),
    };
    Ok(SplitDecision {
        num_kv_splits,
        min_chunk_size,
    })
}

/// Memo of split decisions keyed by call shape.
///
/// Decisions are pure functions of [`SplitKey`], so concurrent inserts for the
/// same key agree and the first one wins.
#[derive(Debug, Default)]
pub struct SplitCache {
    entries: RwLock<HashMap<SplitKey, SplitDecision>>,
}

impl SplitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache used by the free-function entry points.
    pub fn global() -> Arc<SplitCache> {
        static GLOBAL_SPLIT_CACHE: OnceLock<Arc<SplitCache>> = OnceLock::new();
        Arc::clone(GLOBAL_SPLIT_CACHE.get_or_init(|| Arc::new(SplitCache::new())))
    }

    pub fn resolve(&self, key: SplitKey) -> Result<SplitDecision, MlaError> {
        {
            let entries = self
                .entries
                .read()
                .map_err(|_| MlaError::invalid_argument("split cache lock is poisoned"))?;
            if let Some(decision) = entries.get(&key) {
                tracing::trace!(?key, ?decision, "split cache hit");
                return Ok(*decision);
            }
        }

        let decision = resolve_splits(key)?;
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MlaError::invalid_argument("split cache lock is poisoned"))?;
        let decision = *entries.entry(key).or_insert(decision);
        tracing::debug!(
            batch_size = key.batch_size,
            total_kv = key.total_kv,
            num_heads = key.num_heads,
            max_seqlen_q = key.max_seqlen_q,
            compute_units = key.compute_units,
            num_kv_splits = decision.num_kv_splits,
            min_chunk_size = decision.min_chunk_size,
            "resolved split decision"
        );
        Ok(decision)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
