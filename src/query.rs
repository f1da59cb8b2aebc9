//! Merged search over the mutable and immutable stores.

use std::collections::HashMap;
use std::sync::Arc;

use edgesync_core::simd::{is_finite, l2_norm};
use edgesync_core::{l2_normalized, MmrCandidate, MmrReranker, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::store::{Candidate, ImmutableHandle, MutableStore, Source};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: RecordId,
    /// Cosine similarity to the query.
    pub score: f32,
    pub captured_at: u64,
    pub payload: Value,
    pub source: Source,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Snapshot the immutable half was answered from.
    pub snapshot_version: Option<u64>,
    /// No snapshot installed: only the mutable store was searched.
    pub degraded: bool,
}

pub struct QueryMerger {
    mutable: Arc<MutableStore>,
    immutable: Arc<ImmutableHandle>,
    dim: usize,
    overfetch: usize,
    ef: usize,
    max_candidates: usize,
    reranker: MmrReranker,
}

impl QueryMerger {
    pub fn new(config: &EdgeConfig, mutable: Arc<MutableStore>, immutable: Arc<ImmutableHandle>) -> Self {
        Self {
            mutable,
            immutable,
            dim: config.dim,
            overfetch: config.search_overfetch.max(1),
            ef: config.search_ef,
            max_candidates: config.mmr_max_candidates,
            reranker: MmrReranker::new(config.mmr_lambda),
        }
    }

    /// Top-`k` over both stores, re-ranked for diversity.
    ///
    /// Both stores are queried in parallel against one pinned snapshot. When an
    /// id shows up in both, the immutable hit wins.
    pub fn search(&self, query: &[f32], k: usize) -> Result<SearchResponse> {
        if query.len() != self.dim {
            return Err(EdgeError::dimension_mismatch(self.dim, query.len()));
        }
        if !is_finite(query) || l2_norm(query) == 0.0 {
            return Err(EdgeError::InvalidInput(
                "query vector must be finite and non-zero".into(),
            ));
        }

        // pin the snapshot under the mutable read lock: a prune always follows
        // its publish, so records can't fall between the two stores
        let mutable = self.mutable.read();
        let snapshot = self.immutable.load();
        let snapshot_version = snapshot.as_ref().map(|s| s.version());
        let degraded = snapshot.is_none();
        if k == 0 {
            return Ok(SearchResponse {
                hits: Vec::new(),
                snapshot_version,
                degraded,
            });
        }

        let query = l2_normalized(query);
        let fetch = k.saturating_mul(self.overfetch).min(self.max_candidates).max(k);
        let (from_mutable, from_immutable) = rayon::join(
            || mutable.search(&query, fetch),
            || {
                snapshot
                    .as_ref()
                    .map(|s| s.search(&query, fetch, self.ef))
                    .unwrap_or_default()
            },
        );

        drop(mutable);

        let candidates = merge_candidates(from_mutable, from_immutable, self.max_candidates.max(k));
        let mmr_input: Vec<MmrCandidate<'_>> = candidates
            .iter()
            .map(|c| MmrCandidate {
                relevance: c.score,
                vector: &c.vector,
                captured_at: c.captured_at,
            })
            .collect();
        let picked = self.reranker.select(&mmr_input, k);

        let hits = picked
            .into_iter()
            .map(|(i, _)| {
                let c = &candidates[i];
                SearchHit {
                    id: c.id,
                    score: c.score,
                    captured_at: c.captured_at,
                    payload: c.payload.clone(),
                    source: c.source,
                }
            })
            .collect();

        Ok(SearchResponse {
            hits,
            snapshot_version,
            degraded,
        })
    }
}

/// Union by id (immutable authoritative), ordered by score, then recency,
/// then id, and capped at `limit`.
fn merge_candidates(mutable: Vec<Candidate>, immutable: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    let mut by_id: HashMap<RecordId, Candidate> = HashMap::with_capacity(mutable.len() + immutable.len());
    for c in mutable {
        by_id.insert(c.id, c);
    }
    for c in immutable {
        by_id.insert(c.id, c);
    }
    let mut merged: Vec<Candidate> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.captured_at.cmp(&a.captured_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    merged.truncate(limit);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cand(id: u128, score: f32, captured_at: u64, source: Source) -> Candidate {
        Candidate {
            id: Uuid::from_u128(id),
            score,
            captured_at,
            payload: Value::Null,
            vector: vec![1.0, 0.0],
            source,
        }
    }

    #[test]
    fn immutable_score_wins_for_shared_ids() {
        let merged = merge_candidates(
            vec![cand(1, 0.9, 10, Source::Mutable), cand(2, 0.5, 10, Source::Mutable)],
            vec![cand(1, 0.6, 10, Source::Immutable)],
            10,
        );
        assert_eq!(merged.len(), 2);
        let shared = merged.iter().find(|c| c.id == Uuid::from_u128(1)).unwrap();
        assert_eq!(shared.source, Source::Immutable);
        assert_eq!(shared.score, 0.6);
    }

    #[test]
    fn ties_order_by_recency_then_id() {
        let merged = merge_candidates(
            vec![
                cand(3, 0.7, 5, Source::Mutable),
                cand(1, 0.7, 5, Source::Mutable),
                cand(2, 0.7, 9, Source::Mutable),
            ],
            Vec::new(),
            10,
        );
        let ids: Vec<u128> = merged.iter().map(|c| c.id.as_u128()).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn merge_respects_limit() {
        let merged = merge_candidates(
            (0..5).map(|i| cand(i, i as f32 / 10.0, 0, Source::Mutable)).collect(),
            Vec::new(),
            2,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id.as_u128(), 4);
    }

    fn merger(dim: usize) -> (QueryMerger, Arc<MutableStore>) {
        let config = EdgeConfig::from_data_dir("unused".into(), dim);
        let mutable = Arc::new(MutableStore::new(dim, 1024));
        let merger = QueryMerger::new(&config, mutable.clone(), Arc::new(ImmutableHandle::default()));
        (merger, mutable)
    }

    #[test]
    fn zero_k_and_bad_queries() {
        let (merger, _) = merger(2);
        let empty = merger.search(&[1.0, 0.0], 0).unwrap();
        assert!(empty.hits.is_empty());
        assert!(empty.degraded);
        assert_eq!(merger.search(&[1.0], 3).unwrap_err().code(), "bad_request");
        assert_eq!(merger.search(&[0.0, 0.0], 3).unwrap_err().code(), "bad_request");
        assert_eq!(merger.search(&[f32::NAN, 1.0], 3).unwrap_err().code(), "bad_request");
    }

    #[test]
    fn mutable_only_when_no_snapshot() {
        let (merger, mutable) = merger(2);
        let r = edgesync_core::EmbeddingRecord::new(vec![1.0, 0.0], Value::Null);
        mutable.insert(r.clone()).unwrap();
        let response = merger.search(&[2.0, 0.0], 3).unwrap();
        assert!(response.degraded);
        assert_eq!(response.snapshot_version, None);
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].id, r.id);
        assert!((response.hits[0].score - 1.0).abs() < 1e-6);
    }
}
