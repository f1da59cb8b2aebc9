//! Unindexed store for records captured since the last snapshot swap.

use std::collections::{HashMap, HashSet};

use edgesync_core::{dot_product, EmbeddingRecord, RecordId};
use parking_lot::{RwLock, RwLockReadGuard};
use rayon::prelude::*;

use super::{top_k, Candidate, Source};
use crate::error::{EdgeError, Result};

#[derive(Default)]
struct Inner {
    records: Vec<EmbeddingRecord>,
    by_id: HashMap<RecordId, usize>,
}

/// Insertion-ordered records searched by exact brute force.
///
/// Only [`MutableStore::remove_covered`] ever removes anything, and it does so
/// under the write lock so a query sees the store either before or after a
/// prune, never halfway.
pub struct MutableStore {
    dim: usize,
    parallel_min: usize,
    inner: RwLock<Inner>,
}

impl MutableStore {
    pub fn new(dim: usize, parallel_min: usize) -> Self {
        Self {
            dim,
            parallel_min: parallel_min.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns `false` if a record with the same id is already present.
    pub fn insert(&self, record: EmbeddingRecord) -> Result<bool> {
        if record.dim() != self.dim {
            return Err(EdgeError::dimension_mismatch(self.dim, record.dim()));
        }
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&record.id) {
            return Ok(false);
        }
        let ordinal = inner.records.len();
        inner.by_id.insert(record.id, ordinal);
        inner.records.push(record);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    pub fn get(&self, id: &RecordId) -> Option<EmbeddingRecord> {
        let inner = self.inner.read();
        inner.by_id.get(id).map(|&i| inner.records[i].clone())
    }

    /// Ids present right now. Inserts after this call are not included.
    pub fn freeze_ids(&self) -> HashSet<RecordId> {
        self.inner.read().by_id.keys().copied().collect()
    }

    /// Remove every record whose id `covered` accepts. Returns how many went.
    pub fn remove_covered<F>(&self, covered: F) -> usize
    where
        F: Fn(&RecordId) -> bool,
    {
        let mut inner = self.inner.write();
        let before = inner.records.len();
        inner.records.retain(|r| !covered(&r.id));
        let removed = before - inner.records.len();
        if removed > 0 {
            let by_id = inner
                .records
                .iter()
                .enumerate()
                .map(|(i, r)| (r.id, i))
                .collect();
            inner.by_id = by_id;
        }
        removed
    }

    /// Exact top-`limit` by dot product. `query` must be unit length.
    pub fn search(&self, query: &[f32], limit: usize) -> Vec<Candidate> {
        self.read().search(query, limit)
    }

    /// Hold the read lock across several operations. A prune cannot start
    /// until the view is dropped.
    pub fn read(&self) -> MutableView<'_> {
        MutableView {
            dim: self.dim,
            parallel_min: self.parallel_min,
            inner: self.inner.read(),
        }
    }
}

pub struct MutableView<'a> {
    dim: usize,
    parallel_min: usize,
    inner: RwLockReadGuard<'a, Inner>,
}

impl MutableView<'_> {
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    pub fn search(&self, query: &[f32], limit: usize) -> Vec<Candidate> {
        if limit == 0 || query.len() != self.dim {
            return Vec::new();
        }
        let records = &self.inner.records;
        let hits = if records.len() >= self.parallel_min {
            let scored: Vec<(usize, f32, u64)> = records
                .par_iter()
                .enumerate()
                .map(|(i, r)| (i, dot_product(query, &r.vector), r.captured_at))
                .collect();
            top_k(scored, limit)
        } else {
            top_k(
                records
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (i, dot_product(query, &r.vector), r.captured_at)),
                limit,
            )
        };

        hits.into_iter()
            .map(|(i, score)| {
                let r = &records[i];
                Candidate {
                    id: r.id,
                    score,
                    captured_at: r.captured_at,
                    payload: r.payload.clone(),
                    vector: r.vector.clone(),
                    source: Source::Mutable,
                }
            })
            .collect()
    }
}
