//! The two searchable stores.
//!
//! [`MutableStore`] holds records captured since the last swap and is scanned
//! exactly. [`ImmutableStore`] is one installed server snapshot, searched
//! through its prebuilt graph and replaced wholesale through [`ImmutableHandle`].

pub mod immutable;
pub mod mutable;

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use edgesync_core::RecordId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use immutable::{
    install_snapshot, install_snapshot_file, read_manifest, sweep_snapshot_dir, write_manifest,
    ImmutableHandle, ImmutableStore, SnapshotManifest,
};
pub use mutable::{MutableStore, MutableView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Mutable,
    Immutable,
}

/// A store hit, carrying what the merger needs to re-rank and answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: RecordId,
    pub score: f32,
    pub captured_at: u64,
    pub payload: Value,
    pub vector: Vec<f32>,
    pub source: Source,
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    ordinal: usize,
    score: f32,
    captured_at: u64,
}

impl Scored {
    /// Best first: higher score, then the more recent capture, then the lower ordinal.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.captured_at.cmp(&self.captured_at))
            .then_with(|| self.ordinal.cmp(&other.ordinal))
    }
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    // the weakest kept hit sits at the top of the heap
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

/// Keep the `k` best `(ordinal, score, captured_at)` hits as `(ordinal, score)`,
/// best first. Equal scores go to the most recent capture.
pub(crate) fn top_k<I>(scored: I, k: usize) -> Vec<(usize, f32)>
where
    I: IntoIterator<Item = (usize, f32, u64)>,
{
    if k == 0 {
        return Vec::new();
    }
    let mut heap = BinaryHeap::with_capacity(k + 1);
    for (ordinal, score, captured_at) in scored {
        if score.is_nan() {
            continue;
        }
        heap.push(Scored {
            ordinal,
            score,
            captured_at,
        });
        if heap.len() > k {
            heap.pop();
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|s| (s.ordinal, s.score))
        .collect()
}
