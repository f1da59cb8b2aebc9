//! edgesync core – snapshot format, search-only HNSW, SIMD similarity and MMR re-ranking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          MMR re-ranker (relevance vs. diversity)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │     HNSW graph search (prebuilt graph, no construction)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │      Snapshot format (EDGSNAP1, 64-byte aligned header)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │          SIMD kernels (NEON · AVX2+FMA · scalar)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod format;
pub mod hnsw;
pub mod mmr;
pub mod record;
pub mod simd;

pub use format::{
    apply_delta, apply_delta_to, sha256_hex, verify_sha256, FormatError, SnapshotHeader, SnapshotView,
    SnapshotWriter,
};
pub use hnsw::{GraphError, HnswGraph};
pub use mmr::{MmrCandidate, MmrReranker};
pub use record::{now_millis, EmbeddingRecord, RecordId, RecordMeta};
pub use simd::{cosine_similarity, dot_product, l2_normalized};
