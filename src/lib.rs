//! edgesync: an edge-side vector store that keeps captures searchable while
//! they are shipped to a central indexer and swapped back in as snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP API (axum)                        │
//! │        /v1/search · /v1/frames · /v1/sync · /v1/stats       │
//! └─────────────────────────────────────────────────────────────┘
//!          │ capture                          │ query
//!          ▼                                  ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │ dedup → DurableQueue     │   │ QueryMerger (rayon::join,    │
//! │       → MutableStore     │   │ union by id, MMR re-rank)    │
//! └──────────────────────────┘   └──────────────────────────────┘
//!          │ background                       │
//!          ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Synchronizer: upload → fetch snapshot → swap ImmutableStore │
//! │        (ArcSwapOption, mmap, prune covered records)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod model;
pub mod query;
pub mod queue;
pub mod store;
pub mod sync;

pub use capture::{CaptureOutcome, CapturePipeline, EmbeddingProvider, Frame, HttpEmbeddingProvider};
pub use config::{EdgeConfig, DEFAULT_DIM};
pub use dedup::{DedupDecision, DedupFilter};
pub use engine::{EdgeEngine, EngineStats, RecoveryReport};
pub use error::{EdgeError, Result};
pub use query::{QueryMerger, SearchHit, SearchResponse};
pub use queue::{DurableQueue, QueueOptions, QueueStats};
pub use store::{ImmutableHandle, ImmutableStore, MutableStore, Source};
pub use sync::{
    CycleReport, HttpIndexingServer, IndexingServer, SnapshotPayload, SnapshotResponse,
    SwapReport, SyncHandle, SyncState, SyncStatus, Synchronizer,
};

pub use edgesync_core::{EmbeddingRecord, RecordId};
