#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgesync::capture::{EmbeddingProvider, Frame};
use edgesync::sync::{IndexingServer, SnapshotPayload, SnapshotResponse, UploadReceipt};
use edgesync::{EdgeConfig, EdgeError, Result};
use edgesync_core::hnsw::Node;
use edgesync_core::{l2_normalized, sha256_hex, EmbeddingRecord, HnswGraph, RecordId, SnapshotWriter};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Every node linked to every other on a single layer: exact search.
pub fn complete_graph(n: usize) -> HnswGraph {
    let nodes = (0..n)
        .map(|i| Node::new(i, vec![(0..n).filter(|&j| j != i).collect()]))
        .collect();
    HnswGraph::from_parts(nodes, (n > 0).then_some(0), 0, n.max(1)).expect("complete graph")
}

pub fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    l2_normalized(&v)
}

pub fn test_config(dir: &Path, dim: usize) -> EdgeConfig {
    let mut config = EdgeConfig::from_data_dir(dir.to_path_buf(), dim);
    config.sync_interval = Duration::from_millis(50);
    config.backoff_base = Duration::from_millis(5);
    config.backoff_max = Duration::from_millis(20);
    config.upload_timeout = Duration::from_secs(5);
    config.download_timeout = Duration::from_secs(5);
    // random test vectors must never collide as near-duplicates
    config.dedup_threshold = 0.9999;
    config
}

pub fn snapshot_bytes(dim: usize, version: u64, records: &[EmbeddingRecord]) -> Vec<u8> {
    let mut writer = SnapshotWriter::new(dim, version).with_graph(complete_graph(records.len()));
    for r in records {
        writer.push(r).expect("push record");
    }
    writer.finish().expect("finish snapshot")
}

#[derive(Default)]
struct ServerState {
    records: Vec<EmbeddingRecord>,
    /// (version, records covered) of everything published, oldest first.
    published: Vec<(u64, usize)>,
    upload_counts: HashMap<RecordId, usize>,
    fetches: Vec<Option<u64>>,
    fail_uploads: bool,
    fail_fetches: bool,
    publish_on_upload: bool,
    serve_deltas: bool,
    bogus_delta_once: bool,
}

/// Indexing server kept in memory. Snapshots carry a complete graph so
/// searches over them are exact.
pub struct InMemoryIndexingServer {
    dim: usize,
    state: Mutex<ServerState>,
    on_fetch: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl InMemoryIndexingServer {
    pub fn new(dim: usize) -> Arc<Self> {
        Arc::new(Self {
            dim,
            state: Mutex::new(ServerState::default()),
            on_fetch: Mutex::new(None),
        })
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.state.lock().fail_uploads = fail;
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.state.lock().fail_fetches = fail;
    }

    pub fn set_publish_on_upload(&self, on: bool) {
        self.state.lock().publish_on_upload = on;
    }

    pub fn set_serve_deltas(&self, on: bool) {
        self.state.lock().serve_deltas = on;
    }

    pub fn send_bogus_delta_once(&self) {
        self.state.lock().bogus_delta_once = true;
    }

    /// Runs inside every fetch, before the response is built.
    pub fn on_fetch(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_fetch.lock() = Some(Box::new(hook));
    }

    /// Index everything received so far as a new version.
    pub fn publish(&self) -> u64 {
        let mut state = self.state.lock();
        publish_locked(&mut state)
    }

    pub fn latest_version(&self) -> Option<u64> {
        self.state.lock().published.last().map(|(v, _)| *v)
    }

    pub fn upload_count(&self, id: &RecordId) -> usize {
        self.state.lock().upload_counts.get(id).copied().unwrap_or(0)
    }

    pub fn received(&self) -> Vec<RecordId> {
        self.state.lock().records.iter().map(|r| r.id).collect()
    }

    pub fn fetches(&self) -> Vec<Option<u64>> {
        self.state.lock().fetches.clone()
    }

    /// Ids covered by `version`.
    pub fn ids_at(&self, version: u64) -> Vec<RecordId> {
        let state = self.state.lock();
        let count = state
            .published
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        state.records[..count].iter().map(|r| r.id).collect()
    }
}

fn publish_locked(state: &mut ServerState) -> u64 {
    let version = state.published.last().map(|(v, _)| v + 1).unwrap_or(1);
    state.published.push((version, state.records.len()));
    version
}

#[async_trait]
impl IndexingServer for InMemoryIndexingServer {
    async fn upload(&self, records: &[EmbeddingRecord]) -> Result<UploadReceipt> {
        let mut state = self.state.lock();
        if state.fail_uploads {
            return Err(EdgeError::TransientIo("indexer unavailable".into()));
        }
        for r in records {
            *state.upload_counts.entry(r.id).or_default() += 1;
            if !state.records.iter().any(|have| have.id == r.id) {
                state.records.push(r.clone());
            }
        }
        if state.publish_on_upload {
            publish_locked(&mut state);
        }
        Ok(UploadReceipt {
            accepted: records.len(),
        })
    }

    async fn fetch_snapshot(&self, since: Option<u64>, dest: &Path) -> Result<SnapshotResponse> {
        if let Some(hook) = self.on_fetch.lock().as_ref() {
            hook();
        }
        let mut state = self.state.lock();
        state.fetches.push(since);
        if state.fail_fetches {
            return Err(EdgeError::TransientIo("indexer unavailable".into()));
        }
        let Some(&(version, count)) = state.published.last() else {
            return Ok(SnapshotResponse::UpToDate);
        };
        if since == Some(version) {
            return Ok(SnapshotResponse::UpToDate);
        }

        let base = since.and_then(|s| state.published.iter().find(|(v, _)| *v == s).copied());
        let (base_version, bytes) = if state.bogus_delta_once {
            state.bogus_delta_once = false;
            let base = 999_999;
            let mut writer = SnapshotWriter::new(self.dim, version).delta_on(base);
            if let Some(r) = state.records.last() {
                writer.push(r).expect("push");
            }
            (Some(base), writer.finish().expect("finish"))
        } else if let (true, Some((base_version, base_count))) = (state.serve_deltas, base) {
            let mut writer = SnapshotWriter::new(self.dim, version)
                .delta_on(base_version)
                .with_graph(complete_graph(count));
            for r in &state.records[base_count..count] {
                writer.push(r).expect("push");
            }
            (Some(base_version), writer.finish().expect("finish"))
        } else {
            (None, snapshot_bytes(self.dim, version, &state.records[..count]))
        };
        drop(state);

        std::fs::write(dest, &bytes).map_err(|e| EdgeError::transient("writing download", e))?;
        Ok(SnapshotResponse::Snapshot(SnapshotPayload {
            version,
            base_version,
            sha256: sha256_hex(&bytes),
            path: dest.to_path_buf(),
            size: bytes.len() as u64,
        }))
    }
}

/// Deterministic embedder: the vector is a function of the input bytes.
/// Inputs starting with `fail` are rejected.
pub struct HashEmbedder {
    pub dim: usize,
}

impl HashEmbedder {
    fn embed_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.starts_with(b"fail") {
            return Err(EdgeError::Embedding("model rejected input".into()));
        }
        let seed = bytes
            .iter()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, &b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
        Ok(random_unit(&mut StdRng::seed_from_u64(seed), self.dim))
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_image(&self, frame: &Frame) -> Result<Vec<f32>> {
        self.embed_bytes(&frame.bytes)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_bytes(text.as_bytes())
    }
}
