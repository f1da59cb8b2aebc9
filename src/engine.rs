//! Top-level wiring of one edge node.

use std::sync::Arc;

use edgesync_core::EmbeddingRecord;
use parking_lot::Mutex;
use serde::Serialize;

use crate::capture::{CaptureOutcome, CapturePipeline, EmbeddingProvider, Frame};
use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::query::{QueryMerger, SearchResponse};
use crate::queue::{DurableQueue, QueueOptions, QueueRecovery, QueueStats};
use crate::store::{
    read_manifest, sweep_snapshot_dir, ImmutableHandle, ImmutableStore, MutableStore,
    SnapshotManifest,
};
use crate::sync::{IndexingServer, SyncHandle, SyncStatus, Synchronizer};

/// What startup found and repaired.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub snapshot_version: Option<u64>,
    pub snapshot_records: usize,
    /// Set when a manifest existed but its snapshot could not be loaded.
    pub snapshot_error: Option<String>,
    pub queue: QueueRecovery,
    pub mutable_restored: usize,
    pub purged_on_open: usize,
    pub swept_files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub dim: usize,
    pub queue: QueueStats,
    pub mutable_records: usize,
    pub snapshot: Option<SnapshotManifest>,
    pub degraded: bool,
    pub capture_halted: Option<String>,
    pub sync: Option<SyncStatus>,
}

pub struct EdgeEngine {
    config: Arc<EdgeConfig>,
    queue: Arc<DurableQueue>,
    mutable: Arc<MutableStore>,
    immutable: Arc<ImmutableHandle>,
    merger: QueryMerger,
    capture: CapturePipeline,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    sync: Mutex<Option<SyncHandle>>,
    recovery: RecoveryReport,
}

impl EdgeEngine {
    /// Open the data dir, load the installed snapshot and replay the queue.
    ///
    /// A snapshot that fails validation leaves the engine running degraded
    /// (mutable store only) instead of refusing to start. The mutable store
    /// is rebuilt from every queued record the snapshot does not cover.
    pub fn open(config: EdgeConfig, provider: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self> {
        config.validate()?;
        if let Some(p) = &provider {
            if p.dim() != config.dim {
                return Err(EdgeError::dimension_mismatch(config.dim, p.dim()));
            }
        }
        for dir in [
            &config.data_dir,
            &config.queue_dir,
            &config.immutable_dir,
            &config.quarantine_dir,
            &config.tmp_dir,
            &config.images_dir,
        ] {
            std::fs::create_dir_all(dir)
                .map_err(|e| EdgeError::fatal(&format!("creating {:?}", dir), e))?;
        }

        let mut recovery = RecoveryReport::default();
        let snapshot = match load_installed(&config) {
            Ok(store) => store,
            Err(err) => {
                tracing::warn!("installed snapshot unusable, serving degraded: {}", err);
                recovery.snapshot_error = Some(err.to_string());
                None
            }
        };
        recovery.swept_files = sweep_snapshot_dir(&config, snapshot.as_ref().map(|s| s.path()));
        recovery.snapshot_version = snapshot.as_ref().map(|s| s.version());
        recovery.snapshot_records = snapshot.as_ref().map(|s| s.len()).unwrap_or(0);

        let queue = Arc::new(DurableQueue::open(QueueOptions::from_config(&config))?);
        recovery.queue = queue.recovery().clone();

        let mutable = Arc::new(MutableStore::new(config.dim, config.parallel_scan_min));
        for record in queue.retained() {
            if snapshot.as_ref().map(|s| s.contains(&record.id)).unwrap_or(false) {
                continue;
            }
            match mutable.insert(record) {
                Ok(true) => recovery.mutable_restored += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!("skipping queued record on restore: {}", err),
            }
        }
        if let Some(store) = &snapshot {
            recovery.purged_on_open = queue.purge_covered(|id| store.contains(id))?;
        }

        let immutable = Arc::new(ImmutableHandle::new(snapshot.map(Arc::new)));
        let config = Arc::new(config);
        let merger = QueryMerger::new(&config, mutable.clone(), immutable.clone());
        let capture = CapturePipeline::new(&config, provider.clone(), queue.clone(), mutable.clone());

        tracing::info!(
            "edge engine open: snapshot {:?} ({} records), {} mutable restored, queue depth {}",
            recovery.snapshot_version,
            recovery.snapshot_records,
            recovery.mutable_restored,
            queue.depth()
        );

        Ok(Self {
            config,
            queue,
            mutable,
            immutable,
            merger,
            capture,
            provider,
            sync: Mutex::new(None),
            recovery,
        })
    }

    /// Spawn the synchronizer against `server`. Must run inside a tokio runtime.
    pub fn start_sync(&self, server: Arc<dyn IndexingServer>) -> SyncHandle {
        let handle = self.synchronizer(server).spawn();
        self.capture.attach_sync(handle.clone());
        *self.sync.lock() = Some(handle.clone());
        handle
    }

    /// A synchronizer over this engine's stores that the caller drives.
    pub fn synchronizer(&self, server: Arc<dyn IndexingServer>) -> Synchronizer {
        Synchronizer::new(
            self.config.clone(),
            self.queue.clone(),
            self.mutable.clone(),
            self.immutable.clone(),
            server,
        )
    }

    pub fn sync_handle(&self) -> Option<SyncHandle> {
        self.sync.lock().clone()
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<SearchResponse> {
        self.merger.search(query, k)
    }

    /// Embed `text` and search with it. Blocks on the provider.
    pub fn search_text(&self, text: &str, k: usize) -> Result<SearchResponse> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| EdgeError::InvalidInput("no embedding provider configured".into()))?;
        let vector = provider.embed_text(text)?;
        self.merger.search(&vector, k)
    }

    pub fn capture_frame(&self, frame: Frame) -> Result<CaptureOutcome> {
        self.capture.ingest_frame(frame)
    }

    pub fn capture_record(&self, record: EmbeddingRecord) -> Result<CaptureOutcome> {
        self.capture.ingest_record(record)
    }

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.immutable.load();
        EngineStats {
            dim: self.config.dim,
            queue: self.queue.stats(),
            mutable_records: self.mutable.len(),
            degraded: snapshot.is_none(),
            snapshot: snapshot.map(|s| s.manifest().clone()),
            capture_halted: self.capture.halted(),
            sync: self.sync_handle().map(|h| h.status()),
        }
    }

    /// Why capture stopped accepting frames, if it has.
    pub fn capture_halted(&self) -> Option<String> {
        self.capture.halted()
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    pub fn mutable(&self) -> &MutableStore {
        &self.mutable
    }

    pub fn immutable(&self) -> &ImmutableHandle {
        &self.immutable
    }

    pub fn has_text_search(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn shutdown(&self) {
        let handle = self.sync.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

fn load_installed(config: &EdgeConfig) -> Result<Option<ImmutableStore>> {
    let Some(manifest) = read_manifest(config)? else {
        return Ok(None);
    };
    let path = config.immutable_dir.join(&manifest.file);
    ImmutableStore::load(&path, manifest, config.dim).map(Some)
}
