//! Installed server snapshots.
//!
//! Each version lives in `immutable/snap_<version>.snap`, mmapped read-only.
//! `manifest.json` names the current one. Stores are never mutated: a swap
//! installs a new file and publishes a new [`ImmutableStore`] through
//! [`ImmutableHandle`], and the old file is deleted once no reader holds it.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use edgesync_core::format::FormatError;
use edgesync_core::{
    apply_delta_to, dot_product, now_millis, sha256_hex, verify_sha256, HnswGraph, RecordId,
    RecordMeta, SnapshotHeader, SnapshotView,
};
use memmap2::Mmap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{top_k, Candidate, Source};
use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::fsutil::{sync_parent, write_atomic};

/// Pointer to the installed snapshot, persisted next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub version: u64,
    /// Hex SHA-256 of the file on disk (after any delta merge).
    pub sha256: String,
    pub record_count: usize,
    pub dim: usize,
    pub file: String,
    pub installed_at: u64,
}

/// One validated snapshot, mmapped.
pub struct ImmutableStore {
    mmap: Mmap,
    header: SnapshotHeader,
    records: Vec<RecordMeta>,
    by_id: HashMap<RecordId, usize>,
    graph: Option<HnswGraph>,
    manifest: SnapshotManifest,
    path: PathBuf,
}

impl std::fmt::Debug for ImmutableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableStore")
            .field("version", &self.manifest.version)
            .field("records", &self.records.len())
            .field("path", &self.path)
            .finish()
    }
}

impl ImmutableStore {
    /// Map and fully validate `path` against `manifest`.
    ///
    /// # Safety
    ///
    /// Snapshot files are written once and never modified while mapped; a
    /// truncation from outside the process would still SIGBUS readers.
    pub fn load(path: &Path, manifest: SnapshotManifest, dim: usize) -> Result<Self> {
        let mmap = map_file(path)?;
        verify_sha256(&mmap, &manifest.sha256)?;
        Self::from_mapped(mmap, path, manifest, dim)
    }

    /// Validate an already checksummed mapping of `path`.
    fn from_mapped(mmap: Mmap, path: &Path, manifest: SnapshotManifest, dim: usize) -> Result<Self> {
        let view = SnapshotView::parse(&mmap)?;
        if view.header().is_delta() {
            return Err(EdgeError::Corruption(format!(
                "installed snapshot {:?} is an unmerged delta",
                path
            )));
        }
        if view.version() != manifest.version {
            return Err(EdgeError::Corruption(format!(
                "snapshot {:?} has version {}, manifest says {}",
                path,
                view.version(),
                manifest.version
            )));
        }
        if view.dim() != dim {
            return Err(FormatError::DimensionMismatch {
                expected: dim,
                actual: view.dim(),
            }
            .into());
        }
        if view.vectors_f32().is_none() {
            return Err(FormatError::Misaligned {
                section: "vectors",
                offset: view.header().vectors_offset,
                alignment: std::mem::align_of::<f32>() as u64,
            }
            .into());
        }

        let (header, records, graph) = view.into_parts();
        let by_id = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect();

        Ok(Self {
            mmap,
            header,
            records,
            by_id,
            graph,
            manifest,
            path: path.to_path_buf(),
        })
    }

    pub fn version(&self) -> u64 {
        self.header.snapshot_version
    }

    pub fn dim(&self) -> usize {
        self.header.dimensions as usize
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.iter().map(|r| &r.id)
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    fn vectors(&self) -> &[f32] {
        let start = self.header.vectors_offset as usize;
        let len = self.header.vectors_section_size() as usize;
        self.mmap
            .get(start..start + len)
            .and_then(|bytes| bytemuck::try_cast_slice(bytes).ok())
            .unwrap_or(&[])
    }

    /// Zero-copy vector of `ordinal`.
    pub fn vector(&self, ordinal: usize) -> &[f32] {
        let dim = self.dim();
        self.vectors()
            .get(ordinal * dim..(ordinal + 1) * dim)
            .unwrap_or(&[])
    }

    /// Approximate top-`k` through the graph, or exact when the snapshot
    /// shipped without one. `query` must be unit length.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<Candidate> {
        if k == 0 || query.len() != self.dim() || self.records.is_empty() {
            return Vec::new();
        }
        let captured_at = |i: usize| self.records.get(i).map_or(0, |r| r.captured_at);
        let hits = match &self.graph {
            // the whole beam is ranked so equal scores at the cutoff go to the newest capture
            Some(graph) => {
                let beam = ef.max(k);
                let found = graph.search(query, beam, beam, |i| self.vector(i));
                top_k(found.into_iter().map(|(i, s)| (i, s, captured_at(i))), k)
            }
            None => top_k(
                (0..self.records.len()).map(|i| (i, dot_product(query, self.vector(i)), captured_at(i))),
                k,
            ),
        };

        hits.into_iter()
            .filter_map(|(ordinal, score)| {
                let meta = self.records.get(ordinal)?;
                Some(Candidate {
                    id: meta.id,
                    score,
                    captured_at: meta.captured_at,
                    payload: meta.payload.clone(),
                    vector: self.vector(ordinal).to_vec(),
                    source: Source::Immutable,
                })
            })
            .collect()
    }
}

struct Retired {
    path: PathBuf,
    store: Weak<ImmutableStore>,
}

/// The single swappable pointer to the current snapshot.
///
/// Readers `load()` an `Arc` and keep using it for the whole query, so a swap
/// never changes the store under a running search.
#[derive(Default)]
pub struct ImmutableHandle {
    current: ArcSwapOption<ImmutableStore>,
    retired: Mutex<Vec<Retired>>,
}

impl ImmutableHandle {
    pub fn new(initial: Option<Arc<ImmutableStore>>) -> Self {
        Self {
            current: ArcSwapOption::new(initial),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn load(&self) -> Option<Arc<ImmutableStore>> {
        self.current.load_full()
    }

    pub fn version(&self) -> Option<u64> {
        self.current.load_full().map(|s| s.version())
    }

    /// Atomically replace the current store. The previous file is queued for
    /// [`ImmutableHandle::gc_retired`].
    pub fn publish(&self, store: Arc<ImmutableStore>) -> Option<Arc<ImmutableStore>> {
        let previous = self.current.swap(Some(store));
        if let Some(prev) = &previous {
            self.retired.lock().push(Retired {
                path: prev.path.clone(),
                store: Arc::downgrade(prev),
            });
        }
        previous
    }

    /// Delete retired snapshot files no reader still holds. Returns how many
    /// were removed.
    pub fn gc_retired(&self) -> usize {
        let current_path = self.current.load_full().map(|s| s.path.clone());
        let mut retired = self.retired.lock();
        let mut removed = 0;
        retired.retain(|r| {
            if r.store.strong_count() > 0 {
                return true;
            }
            if current_path.as_deref() != Some(r.path.as_path()) {
                match std::fs::remove_file(&r.path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!("failed to remove retired snapshot {:?}: {}", r.path, e);
                        return true;
                    }
                }
            }
            false
        });
        if removed > 0 {
            tracing::debug!("removed {} retired snapshot files", removed);
        }
        removed
    }

    pub fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }
}

/// Map `path` read-only.
///
/// # Safety
///
/// Snapshot files (and downloads in the tmp dir) are only written before they
/// are mapped, never while.
fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path)
        .map_err(|e| EdgeError::transient(&format!("opening snapshot {:?}", path), e))?;
    unsafe { Mmap::map(&file) }
        .map_err(|e| EdgeError::transient(&format!("mapping snapshot {:?}", path), e))
}

fn sync_file(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

/// [`install_snapshot_file`] for a body already in memory. The bytes are
/// staged in the tmp dir first.
pub fn install_snapshot(
    config: &EdgeConfig,
    bytes: &[u8],
    sha256: &str,
    current: Option<&ImmutableStore>,
) -> Result<ImmutableStore> {
    verify_sha256(bytes, sha256)?;
    std::fs::create_dir_all(&config.tmp_dir)
        .map_err(|e| EdgeError::transient("creating tmp dir", e))?;
    let staged = config.tmp_dir.join(format!("{}.partial", Uuid::new_v4()));
    let result = std::fs::write(&staged, bytes)
        .map_err(|e| EdgeError::transient("staging snapshot", e))
        .and_then(|()| install_snapshot_file(config, &staged, sha256, current));
    let _ = std::fs::remove_file(&staged);
    result
}

/// Validate a downloaded snapshot (or delta) file and move it into place as
/// the next installed version. Nothing is published here.
///
/// The download is mapped, never read into memory. A delta must sit on
/// `current`'s version and is folded onto it into a second tmp file, so the
/// file on disk is always a full snapshot. `partial` is consumed on success
/// and left for the caller to remove on failure.
pub fn install_snapshot_file(
    config: &EdgeConfig,
    partial: &Path,
    sha256: &str,
    current: Option<&ImmutableStore>,
) -> Result<ImmutableStore> {
    let mmap = map_file(partial)?;
    verify_sha256(&mmap, sha256)?;
    let view = SnapshotView::parse(&mmap)?;
    if view.dim() != config.dim {
        return Err(FormatError::DimensionMismatch {
            expected: config.dim,
            actual: view.dim(),
        }
        .into());
    }
    let version = view.version();
    if let Some(cur) = current {
        if version < cur.version() {
            return Err(EdgeError::Corruption(format!(
                "snapshot version {} is older than installed {}",
                version,
                cur.version()
            )));
        }
    }
    let from_delta = view.header().is_delta();

    std::fs::create_dir_all(&config.tmp_dir)
        .and_then(|_| std::fs::create_dir_all(&config.immutable_dir))
        .map_err(|e| EdgeError::transient("creating snapshot dirs", e))?;

    let merged_path = config.tmp_dir.join(format!("snap_{version:020}.merged.partial"));
    let source: &Path = match view.header().base() {
        Some(base) => {
            let cur = current.filter(|c| c.version() == base).ok_or_else(|| {
                EdgeError::Corruption(format!(
                    "delta on base {} does not match installed version {:?}",
                    base,
                    current.map(|c| c.version())
                ))
            })?;
            let base_view = SnapshotView::parse(&cur.mmap)?;
            if let Err(err) = write_merged(&merged_path, &base_view, &view) {
                let _ = std::fs::remove_file(&merged_path);
                return Err(err);
            }
            &merged_path
        }
        None => {
            sync_file(partial).map_err(|e| EdgeError::transient("syncing snapshot download", e))?;
            partial
        }
    };
    drop(view);
    drop(mmap);

    let path = config.snapshot_path(version);
    // the merged file gets its own checksum and a full re-parse before it is installed
    let validated = map_file(source).and_then(|mapped| {
        let manifest = SnapshotManifest {
            version,
            sha256: if from_delta {
                sha256_hex(&mapped)
            } else {
                sha256.trim().to_ascii_lowercase()
            },
            record_count: 0,
            dim: config.dim,
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            installed_at: now_millis(),
        };
        let mut store = ImmutableStore::from_mapped(mapped, &path, manifest, config.dim)?;
        store.manifest.record_count = store.len();
        Ok(store)
    });
    let store = match validated {
        Ok(store) => store,
        Err(err) => {
            let _ = std::fs::remove_file(&merged_path);
            return Err(err);
        }
    };

    // the mapping follows the inode through the rename
    let renamed = std::fs::rename(source, &path).and_then(|()| sync_parent(&path));
    if let Err(err) = renamed {
        let _ = std::fs::remove_file(&merged_path);
        return Err(EdgeError::transient("persisting snapshot", err));
    }
    if from_delta {
        let _ = std::fs::remove_file(partial);
    }

    tracing::info!(
        "installed snapshot v{} ({} records, {} bytes{})",
        version,
        store.len(),
        store.mmap.len(),
        if from_delta { ", from delta" } else { "" }
    );
    Ok(store)
}

fn write_merged(path: &Path, base: &SnapshotView<'_>, delta: &SnapshotView<'_>) -> Result<()> {
    let file = File::create(path).map_err(|e| EdgeError::transient("creating merged snapshot", e))?;
    let mut out = BufWriter::new(file);
    apply_delta_to(base, delta, &mut out)?;
    let file = out
        .into_inner()
        .map_err(|e| EdgeError::transient("flushing merged snapshot", e.error()))?;
    file.sync_all()
        .map_err(|e| EdgeError::transient("syncing merged snapshot", e))
}

pub fn read_manifest(config: &EdgeConfig) -> Result<Option<SnapshotManifest>> {
    let path = config.manifest_path();
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EdgeError::transient("reading snapshot manifest", e)),
    };
    let manifest = serde_json::from_slice(&raw)
        .map_err(|e| EdgeError::Corruption(format!("snapshot manifest: {e}")))?;
    Ok(Some(manifest))
}

pub fn write_manifest(config: &EdgeConfig, manifest: &SnapshotManifest) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| EdgeError::fatal("encoding snapshot manifest", e))?;
    write_atomic(&config.manifest_path(), &json)
        .map_err(|e| EdgeError::transient("writing snapshot manifest", e))
}

/// Remove snapshot files other than `keep` plus stale partial downloads.
pub fn sweep_snapshot_dir(config: &EdgeConfig, keep: Option<&Path>) -> usize {
    let mut removed = 0;
    for dir in [&config.immutable_dir, &config.tmp_dir] {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let stale = match path.extension().and_then(|e| e.to_str()) {
                Some("snap") => keep != Some(path.as_path()),
                Some("partial") => true,
                _ => false,
            };
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        tracing::info!("swept {} stale snapshot files", removed);
    }
    removed
}
