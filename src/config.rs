use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EdgeError, Result};

/// Default embedding dimensionality (CLIP ViT-B/32 image/text space).
pub const DEFAULT_DIM: usize = 512;

/// Runtime configuration for one edge node.
///
/// Built with [`EdgeConfig::from_data_dir`], then adjusted field by field (the
/// CLI maps its flags onto these).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub data_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub immutable_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub tmp_dir: PathBuf,
    /// Accepted image frames are kept here as `<id>.<ext>`.
    pub images_dir: PathBuf,
    pub dim: usize,

    /// Frames whose cosine similarity to the last accepted frame reaches this are dropped.
    pub dedup_threshold: f32,

    pub sync_interval: Duration,
    /// Queue depth that triggers an early sync cycle.
    pub upload_threshold: usize,
    pub upload_batch_size: usize,
    pub upload_timeout: Duration,
    pub download_timeout: Duration,
    pub max_snapshot_bytes: u64,
    pub backoff_base: Duration,
    pub backoff_max: Duration,

    pub lease_timeout: Duration,
    /// Dead queue frames tolerated before the log is rewritten.
    pub queue_compact_min_dead: usize,

    pub search_k: usize,
    pub search_overfetch: usize,
    pub search_ef: usize,
    pub mmr_lambda: f32,
    pub mmr_max_candidates: usize,
    /// Mutable Store size above which brute-force scans fan out over rayon.
    pub parallel_scan_min: usize,
}

impl EdgeConfig {
    pub fn from_data_dir(data_dir: PathBuf, dim: usize) -> Self {
        let queue_dir = data_dir.join("queue");
        let immutable_dir = data_dir.join("immutable");
        let quarantine_dir = data_dir.join("quarantine");
        let tmp_dir = data_dir.join("tmp");
        let images_dir = data_dir.join("images");

        Self {
            data_dir,
            queue_dir,
            immutable_dir,
            quarantine_dir,
            tmp_dir,
            images_dir,
            dim,
            dedup_threshold: 0.75,
            sync_interval: Duration::from_secs(5),
            upload_threshold: 64,
            upload_batch_size: 10,
            upload_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(120),
            max_snapshot_bytes: 2 * 1024 * 1024 * 1024,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(300),
            queue_compact_min_dead: 1024,
            search_k: 3,
            search_overfetch: 4,
            search_ef: 64,
            mmr_lambda: 0.8,
            mmr_max_candidates: 100,
            parallel_scan_min: 4096,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(EdgeError::InvalidInput("dim must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.dedup_threshold) {
            return Err(EdgeError::InvalidInput(format!(
                "dedup_threshold must be within [0, 1], got {}",
                self.dedup_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.mmr_lambda) {
            return Err(EdgeError::InvalidInput(format!(
                "mmr_lambda must be within [0, 1], got {}",
                self.mmr_lambda
            )));
        }
        if self.upload_batch_size == 0 || self.search_overfetch == 0 {
            return Err(EdgeError::InvalidInput(
                "upload_batch_size and search_overfetch must be > 0".into(),
            ));
        }
        if self.backoff_base > self.backoff_max {
            return Err(EdgeError::InvalidInput(
                "backoff_base must not exceed backoff_max".into(),
            ));
        }
        Ok(())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.immutable_dir.join("manifest.json")
    }

    pub fn snapshot_path(&self, version: u64) -> PathBuf {
        self.immutable_dir.join(format!("snap_{version:020}.snap"))
    }
}
