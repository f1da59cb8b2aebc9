//! Indexing server seam and its HTTP client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use edgesync_core::EmbeddingRecord;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{EdgeError, Result};

pub const VERSION_HEADER: &str = "x-snapshot-version";
pub const SHA256_HEADER: &str = "x-snapshot-sha256";
pub const BASE_VERSION_HEADER: &str = "x-snapshot-base-version";
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub accepted: usize,
}

/// A snapshot downloaded to disk plus the metadata needed to validate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPayload {
    pub version: u64,
    /// Set when the payload is a delta on top of that version.
    pub base_version: Option<u64>,
    pub sha256: String,
    /// The partial file the body was written to.
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotResponse {
    UpToDate,
    Snapshot(SnapshotPayload),
}

/// The central indexer: accepts uploads, serves indexed snapshots.
#[async_trait]
pub trait IndexingServer: Send + Sync {
    /// Durably store `records`. Success means every record was accepted.
    async fn upload(&self, records: &[EmbeddingRecord]) -> Result<UploadReceipt>;

    /// Latest snapshot newer than `since`, full or as a delta on `since`.
    ///
    /// The body is written to `dest`, never held in memory whole. On error
    /// `dest` may be left behind for the caller to remove.
    async fn fetch_snapshot(&self, since: Option<u64>, dest: &Path) -> Result<SnapshotResponse>;
}

#[derive(Serialize)]
struct UpsertPoint<'a> {
    id: Uuid,
    vector: &'a [f32],
    captured_at: u64,
    payload: &'a Value,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    points: Vec<UpsertPoint<'a>>,
}

#[derive(Deserialize)]
struct UpsertResponse {
    count: usize,
}

#[derive(Serialize)]
struct SnapshotRequest {
    since_version: Option<u64>,
}

/// Indexing server over HTTP:
/// `POST /api/upsert` and `POST /api/snapshots`.
pub struct HttpIndexingServer {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_snapshot_bytes: u64,
}

impl HttpIndexingServer {
    pub fn new(base_url: &str, api_key: Option<String>, max_snapshot_bytes: u64) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            max_snapshot_bytes,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }
}

#[async_trait]
impl IndexingServer for HttpIndexingServer {
    async fn upload(&self, records: &[EmbeddingRecord]) -> Result<UploadReceipt> {
        let body = UpsertRequest {
            points: records
                .iter()
                .map(|r| UpsertPoint {
                    id: r.id,
                    vector: &r.vector,
                    captured_at: r.captured_at,
                    payload: &r.payload,
                })
                .collect(),
        };
        let response = self.post("/api/upsert").json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EdgeError::TransientIo(format!(
                "upload rejected with {status}: {text}"
            )));
        }
        let ack: UpsertResponse = response.json().await?;
        if ack.count != records.len() {
            return Err(EdgeError::TransientIo(format!(
                "server acknowledged {} of {} records",
                ack.count,
                records.len()
            )));
        }
        Ok(UploadReceipt {
            accepted: ack.count,
        })
    }

    async fn fetch_snapshot(&self, since: Option<u64>, dest: &Path) -> Result<SnapshotResponse> {
        let response = self
            .post("/api/snapshots")
            .json(&SnapshotRequest {
                since_version: since,
            })
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(SnapshotResponse::UpToDate);
        }
        if !status.is_success() {
            return Err(EdgeError::TransientIo(format!(
                "snapshot request failed with {status}"
            )));
        }

        let headers = response.headers();
        let header = |name: &str| -> Option<String> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
        };
        let parse_version = |name: &str, raw: String| -> Result<u64> {
            raw.parse()
                .map_err(|_| EdgeError::Corruption(format!("bad {name} header: {raw:?}")))
        };
        let version = header(VERSION_HEADER)
            .ok_or_else(|| EdgeError::Corruption(format!("missing {VERSION_HEADER} header")))
            .and_then(|raw| parse_version(VERSION_HEADER, raw))?;
        let sha256 = header(SHA256_HEADER)
            .ok_or_else(|| EdgeError::Corruption(format!("missing {SHA256_HEADER} header")))?;
        let base_version = header(BASE_VERSION_HEADER)
            .map(|raw| parse_version(BASE_VERSION_HEADER, raw))
            .transpose()?;

        if let Some(len) = response.content_length() {
            if len > self.max_snapshot_bytes {
                return Err(EdgeError::Corruption(format!(
                    "snapshot of {len} bytes exceeds limit of {}",
                    self.max_snapshot_bytes
                )));
            }
        }

        let size = match self.download(response, dest, &sha256).await {
            Ok(size) => size,
            Err(err) => {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(err);
            }
        };

        Ok(SnapshotResponse::Snapshot(SnapshotPayload {
            version,
            base_version,
            sha256,
            path: dest.to_path_buf(),
            size,
        }))
    }
}

impl HttpIndexingServer {
    /// Stream the body into `dest`, hashing as it goes. Returns the byte count.
    async fn download(&self, response: reqwest::Response, dest: &Path, sha256: &str) -> Result<u64> {
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| EdgeError::transient(&format!("creating {}", dest.display()), e))?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            if size > self.max_snapshot_bytes {
                return Err(EdgeError::Corruption(format!(
                    "snapshot body exceeds limit of {} bytes",
                    self.max_snapshot_bytes
                )));
            }
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| EdgeError::transient("writing snapshot download", e))?;
        }
        file.flush()
            .await
            .map_err(|e| EdgeError::transient("flushing snapshot download", e))?;
        file.sync_all()
            .await
            .map_err(|e| EdgeError::transient("syncing snapshot download", e))?;

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(sha256.trim()) {
            return Err(EdgeError::Corruption(format!(
                "snapshot checksum mismatch: expected {sha256}, got {actual}"
            )));
        }
        Ok(size)
    }
}
