//! Capture intake: embed, dedup, persist, make searchable.
//!
//! The producer path never touches the network beyond the embedding provider;
//! uploads happen later on the synchronizer task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edgesync_core::simd::is_finite;
use edgesync_core::{l2_normalized, EmbeddingRecord, RecordId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::runtime::Handle;

use crate::config::EdgeConfig;
use crate::dedup::{DedupDecision, DedupFilter};
use crate::error::{EdgeError, Result};
use crate::fsutil::write_atomic;
use crate::queue::DurableQueue;
use crate::store::MutableStore;
use crate::sync::SyncHandle;

/// One captured camera frame.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Encoded image (JPEG/PNG) as handed to the embedding provider.
    pub bytes: Vec<u8>,
    /// Caller's label for the frame, such as a camera path or sequence number.
    pub source_ref: Option<String>,
    /// Extra JSON fields merged into the record payload.
    pub metadata: Value,
}

/// Turns frames and text into vectors in the same embedding space.
///
/// Implementations may block; async callers go through `spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn dim(&self) -> usize;
    fn embed_image(&self, frame: &Frame) -> Result<Vec<f32>>;
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct EmbedTextRequest<'a> {
    text: &'a str,
}

/// Embedding model served over HTTP: `POST /embed/image` with the raw image
/// bytes and `POST /embed/text` with `{"text": ...}`, both answering
/// `{"embedding": [...]}`.
///
/// Requests run on the runtime captured at construction, so calls must come
/// from a blocking thread, never from inside an async task.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    dim: usize,
    runtime: Handle,
}

impl HttpEmbeddingProvider {
    /// Must be called inside a tokio runtime.
    pub fn new(base_url: &str, dim: usize, timeout: Duration) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| EdgeError::InvalidInput(format!("embedding provider needs a runtime: {e}")))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            dim,
            runtime,
        })
    }

    fn call(&self, request: reqwest::RequestBuilder) -> Result<Vec<f32>> {
        let embedding = self
            .runtime
            .block_on(async move {
                let response = request.send().await?.error_for_status()?;
                response.json::<EmbedResponse>().await
            })
            .map_err(|e| EdgeError::Embedding(e.to_string()))?
            .embedding;
        if embedding.len() != self.dim {
            return Err(EdgeError::Embedding(format!(
                "model returned {} dimensions, expected {}",
                embedding.len(),
                self.dim
            )));
        }
        Ok(embedding)
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_image(&self, frame: &Frame) -> Result<Vec<f32>> {
        let request = self
            .client
            .post(format!("{}/embed/image", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(frame.bytes.clone());
        self.call(request)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let request = self
            .client
            .post(format!("{}/embed/text", self.base_url))
            .json(&EmbedTextRequest { text });
        self.call(request)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Stored { id: RecordId },
    Duplicate { similarity: f32 },
    /// The frame was dropped; capture continues.
    EmbeddingFailed { reason: String },
}

/// capture -> dedup -> image file -> durable queue -> mutable store.
///
/// Accepted frames are written to `images_dir/<id>.<ext>` and the payload's
/// `frame_ref` points at that file.
///
/// A failed enqueue halts the pipeline: every later frame is refused with
/// [`EdgeError::Fatal`] rather than accepted into a store that can no longer
/// persist it.
pub struct CapturePipeline {
    dim: usize,
    upload_threshold: usize,
    images_dir: PathBuf,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    dedup: Mutex<DedupFilter>,
    queue: Arc<DurableQueue>,
    mutable: Arc<MutableStore>,
    sync: Mutex<Option<SyncHandle>>,
    halted: Mutex<Option<String>>,
}

impl CapturePipeline {
    pub fn new(
        config: &EdgeConfig,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        queue: Arc<DurableQueue>,
        mutable: Arc<MutableStore>,
    ) -> Self {
        Self {
            dim: config.dim,
            upload_threshold: config.upload_threshold,
            images_dir: config.images_dir.clone(),
            provider,
            dedup: Mutex::new(DedupFilter::new(config.dedup_threshold)),
            queue,
            mutable,
            sync: Mutex::new(None),
            halted: Mutex::new(None),
        }
    }

    /// Nudge this synchronizer whenever the queue backs up.
    pub fn attach_sync(&self, handle: SyncHandle) {
        *self.sync.lock() = Some(handle);
    }

    pub fn halted(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    pub fn ingest_frame(&self, frame: Frame) -> Result<CaptureOutcome> {
        self.ensure_running()?;
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| EdgeError::InvalidInput("no embedding provider configured".into()))?;

        let vector = match provider.embed_image(&frame) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!("dropping frame {:?}: {}", frame.source_ref, err);
                return Ok(CaptureOutcome::EmbeddingFailed {
                    reason: err.to_string(),
                });
            }
        };

        let mut payload = match frame.metadata {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("metadata".into(), other);
                map
            }
        };
        if let Some(source_ref) = frame.source_ref {
            payload.insert("source_ref".into(), Value::String(source_ref));
        }
        let record = EmbeddingRecord::new(vector, Value::Object(payload));
        self.admit(record, Some(frame.bytes.as_slice()))
    }

    /// Intake for an already-embedded record. The vector is normalized before
    /// it is stored.
    pub fn ingest_record(&self, record: EmbeddingRecord) -> Result<CaptureOutcome> {
        self.admit(record, None)
    }

    fn admit(&self, mut record: EmbeddingRecord, image: Option<&[u8]>) -> Result<CaptureOutcome> {
        self.ensure_running()?;
        if record.dim() != self.dim {
            return Err(EdgeError::dimension_mismatch(self.dim, record.dim()));
        }
        if !is_finite(&record.vector) || record.vector.iter().all(|&x| x == 0.0) {
            return Err(EdgeError::InvalidInput(
                "embedding must be finite and non-zero".into(),
            ));
        }
        record.vector = l2_normalized(&record.vector);

        if let DedupDecision::Drop { similarity } = self.dedup.lock().check(&record.vector) {
            tracing::debug!("dropping near-duplicate frame (similarity {:.4})", similarity);
            return Ok(CaptureOutcome::Duplicate { similarity });
        }

        let image_path = match image {
            Some(bytes) => {
                let path = self.persist_image(&record.id, bytes)?;
                if let Value::Object(map) = &mut record.payload {
                    map.insert("frame_ref".into(), Value::String(path.to_string_lossy().into_owned()));
                }
                Some(path)
            }
            None => None,
        };

        if let Err(err) = self.queue.enqueue(&record) {
            if let Some(path) = &image_path {
                let _ = std::fs::remove_file(path);
            }
            tracing::error!("enqueue failed, halting capture: {}", err);
            *self.halted.lock() = Some(err.to_string());
            return Err(err);
        }
        let id = record.id;
        self.mutable.insert(record)?;

        if self.queue.depth() >= self.upload_threshold {
            if let Some(sync) = self.sync.lock().as_ref() {
                sync.request_sync();
            }
        }
        Ok(CaptureOutcome::Stored { id })
    }

    fn persist_image(&self, id: &RecordId, bytes: &[u8]) -> Result<PathBuf> {
        let path = self
            .images_dir
            .join(format!("{}.{}", id, image_extension(bytes)));
        std::fs::create_dir_all(&self.images_dir)
            .and_then(|()| write_atomic(&path, bytes))
            .map_err(|e| EdgeError::transient(&format!("writing frame {}", path.display()), e))?;
        Ok(path)
    }

    fn ensure_running(&self) -> Result<()> {
        match self.halted.lock().as_ref() {
            Some(reason) => Err(EdgeError::Fatal(format!("capture halted: {reason}"))),
            None => Ok(()),
        }
    }
}

/// File extension for an encoded frame, sniffed from its leading bytes.
fn image_extension(bytes: &[u8]) -> &'static str {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => "jpg",
        [0x89, b'P', b'N', b'G', ..] => "png",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "webp",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueOptions;
    use serde_json::json;
    use tempfile::tempdir;

    struct AxisEmbedder;

    impl EmbeddingProvider for AxisEmbedder {
        fn dim(&self) -> usize {
            2
        }

        fn embed_image(&self, frame: &Frame) -> Result<Vec<f32>> {
            match frame.bytes.first() {
                Some(0) => Ok(vec![1.0, 0.0]),
                Some(1) => Ok(vec![0.0, 1.0]),
                _ => Err(EdgeError::Embedding("unreadable frame".into())),
            }
        }

        fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn pipeline(dir: &std::path::Path) -> (CapturePipeline, Arc<DurableQueue>, Arc<MutableStore>) {
        let mut config = EdgeConfig::from_data_dir(dir.to_path_buf(), 2);
        config.dedup_threshold = 0.98;
        let queue = Arc::new(DurableQueue::open(QueueOptions::from_config(&config)).unwrap());
        let mutable = Arc::new(MutableStore::new(2, 1024));
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(AxisEmbedder);
        let pipeline = CapturePipeline::new(&config, Some(provider), queue.clone(), mutable.clone());
        (pipeline, queue, mutable)
    }

    fn frame(tag: u8, source_ref: &str) -> Frame {
        Frame {
            bytes: vec![tag],
            source_ref: Some(source_ref.into()),
            metadata: json!({"camera": "front"}),
        }
    }

    #[test]
    fn stored_frames_land_in_queue_and_store() {
        let dir = tempdir().unwrap();
        let (pipeline, queue, mutable) = pipeline(dir.path());
        let CaptureOutcome::Stored { id } = pipeline.ingest_frame(frame(0, "a.jpg")).unwrap() else {
            panic!("expected stored");
        };
        assert_eq!(queue.depth(), 1);
        let record = mutable.get(&id).unwrap();
        assert_eq!(record.payload["source_ref"], "a.jpg");
        assert_eq!(record.payload["camera"], "front");
    }

    #[test]
    fn accepted_frames_are_kept_on_disk() {
        let dir = tempdir().unwrap();
        let (pipeline, queue, mutable) = pipeline(dir.path());
        let bytes = vec![0, 0xD8, 0xFF, 0xE0, 1, 2, 3];
        let CaptureOutcome::Stored { id } = pipeline
            .ingest_frame(Frame {
                bytes: bytes.clone(),
                ..Default::default()
            })
            .unwrap()
        else {
            panic!("expected stored");
        };
        let frame_ref = mutable.get(&id).unwrap().payload["frame_ref"]
            .as_str()
            .unwrap()
            .to_string();
        let path = std::path::PathBuf::from(&frame_ref);
        assert_eq!(path, dir.path().join("images").join(format!("{id}.bin")));
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
        assert_eq!(queue.retained()[0].payload["frame_ref"], frame_ref.as_str());

        // duplicates never reach the images dir
        pipeline.ingest_frame(frame(0, "again")).unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join("images")).unwrap().count(), 1);
    }

    #[test]
    fn image_extension_follows_magic_bytes() {
        assert_eq!(image_extension(&[0xFF, 0xD8, 0xFF, 0xDB]), "jpg");
        assert_eq!(image_extension(b"\x89PNG\r\n"), "png");
        assert_eq!(image_extension(b"RIFF\0\0\0\0WEBPVP8 "), "webp");
        assert_eq!(image_extension(b"red car"), "bin");
    }

    #[test]
    fn duplicates_are_dropped_before_persisting() {
        let dir = tempdir().unwrap();
        let (pipeline, queue, mutable) = pipeline(dir.path());
        pipeline.ingest_frame(frame(0, "a.jpg")).unwrap();
        let outcome = pipeline.ingest_frame(frame(0, "b.jpg")).unwrap();
        assert!(matches!(outcome, CaptureOutcome::Duplicate { .. }));
        assert!(matches!(
            pipeline.ingest_frame(frame(1, "c.jpg")).unwrap(),
            CaptureOutcome::Stored { .. }
        ));
        assert_eq!(queue.depth(), 2);
        assert_eq!(mutable.len(), 2);
    }

    #[test]
    fn embedding_failure_drops_only_that_frame() {
        let dir = tempdir().unwrap();
        let (pipeline, queue, _) = pipeline(dir.path());
        let outcome = pipeline.ingest_frame(frame(9, "bad.jpg")).unwrap();
        assert!(matches!(outcome, CaptureOutcome::EmbeddingFailed { .. }));
        assert_eq!(queue.depth(), 0);
        assert!(pipeline.ingest_frame(frame(0, "ok.jpg")).is_ok());
    }

    #[test]
    fn records_are_normalized_and_validated() {
        let dir = tempdir().unwrap();
        let (pipeline, _, mutable) = pipeline(dir.path());
        let err = pipeline
            .ingest_record(EmbeddingRecord::new(vec![1.0, 0.0, 0.0], Value::Null))
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
        assert!(pipeline
            .ingest_record(EmbeddingRecord::new(vec![0.0, 0.0], Value::Null))
            .is_err());

        let CaptureOutcome::Stored { id } = pipeline
            .ingest_record(EmbeddingRecord::new(vec![3.0, 4.0], Value::Null))
            .unwrap()
        else {
            panic!("expected stored");
        };
        assert_eq!(mutable.get(&id).unwrap().vector, vec![0.6, 0.8]);
    }
}
