//! Embedding record model shared by every store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stable identifier assigned at capture time.
pub type RecordId = Uuid;

/// A captured embedding plus the metadata needed to serve it.
///
/// Records are immutable once created; stores only ever insert, replace
/// wholesale, or drop them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: RecordId,
    pub vector: Vec<f32>,
    /// Unix milliseconds.
    pub captured_at: u64,
    #[serde(default)]
    pub payload: Value,
}

/// Everything about a record except its vector.
///
/// Snapshot files keep vectors in a separate, aligned section and the rest here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub id: RecordId,
    pub captured_at: u64,
    #[serde(default)]
    pub payload: Value,
}

impl EmbeddingRecord {
    /// New record with a fresh v4 id stamped with the current time.
    pub fn new(vector: Vec<f32>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            vector,
            captured_at: now_millis(),
            payload,
        }
    }

    pub fn with_id(id: RecordId, vector: Vec<f32>, captured_at: u64, payload: Value) -> Self {
        Self {
            id,
            vector,
            captured_at,
            payload,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.vector.len()
    }

    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            id: self.id,
            captured_at: self.captured_at,
            payload: self.payload.clone(),
        }
    }
}

impl RecordMeta {
    pub fn into_record(self, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id: self.id,
            vector,
            captured_at: self.captured_at,
            payload: self.payload,
        }
    }
}

/// Current wall clock in Unix milliseconds (0 if the clock is before the epoch).
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
