use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::query::SearchHit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Either `vector` or `text` must be set; `vector` wins when both are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponseBody {
    pub hits: Vec<SearchHit>,
    pub snapshot_version: Option<u64>,
    pub degraded: bool,
    pub query_time_ms: f64,
}

/// A frame whose embedding was computed upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRequest {
    pub vector: Vec<f32>,
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub frame_ref: Option<String>,
    #[serde(default)]
    pub captured_at: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub snapshot_version: Option<u64>,
    pub queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_halted: Option<String>,
}
