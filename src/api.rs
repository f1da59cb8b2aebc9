use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use edgesync_core::{now_millis, EmbeddingRecord};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::capture::Frame;
use crate::engine::EdgeEngine;
use crate::error::EdgeError;
use crate::model::{
    ApiResponse, ErrorBody, FrameRequest, HealthResponse, SearchRequest, SearchResponseBody,
};

pub fn create_router(engine: Arc<EdgeEngine>) -> Router {
    Router::new()
        .route("/v1/search", post(search))
        .route("/v1/frames", post(ingest_frame))
        .route("/v1/frames/image", post(ingest_image))
        .route("/v1/sync", post(force_sync))
        .route("/v1/stats", get(stats))
        .route("/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn search(
    State(engine): State<Arc<EdgeEngine>>,
    headers: HeaderMap,
    Json(body): Json<SearchRequest>,
) -> Response {
    let request_id = request_id(&headers);
    let started = Instant::now();
    let k = body.k.unwrap_or(engine.config().search_k);

    let engine_bg = engine.clone();
    let result = tokio::task::spawn_blocking(move || match (body.vector, body.text) {
        (Some(vector), _) => engine_bg.search(&vector, k),
        (None, Some(text)) => engine_bg.search_text(&text, k),
        (None, None) => Err(EdgeError::InvalidInput(
            "either vector or text is required".into(),
        )),
    })
    .await;

    match flatten(result, "search") {
        Ok(response) => {
            let payload = ApiResponse {
                data: SearchResponseBody {
                    hits: response.hits,
                    snapshot_version: response.snapshot_version,
                    degraded: response.degraded,
                    query_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                },
            };
            json_response(StatusCode::OK, &request_id, &payload)
        }
        Err(e) => edge_error_response(&request_id, e),
    }
}

async fn ingest_frame(
    State(engine): State<Arc<EdgeEngine>>,
    headers: HeaderMap,
    Json(body): Json<FrameRequest>,
) -> Response {
    let request_id = request_id(&headers);

    let mut payload = match body.metadata {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(frame_ref) = body.frame_ref {
        payload.insert("frame_ref".into(), Value::String(frame_ref));
    }
    let record = EmbeddingRecord::with_id(
        body.id.unwrap_or_else(Uuid::new_v4),
        body.vector,
        body.captured_at.unwrap_or_else(now_millis),
        Value::Object(payload),
    );

    let engine_bg = engine.clone();
    let result = tokio::task::spawn_blocking(move || engine_bg.capture_record(record)).await;
    match flatten(result, "ingest") {
        Ok(outcome) => json_response(StatusCode::CREATED, &request_id, &ApiResponse { data: outcome }),
        Err(e) => edge_error_response(&request_id, e),
    }
}

/// Raw encoded image in the body; `x-source-ref` labels where it came from.
/// The accepted frame is kept under the images dir and returned as `frame_ref`.
async fn ingest_image(State(engine): State<Arc<EdgeEngine>>, headers: HeaderMap, body: Bytes) -> Response {
    let request_id = request_id(&headers);
    if body.is_empty() {
        return edge_error_response(
            &request_id,
            EdgeError::InvalidInput("empty image body".into()),
        );
    }
    let frame = Frame {
        bytes: body.to_vec(),
        source_ref: headers
            .get("x-source-ref")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        metadata: Value::Null,
    };

    let engine_bg = engine.clone();
    let result = tokio::task::spawn_blocking(move || engine_bg.capture_frame(frame)).await;
    match flatten(result, "ingest") {
        Ok(outcome) => json_response(StatusCode::CREATED, &request_id, &ApiResponse { data: outcome }),
        Err(e) => edge_error_response(&request_id, e),
    }
}

async fn force_sync(State(engine): State<Arc<EdgeEngine>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    let Some(handle) = engine.sync_handle() else {
        return edge_error_response(
            &request_id,
            EdgeError::Degraded("synchronizer is not running".into()),
        );
    };
    match handle.force_sync().await {
        Ok(report) => json_response(StatusCode::OK, &request_id, &ApiResponse { data: report }),
        Err(e) => edge_error_response(&request_id, e),
    }
}

async fn stats(State(engine): State<Arc<EdgeEngine>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    let engine_bg = engine.clone();
    match tokio::task::spawn_blocking(move || engine_bg.stats()).await {
        Ok(stats) => json_response(StatusCode::OK, &request_id, &ApiResponse { data: stats }),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &request_id,
            "stats_failed",
            format!("stats join error: {e}"),
            None,
        ),
    }
}

async fn health(State(engine): State<Arc<EdgeEngine>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    // queue depth takes the queue lock, which an fsync may be holding
    let engine_bg = engine.clone();
    let health = match tokio::task::spawn_blocking(move || health_of(&engine_bg)).await {
        Ok(health) => health,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &request_id,
                "health_failed",
                format!("health join error: {e}"),
                None,
            )
        }
    };
    let code = if health.capture_halted.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    json_response(code, &request_id, &ApiResponse { data: health })
}

fn health_of(engine: &EdgeEngine) -> HealthResponse {
    let snapshot_version = engine.immutable().version();
    let capture_halted = engine.capture_halted();
    let status = match (&capture_halted, snapshot_version) {
        (Some(_), _) => "halted",
        (None, None) => "degraded",
        (None, Some(_)) => "ok",
    };
    HealthResponse {
        status: status.to_string(),
        snapshot_version,
        queue_depth: engine.queue().depth(),
        capture_halted,
    }
}

fn flatten<T>(
    result: std::result::Result<crate::error::Result<T>, tokio::task::JoinError>,
    what: &str,
) -> crate::error::Result<T> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(EdgeError::Fatal(format!("{what} join error: {e}"))),
    }
}

fn status_for(err: &EdgeError) -> StatusCode {
    match err {
        EdgeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EdgeError::Embedding(_) => StatusCode::BAD_GATEWAY,
        EdgeError::TransientIo(_) | EdgeError::Degraded(_) => StatusCode::SERVICE_UNAVAILABLE,
        EdgeError::Corruption(_) | EdgeError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn edge_error_response(request_id: &str, err: EdgeError) -> Response {
    if matches!(err, EdgeError::Fatal(_) | EdgeError::Corruption(_)) {
        tracing::error!("request {} failed: {}", request_id, err);
    }
    error_response(status_for(&err), request_id, err.code(), err.to_string(), None)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(new_request_id)
}

fn set_request_id(resp: &mut Response, request_id: &str) {
    if let Ok(hv) = HeaderValue::from_str(request_id) {
        resp.headers_mut().insert("x-request-id", hv);
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, request_id: &str, payload: &T) -> Response {
    let mut resp = (status, Json(payload)).into_response();
    set_request_id(&mut resp, request_id);
    resp
}

fn error_response(
    status: StatusCode,
    request_id: &str,
    code: &str,
    message: String,
    details: Option<Value>,
) -> Response {
    let payload = ErrorBody {
        code: code.to_string(),
        message,
        details,
    };
    json_response(status, request_id, &payload)
}

fn new_request_id() -> String {
    format!("req_{}_{}", now_millis() / 1000, &Uuid::new_v4().simple().to_string()[..16])
}
