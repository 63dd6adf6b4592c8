//! Upload Routes
//!
//! HTTP endpoints for the chunked upload protocol.
//!
//! Endpoints:
//! - POST /api/v1/upload/init - Create an upload session
//! - POST /api/v1/upload/upload - Upload a chunk (multipart form)
//! - POST /api/v1/upload/:upload_id/chunks/:index - Upload a chunk (raw body)
//! - GET /api/v1/upload/:upload_id/chunks/:index - Check whether a chunk is stored
//! - GET /api/v1/upload/:upload_id/missing - List chunks still to upload
//! - POST /api/v1/upload/:upload_id/merge - Assemble the file
//! - GET /api/v1/upload/:upload_id - Get session progress
//! - POST /api/v1/upload/:upload_id/cancel - Cancel upload
//! - DELETE /api/v1/upload/:upload_id - Cancel upload
//! - POST /api/v1/upload/cleanup - Sweep expired sessions

use axum::{
    body::Bytes,
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        Multipart, Path, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::state::AppState;
use crate::upload::{
    ChunkAck, ErrorKind, InitRequest, MergeOutcome, SessionDescriptor, UploadError, UploadService,
};

/// Header carrying the chunk digest on raw-body uploads
const CHUNK_HASH_HEADER: &str = "X-Chunk-Hash";

// ============================================================================
// Response Envelope
// ============================================================================

/// Uniform JSON envelope for every upload endpoint
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub code: &'static str,
    pub message: String,
    pub data: Option<T>,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            code: "OK",
            message: message.into(),
            data: Some(data),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        let message = if self.kind() == ErrorKind::Internal {
            tracing::error!(error = %self, "Upload request failed");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ApiResponse::<()> {
            success: false,
            code: self.code(),
            message,
            data: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });

        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, UploadError>;

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/init", post(init))
        .route("/upload", post(upload_multipart))
        .route("/cleanup", post(cleanup))
        .route("/:upload_id", get(progress).delete(cancel))
        .route("/:upload_id/cancel", post(cancel))
        .route("/:upload_id/merge", post(merge))
        .route("/:upload_id/missing", get(missing_chunks))
        .route(
            "/:upload_id/chunks/:index",
            post(upload_chunk).get(chunk_exists),
        )
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/upload/init
///
/// Create a session. The response carries the effective chunk size and count.
async fn init(
    State(state): State<AppState>,
    payload: Result<Json<InitRequest>, JsonRejection>,
) -> ApiResult<SessionDescriptor> {
    let Json(request) = payload.map_err(json_rejection)?;
    let descriptor = state.uploads().init(request).await?;
    Ok(ApiResponse::ok("Upload initialized", descriptor))
}

/// POST /api/v1/upload/upload
///
/// Multipart form with `uploadId`, `chunkIndex`, `chunk` and optional `chunkMd5`.
async fn upload_multipart(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<ChunkAck> {
    let mut multipart = multipart.map_err(multipart_rejection)?;
    let mut upload_id = None;
    let mut chunk_index = None;
    let mut chunk = None;
    let mut chunk_hash = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("uploadId") => upload_id = Some(field.text().await.map_err(multipart_error)?),
            Some("chunkIndex") => {
                let text = field.text().await.map_err(multipart_error)?;
                chunk_index = Some(parse_chunk_index(&text)?);
            }
            Some("chunk") | Some("file") => {
                chunk = Some(field.bytes().await.map_err(multipart_error)?)
            }
            Some("chunkMd5") | Some("chunkHash") => {
                chunk_hash = Some(field.text().await.map_err(multipart_error)?)
            }
            _ => {}
        }
    }

    let upload_id = upload_id.ok_or_else(|| missing_field("uploadId"))?;
    let chunk_index = chunk_index.ok_or_else(|| missing_field("chunkIndex"))?;
    let chunk = chunk.ok_or_else(|| missing_field("chunk"))?;

    let id = UploadService::parse_upload_id(&upload_id)?;
    let ack = state
        .uploads()
        .upload_chunk(id, chunk_index, chunk, chunk_hash)
        .await?;
    Ok(ApiResponse::ok(chunk_message(&ack), ack))
}

/// POST /api/v1/upload/:upload_id/chunks/:index
///
/// Upload a single chunk. The chunk data is the raw request body.
async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<ChunkAck> {
    let id = UploadService::parse_upload_id(&upload_id)?;
    let chunk_index = parse_chunk_index(&index)?;

    let chunk_hash = match headers.get(CHUNK_HASH_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| UploadError::Validation("chunk hash header is not ASCII".to_string()))?
                .to_string(),
        ),
        None => None,
    };

    let ack = state
        .uploads()
        .upload_chunk(id, chunk_index, body, chunk_hash)
        .await?;
    Ok(ApiResponse::ok(chunk_message(&ack), ack))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkExistsResponse {
    chunk_index: u32,
    exists: bool,
}

/// GET /api/v1/upload/:upload_id/chunks/:index
async fn chunk_exists(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, String)>,
) -> ApiResult<ChunkExistsResponse> {
    let id = UploadService::parse_upload_id(&upload_id)?;
    let chunk_index = parse_chunk_index(&index)?;

    let exists = state.uploads().chunk_exists(id, chunk_index).await?;
    Ok(ApiResponse::ok(
        "Chunk lookup complete",
        ChunkExistsResponse { chunk_index, exists },
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MissingChunksResponse {
    upload_id: Uuid,
    missing: Vec<u32>,
}

/// GET /api/v1/upload/:upload_id/missing
///
/// Chunk indices a resuming client still has to send.
async fn missing_chunks(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<MissingChunksResponse> {
    let id = UploadService::parse_upload_id(&upload_id)?;
    let missing = state.uploads().missing_chunks(id).await?;
    Ok(ApiResponse::ok(
        format!("{} chunks missing", missing.len()),
        MissingChunksResponse { upload_id: id, missing },
    ))
}

/// POST /api/v1/upload/:upload_id/merge
async fn merge(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<MergeOutcome> {
    let id = UploadService::parse_upload_id(&upload_id)?;
    let outcome = state.uploads().merge(id).await?;
    Ok(ApiResponse::ok("File merged", outcome))
}

/// GET /api/v1/upload/:upload_id
async fn progress(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<SessionDescriptor> {
    let id = UploadService::parse_upload_id(&upload_id)?;
    let descriptor = state.uploads().progress(id).await?;
    Ok(ApiResponse::ok(descriptor.status_text.clone(), descriptor))
}

/// POST /api/v1/upload/:upload_id/cancel and DELETE /api/v1/upload/:upload_id
async fn cancel(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<()> {
    let id = UploadService::parse_upload_id(&upload_id)?;
    state.uploads().cancel(id).await?;
    Ok(ApiResponse::ok("Upload cancelled", ()))
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    removed: usize,
}

/// POST /api/v1/upload/cleanup
///
/// Run an expiration sweep immediately.
async fn cleanup(State(state): State<AppState>) -> ApiResult<CleanupResponse> {
    let removed = state.uploads().cleanup_expired().await?;
    Ok(ApiResponse::ok(
        format!("Removed {} expired sessions", removed),
        CleanupResponse { removed },
    ))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_chunk_index(value: &str) -> Result<u32, UploadError> {
    value
        .trim()
        .parse()
        .map_err(|_| UploadError::Validation(format!("invalid chunk index: {:?}", value)))
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> UploadError {
    UploadError::Validation(format!("malformed multipart body: {}", e))
}

fn json_rejection(rejection: JsonRejection) -> UploadError {
    UploadError::Validation(format!("invalid request body: {}", rejection.body_text()))
}

fn multipart_rejection(rejection: MultipartRejection) -> UploadError {
    UploadError::Validation(format!("malformed multipart body: {}", rejection.body_text()))
}

fn missing_field(name: &str) -> UploadError {
    UploadError::Validation(format!("missing form field: {}", name))
}

fn chunk_message(ack: &ChunkAck) -> String {
    match (ack.duplicate, ack.complete) {
        (true, _) => format!("Chunk {} already received", ack.chunk_index),
        (false, true) => "All chunks received".to_string(),
        (false, false) => format!("Chunk {} uploaded", ack.chunk_index),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::routes::build_router;
    use crate::upload::{compute_hash, HashAlgorithm};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(temp_dir: &TempDir) -> Router {
        let mut config = Config::default();
        config.upload.chunk_dir = temp_dir.path().join("chunks");
        config.upload.artifact_dir = temp_dir.path().join("artifacts");
        let uploads = UploadService::in_memory(config.upload.clone());
        build_router(AppState::new(config, uploads))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn raw_chunk(upload_id: &str, index: u32, data: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/upload/{}/chunks/{}", upload_id, index))
            .header(CHUNK_HASH_HEADER, compute_hash(HashAlgorithm::Md5, data))
            .body(Body::from(data))
            .unwrap()
    }

    async fn init_upload(app: &Router, file_size: u64, total_chunks: u32) -> String {
        let (status, body) = send(
            app,
            json_request(
                "POST",
                "/api/v1/upload/init",
                json!({
                    "fileName": "notes.txt",
                    "fileSize": file_size,
                    "totalChunks": total_chunks,
                    "ownerId": "1001"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["data"]["uploadId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let temp_dir = TempDir::new().unwrap();
        let (status, body) = send(&app(&temp_dir), empty_request("GET", "/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_full_upload_over_http() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);
        let upload_id = init_upload(&app, 12, 2).await;

        let (status, body) = send(&app, raw_chunk(&upload_id, 1, b"World!")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["code"], "OK");
        assert_eq!(body["data"]["uploadedChunks"], 1);

        let (_, body) = send(
            &app,
            empty_request("GET", &format!("/api/v1/upload/{}/missing", upload_id)),
        )
        .await;
        assert_eq!(body["data"]["missing"], json!([0]));

        send(&app, raw_chunk(&upload_id, 0, b"Hello ")).await;
        let (_, body) = send(
            &app,
            empty_request("GET", &format!("/api/v1/upload/{}/chunks/0", upload_id)),
        )
        .await;
        assert_eq!(body["data"]["exists"], true);

        let (status, body) = send(
            &app,
            empty_request("POST", &format!("/api/v1/upload/{}/merge", upload_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let final_path = body["data"]["finalPath"].as_str().unwrap();
        assert_eq!(std::fs::read(final_path).unwrap(), b"Hello World!");

        let (_, body) = send(&app, empty_request("GET", &format!("/api/v1/upload/{}", upload_id))).await;
        assert_eq!(body["data"]["status"], "COMPLETED");
        assert_eq!(body["data"]["statusText"], "Completed");
    }

    #[tokio::test]
    async fn test_multipart_chunk_upload() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);
        let upload_id = init_upload(&app, 4, 1).await;

        let boundary = "X-UPLOAD-BOUNDARY";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"uploadId\"\r\n\r\n{id}\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"chunkIndex\"\r\n\r\n0\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"chunkMd5\"\r\n\r\n{md5}\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
             Content-Type: application/octet-stream\r\n\r\ndata\r\n\
             --{b}--\r\n",
            b = boundary,
            id = upload_id,
            md5 = compute_hash(HashAlgorithm::Md5, b"data"),
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/upload/upload")
            .header("content-type", format!("multipart/form-data; boundary={}", boundary))
            .body(Body::from(body))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["complete"], true);
        assert_eq!(body["message"], "All chunks received");
    }

    #[tokio::test]
    async fn test_error_envelopes() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);

        let (status, body) = send(
            &app,
            empty_request("GET", &format!("/api/v1/upload/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");
        assert!(body["data"].is_null());

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/v1/upload/init",
                json!({"fileName": "", "fileSize": 10, "totalChunks": 1, "ownerId": "1"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let upload_id = init_upload(&app, 6, 2).await;
        let bad_hash = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/upload/{}/chunks/0", upload_id))
            .header(CHUNK_HASH_HEADER, compute_hash(HashAlgorithm::Md5, b"other"))
            .body(Body::from("abc"))
            .unwrap();
        let (status, body) = send(&app, bad_hash).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "CHUNK_HASH_MISMATCH");

        let (status, body) = send(&app, raw_chunk(&upload_id, 5, b"abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "CHUNK_INDEX_OUT_OF_BOUNDS");

        let (status, body) = send(
            &app,
            empty_request("POST", &format!("/api/v1/upload/{}/merge", upload_id)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INCOMPLETE_UPLOAD");
    }

    #[tokio::test]
    async fn test_rejected_bodies_use_envelope() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);

        let negative_size = json_request(
            "POST",
            "/api/v1/upload/init",
            json!({"fileName": "a.bin", "fileSize": -5, "totalChunks": 1, "ownerId": "1"}),
        );
        let (status, body) = send(&app, negative_size).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(body["message"].as_str().unwrap().contains("fileSize"), "{body}");

        let not_json = Request::builder()
            .method("POST")
            .uri("/api/v1/upload/init")
            .header("content-type", "application/json")
            .body(Body::from("{\"fileName\":"))
            .unwrap();
        let (status, body) = send(&app, not_json).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let no_content_type = Request::builder()
            .method("POST")
            .uri("/api/v1/upload/init")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(&app, no_content_type).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let not_multipart = Request::builder()
            .method("POST")
            .uri("/api/v1/upload/upload")
            .header("content-type", "text/plain")
            .body(Body::from("chunk"))
            .unwrap();
        let (status, body) = send(&app, not_multipart).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(body["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_cancel_then_upload_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);
        let upload_id = init_upload(&app, 6, 2).await;

        let (status, _) = send(
            &app,
            empty_request("DELETE", &format!("/api/v1/upload/{}", upload_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, raw_chunk(&upload_id, 0, b"abc")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_STATE");

        let (status, body) = send(&app, empty_request("POST", "/api/v1/upload/cleanup")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["removed"], 0);
    }
}
