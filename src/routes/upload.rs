//! Attachment Upload Routes
//!
//! HTTP endpoints for the resumable chunked upload protocol.
//!
//! Endpoints:
//! - POST /api/attachments/initiate - Open an upload session
//! - POST /api/attachments/upload-chunk - Upload one chunk (multipart)
//! - POST /api/attachments/finalize/:upload_id - Assemble the committed file
//! - GET /api/attachments/status/:upload_id - Session snapshot
//! - DELETE /api/attachments/cleanup/:upload_id - Cancel an upload
//! - GET /api/attachments/download/:file_name - Download a committed file
//! - DELETE /api/attachments/files/:file_name - Delete a committed file

use axum::{
    body::Body,
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::auth::AuthenticatedUser;
use crate::state::AppState;
use crate::upload::{
    CleanupResponse, DeleteFileResponse, FinalizeResponse, InitiateRequest, InitiateResponse,
    SessionStatusResponse, UploadError,
};

/// Header carrying the upload id on chunk uploads
pub const UPLOAD_ID_HEADER: &str = "x-upload-id";

/// Room for multipart boundaries and the small text fields around a chunk
const MULTIPART_OVERHEAD: usize = 64 * 1024;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Attachment request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the attachment router
pub fn router(max_chunk_size: usize) -> Router<AppState> {
    Router::new()
        .route("/initiate", post(initiate))
        .route(
            "/upload-chunk",
            post(upload_chunk)
                .layer(DefaultBodyLimit::max(max_chunk_size.saturating_add(MULTIPART_OVERHEAD))),
        )
        .route("/finalize/:upload_id", post(finalize))
        .route("/status/:upload_id", get(status))
        .route("/cleanup/:upload_id", delete(cleanup))
        .route("/download/:file_name", get(download))
        .route("/files/:file_name", delete(delete_file))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/attachments/initiate
async fn initiate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<InitiateRequest>,
) -> Result<Json<InitiateResponse>, UploadError> {
    let upload = state
        .coordinator()
        .initiate(
            &request.file_name,
            request.total_size,
            request.content_type,
            user.name(),
        )
        .await?;

    Ok(Json(InitiateResponse {
        upload_id: upload.token,
        server_file_name: upload.server_name,
    }))
}

/// POST /api/attachments/upload-chunk
///
/// The upload id travels in `X-Upload-Id`; the body is multipart with
/// `chunkNumber` (0-based), `totalChunks` and `file`.
async fn upload_chunk(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<String, UploadError> {
    let upload_id = headers
        .get(UPLOAD_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| UploadError::InvalidRequest("missing X-Upload-Id header".to_string()))?
        .to_string();

    let mut chunk_number: Option<u32> = None;
    let mut total_chunks: Option<u32> = None;
    let mut data = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::warn!(upload_id = %upload_id, error = %e, "Failed to read multipart field");
        UploadError::InvalidRequest(format!("malformed multipart body: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "chunkNumber" => chunk_number = Some(parse_number(field, "chunkNumber").await?),
            "totalChunks" => total_chunks = Some(parse_number(field, "totalChunks").await?),
            "file" => {
                let bytes = field.bytes().await.map_err(|e| {
                    UploadError::InvalidRequest(format!("failed to read chunk data: {}", e))
                })?;
                data = Some(bytes);
            }
            _ => {}
        }
    }

    let chunk_number = chunk_number
        .ok_or_else(|| UploadError::InvalidRequest("missing field chunkNumber".to_string()))?;
    let total_chunks = total_chunks
        .ok_or_else(|| UploadError::InvalidRequest("missing field totalChunks".to_string()))?;
    let data = data.ok_or_else(|| UploadError::InvalidRequest("missing field file".to_string()))?;

    state
        .coordinator()
        .upload_chunk(&upload_id, chunk_number, total_chunks, &data, user.name())
        .await?;

    Ok(format!("Chunk {}/{} uploaded", chunk_number + 1, total_chunks))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeQuery {
    original_file_name: Option<String>,
}

/// POST /api/attachments/finalize/:upload_id
async fn finalize(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
    Query(query): Query<FinalizeQuery>,
) -> Result<Json<FinalizeResponse>, UploadError> {
    let file_name = state
        .coordinator()
        .finalize(&upload_id, user.name(), query.original_file_name.as_deref())
        .await?;

    Ok(Json(FinalizeResponse {
        message: "File uploaded successfully".to_string(),
        file_name,
        upload_id,
    }))
}

/// GET /api/attachments/status/:upload_id
async fn status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, UploadError> {
    let session = state.coordinator().status(&upload_id, user.name()).await?;
    Ok(Json(session.into()))
}

/// DELETE /api/attachments/cleanup/:upload_id
async fn cleanup(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> Result<Json<CleanupResponse>, UploadError> {
    state.coordinator().cancel(&upload_id, user.name()).await?;

    Ok(Json(CleanupResponse {
        message: "Upload cancelled".to_string(),
        upload_id,
    }))
}

/// GET /api/attachments/download/:file_name
async fn download(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_name): Path<String>,
) -> Result<Response, UploadError> {
    let (path, size) = state.coordinator().open_artifact(&file_name, user.name()).await?;

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            UploadError::ArtifactNotFound(file_name.clone())
        } else {
            UploadError::Storage(e.to_string())
        }
    })?;

    let content_type = mime_guess::from_path(&path).first_or_octet_stream();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type.as_ref())
        .header(header::CONTENT_LENGTH, size)
        .header(header::CONTENT_DISPOSITION, content_disposition(&file_name))
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| UploadError::Storage(e.to_string()))
}

/// DELETE /api/attachments/files/:file_name
async fn delete_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_name): Path<String>,
) -> Result<Json<DeleteFileResponse>, UploadError> {
    state.coordinator().delete_artifact(&file_name, user.name()).await?;

    Ok(Json(DeleteFileResponse {
        message: "File deleted".to_string(),
        file_name,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

async fn parse_number(field: Field<'_>, name: &str) -> Result<u32, UploadError> {
    let text = field
        .text()
        .await
        .map_err(|e| UploadError::InvalidRequest(format!("failed to read {}: {}", name, e)))?;

    text.trim()
        .parse()
        .map_err(|_| UploadError::InvalidRequest(format!("{} must be a non-negative integer", name)))
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 name
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(file_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::auth::USER_HEADER;
    use crate::config::Config;
    use crate::routes;
    use crate::upload::{ArtifactStore, MemorySessionStore, StagingArea, TokenLocks, UploadCoordinator};
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "attachment-test-boundary";

    async fn test_app() -> (TempDir, Router) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.upload.artifact_dir = temp_dir.path().join("files");
        config.upload.staging_dir = temp_dir.path().join("staging");

        let staging = StagingArea::open(&config.upload.staging_dir).await.unwrap();
        let artifacts = ArtifactStore::open(&config.upload.artifact_dir).await.unwrap();
        let coordinator = UploadCoordinator::new(
            Arc::new(MemorySessionStore::new()),
            staging,
            artifacts,
            TokenLocks::new(),
            Arc::new(TracingAuditSink),
        );

        let app = routes::app(AppState::new(config, coordinator));
        (temp_dir, app)
    }

    fn multipart_body(index: u32, total: u32, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in [("chunkNumber", index), ("totalChunks", total)] {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                BOUNDARY
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>, HeaderMap) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec(), headers)
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    fn request(method: &str, uri: &str, user: Option<&str>) -> axum::http::request::Builder {
        let builder = Request::builder().method(method).uri(uri);
        match user {
            Some(user) => builder.header(USER_HEADER, user),
            None => builder,
        }
    }

    async fn initiate_upload(app: &Router, user: &str, file_name: &str) -> (StatusCode, serde_json::Value) {
        let payload = serde_json::json!({ "fileName": file_name, "totalSize": 300000 });
        let (status, body, _) = send(
            app,
            request("POST", "/api/attachments/initiate", Some(user))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await;
        (status, json(&body))
    }

    async fn upload(app: &Router, user: &str, upload_id: &str, index: u32, total: u32, data: &[u8]) -> (StatusCode, Vec<u8>) {
        let (status, body, _) = send(
            app,
            request("POST", "/api/attachments/upload-chunk", Some(user))
                .header(UPLOAD_ID_HEADER, upload_id)
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(multipart_body(index, total, data)))
                .unwrap(),
        )
        .await;
        (status, body)
    }

    #[tokio::test]
    async fn test_full_upload_flow() {
        let (_temp_dir, app) = test_app().await;

        let (status, initiated) = initiate_upload(&app, "alice", "contract.pdf").await;
        assert_eq!(status, StatusCode::OK);
        let upload_id = initiated["uploadId"].as_str().unwrap().to_string();
        let server_name = initiated["serverFileName"].as_str().unwrap().to_string();
        assert!(server_name.starts_with("contract_"));

        for (index, data) in [(2u32, &b"c"[..]), (0, b"a"), (1, b"b")] {
            let (status, body) = upload(&app, "alice", &upload_id, index, 3, data).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(
                String::from_utf8(body).unwrap(),
                format!("Chunk {}/3 uploaded", index + 1)
            );
        }

        let (status, body, _) = send(
            &app,
            request("GET", &format!("/api/attachments/status/{}", upload_id), Some("alice"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let snapshot = json(&body);
        assert_eq!(snapshot["status"], "IN_PROGRESS");
        assert_eq!(snapshot["uploadedChunks"], serde_json::json!([0, 1, 2]));
        assert_eq!(snapshot["totalChunks"], 3);

        let (status, body, _) = send(
            &app,
            request(
                "POST",
                &format!("/api/attachments/finalize/{}?originalFileName=contract.pdf", upload_id),
                Some("alice"),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let finalized = json(&body);
        assert_eq!(finalized["fileName"], server_name.as_str());
        assert_eq!(finalized["uploadId"], upload_id.as_str());

        let (status, body, headers) = send(
            &app,
            request("GET", &format!("/api/attachments/download/{}", server_name), Some("bob"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"abc");
        assert_eq!(headers[header::CONTENT_TYPE], "application/pdf");
        assert!(headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("attachment;"));

        let (status, _, _) = send(
            &app,
            request("DELETE", &format!("/api/attachments/files/{}", server_name), Some("alice"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body, _) = send(
            &app,
            request("GET", &format!("/api/attachments/download/{}", server_name), Some("alice"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["code"], "ARTIFACT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let (_temp_dir, app) = test_app().await;

        let (status, body, _) = send(
            &app,
            request("POST", "/api/attachments/initiate", None)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"fileName":"a.pdf","totalSize":1}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json(&body)["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_foreign_session_looks_unknown() {
        let (_temp_dir, app) = test_app().await;
        let (_, initiated) = initiate_upload(&app, "alice", "a.pdf").await;
        let upload_id = initiated["uploadId"].as_str().unwrap();

        let foreign = send(
            &app,
            request("GET", &format!("/api/attachments/status/{}", upload_id), Some("mallory"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let unknown = send(
            &app,
            request("GET", "/api/attachments/status/does-not-exist", Some("mallory"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(foreign.0, StatusCode::NOT_FOUND);
        assert_eq!(unknown.0, StatusCode::NOT_FOUND);
        assert_eq!(json(&foreign.1)["code"], json(&unknown.1)["code"]);

        let (status, _) = upload(&app, "mallory", upload_id, 0, 1, b"x").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_names_rejected() {
        let (_temp_dir, app) = test_app().await;

        let (status, body) = initiate_upload(&app, "alice", "../../etc/passwd").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");

        let (status, body, _) = send(
            &app,
            request("GET", "/api/attachments/download/..%2Fstaging", Some("alice"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["code"], "PATH_VIOLATION");
    }

    #[tokio::test]
    async fn test_early_finalize_conflicts() {
        let (_temp_dir, app) = test_app().await;
        let (_, initiated) = initiate_upload(&app, "alice", "a.pdf").await;
        let upload_id = initiated["uploadId"].as_str().unwrap();

        upload(&app, "alice", upload_id, 0, 2, b"a").await;

        let (status, body, _) = send(
            &app,
            request("POST", &format!("/api/attachments/finalize/{}", upload_id), Some("alice"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json(&body)["code"], "INCOMPLETE_UPLOAD");
    }

    #[tokio::test]
    async fn test_chunk_requires_upload_id() {
        let (_temp_dir, app) = test_app().await;

        let (status, body, _) = send(
            &app,
            request("POST", "/api/attachments/upload-chunk", Some("alice"))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(multipart_body(0, 1, b"x")))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_cleanup_cancels_session() {
        let (_temp_dir, app) = test_app().await;
        let (_, initiated) = initiate_upload(&app, "alice", "a.pdf").await;
        let upload_id = initiated["uploadId"].as_str().unwrap();

        let cleanup = |user: &'static str| {
            request("DELETE", &format!("/api/attachments/cleanup/{}", upload_id), Some(user))
                .body(Body::empty())
                .unwrap()
        };

        let (status, body, _) = send(&app, cleanup("alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["uploadId"], upload_id);

        let (status, body, _) = send(&app, cleanup("alice")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json(&body)["code"], "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_health() {
        let (_temp_dir, app) = test_app().await;
        let (status, body, _) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "healthy");
    }

    #[test]
    fn test_content_disposition_escapes_non_ascii() {
        let value = content_disposition("合同_20240309-140507_abc123.pdf");
        assert!(value.starts_with("attachment; filename=\"__20240309-140507_abc123.pdf\""));
        assert!(value.contains("filename*=UTF-8''%E5%90%88%E5%90%8C_"));
    }
}
