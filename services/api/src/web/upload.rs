//! services/api/src/web/upload.rs
//!
//! Handlers for the upload-session lifecycle: create, send bytes, finalize, poll.

use crate::web::problem::{ApiFailure, Problem};
use crate::web::state::AppState;
use axum::{
    extract::{Extension, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use textlift_core::domain::CreateUploadOutcome;
use textlift_core::ServiceError;
use tracing::info;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Name of the multipart part that carries the PDF.
pub const FILE_FIELD: &str = "file";

//=========================================================================================
// API Payload Structs
//=========================================================================================

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadRequest {
    /// Hex digest of the file content, computed by the client.
    pub content_hash: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadResponse {
    /// One of `NEW_UPLOAD`, `CACHE_HIT`, `CACHE_HIT_WAIT`.
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
}

impl From<CreateUploadOutcome> for CreateUploadResponse {
    fn from(outcome: CreateUploadOutcome) -> Self {
        Self {
            mode: outcome.mode.as_str().to_string(),
            upload_id: outcome.upload_id,
            status: outcome.status.map(|s| s.as_str().to_string()),
            document_id: outcome.document_id,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct UploadFileQuery {
    /// Size the client announces for the file, checked against the bytes received.
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileResponse {
    pub upload_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeUploadResponse {
    pub document_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadStatusResponse {
    pub status: String,
}

//=========================================================================================
// Handlers
//=========================================================================================

/// Start an upload, or learn that the content is already known.
#[utoipa::path(
    post,
    path = "/api/v1/upload",
    request_body = CreateUploadRequest,
    responses(
        (status = 200, description = "How to proceed with this content", body = CreateUploadResponse),
        (status = 401, description = "Not authenticated", body = Problem),
        (status = 404, description = "Caller is not a known user", body = Problem),
        (status = 409, description = "The content exists in a failed state", body = Problem),
        (status = 413, description = "Declared size is above the ceiling", body = Problem)
    ),
    tag = "Uploads"
)]
pub async fn create_upload_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Json(payload): Json<CreateUploadRequest>,
) -> Result<Json<CreateUploadResponse>, ApiFailure> {
    let outcome = state
        .uploads
        .create_upload(user_id, &payload.content_hash, payload.size_bytes)
        .await?;
    Ok(Json(outcome.into()))
}

/// Send the PDF bytes for a pending upload session.
#[utoipa::path(
    post,
    path = "/api/v1/upload/{upload_id}/file",
    request_body(content_type = "multipart/form-data", description = "A form with a single `file` part."),
    params(
        ("upload_id" = Uuid, Path, description = "The upload session."),
        UploadFileQuery
    ),
    responses(
        (status = 200, description = "Bytes stored", body = UploadFileResponse),
        (status = 400, description = "Missing or empty file", body = Problem),
        (status = 404, description = "No such session for this caller", body = Problem),
        (status = 409, description = "Session is not PENDING", body = Problem),
        (status = 413, description = "File is above the ceiling", body = Problem),
        (status = 415, description = "Not a PDF", body = Problem),
        (status = 500, description = "Storage failure", body = Problem)
    ),
    tag = "Uploads"
)]
pub async fn upload_file_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(upload_id): Path<Uuid>,
    Query(query): Query<UploadFileQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadFileResponse>, ApiFailure> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::BadRequest(format!("Failed to read multipart data: {}", e)))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let session = state
            .uploads
            .accept_bytes(upload_id, user_id, file_name, query.size_bytes, Box::pin(field))
            .await?;
        return Ok(Json(UploadFileResponse {
            upload_id: session.id,
            status: session.status.as_str().to_string(),
        }));
    }
    Err(ServiceError::BadRequest("Multipart form must include a \"file\" part".to_string()).into())
}

/// Turn an uploaded session into a document and queue it for processing.
#[utoipa::path(
    post,
    path = "/api/v1/upload/{upload_id}/finalize",
    params(("upload_id" = Uuid, Path, description = "The upload session.")),
    responses(
        (status = 200, description = "Document created, or the existing one for this content", body = FinalizeUploadResponse),
        (status = 404, description = "No such session for this caller", body = Problem),
        (status = 409, description = "Session is not UPLOADED yet", body = Problem)
    ),
    tag = "Uploads"
)]
pub async fn finalize_upload_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(upload_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    let document = state.uploads.finalize(upload_id, user_id).await?;
    info!(document_id = %document.id, %upload_id, "Upload finalized");
    Ok((
        StatusCode::OK,
        Json(FinalizeUploadResponse {
            document_id: document.id,
            status: document.status.as_str().to_string(),
        }),
    ))
}

/// Current state of an upload session.
#[utoipa::path(
    get,
    path = "/api/v1/upload/{upload_id}/status",
    params(("upload_id" = Uuid, Path, description = "The upload session.")),
    responses(
        (status = 200, description = "Session status", body = UploadStatusResponse),
        (status = 404, description = "No such session for this caller", body = Problem)
    ),
    tag = "Uploads"
)]
pub async fn upload_status_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<UploadStatusResponse>, ApiFailure> {
    let status = state.uploads.poll_status(upload_id, user_id).await?;
    Ok(Json(UploadStatusResponse {
        status: status.as_str().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use textlift_core::domain::{UploadMode, UploadStatus};

    #[test]
    fn absent_fields_are_left_out_of_the_response() {
        let outcome = CreateUploadOutcome {
            mode: UploadMode::CacheHitWait,
            upload_id: None,
            status: None,
            document_id: None,
        };
        let json = serde_json::to_value(CreateUploadResponse::from(outcome)).unwrap();
        assert_eq!(json, serde_json::json!({ "mode": "CACHE_HIT_WAIT" }));
    }

    #[test]
    fn new_upload_response_uses_camel_case() {
        let id = Uuid::new_v4();
        let outcome = CreateUploadOutcome {
            mode: UploadMode::NewUpload,
            upload_id: Some(id),
            status: Some(UploadStatus::Pending),
            document_id: None,
        };
        let json = serde_json::to_value(CreateUploadResponse::from(outcome)).unwrap();
        assert_eq!(json["mode"], "NEW_UPLOAD");
        assert_eq!(json["uploadId"], id.to_string());
        assert_eq!(json["status"], "PENDING");
    }
}
