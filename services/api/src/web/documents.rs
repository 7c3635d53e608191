//! services/api/src/web/documents.rs
//!
//! Handlers for the caller's documents and their annotation notes.

use crate::web::problem::{ApiFailure, Problem};
use crate::web::state::AppState;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use textlift_core::domain::{AnnotationNote, DocumentProgress, UserUpload};
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// API Payload Structs
//=========================================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserUploadResponse {
    pub textbook_name: String,
    pub document_status: String,
    pub document_id: Uuid,
}

impl From<UserUpload> for UserUploadResponse {
    fn from(upload: UserUpload) -> Self {
        Self {
            textbook_name: upload.textbook_name,
            document_status: upload.document_status.as_str().to_string(),
            document_id: upload.document_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatusResponse {
    pub document_id: Uuid,
    pub status: String,
    /// True once the document parked in one of the `FAILED_*` statuses.
    pub failed: bool,
    pub last_error: Option<String>,
}

impl From<DocumentProgress> for DocumentStatusResponse {
    fn from(progress: DocumentProgress) -> Self {
        Self {
            document_id: progress.document_id,
            status: progress.status.as_str().to_string(),
            failed: progress.failed,
            last_error: progress.last_error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NoteResponse {
    pub note: String,
    pub reason: String,
    pub quote: String,
    pub location: String,
}

impl From<AnnotationNote> for NoteResponse {
    fn from(note: AnnotationNote) -> Self {
        Self {
            note: note.note,
            reason: note.reason,
            quote: note.quote,
            location: note.location,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AnnotationsResponse {
    pub notes: Vec<NoteResponse>,
}

//=========================================================================================
// Handlers
//=========================================================================================

/// List the documents the caller has uploaded.
#[utoipa::path(
    get,
    path = "/api/v1/documents/uploads",
    responses(
        (status = 200, description = "The caller's documents", body = [UserUploadResponse]),
        (status = 401, description = "Not authenticated", body = Problem)
    ),
    tag = "Documents"
)]
pub async fn list_uploads_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
) -> Result<Json<Vec<UserUploadResponse>>, ApiFailure> {
    let uploads = state.documents.list_user_uploads(user_id).await?;
    Ok(Json(uploads.into_iter().map(Into::into).collect()))
}

/// Remove the caller's upload record for a document.
#[utoipa::path(
    delete,
    path = "/api/v1/documents/uploads/{document_id}",
    params(("document_id" = Uuid, Path, description = "The document.")),
    responses(
        (status = 204, description = "Upload record removed"),
        (status = 404, description = "No document, or no upload of it by the caller", body = Problem)
    ),
    tag = "Documents"
)]
pub async fn delete_upload_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(document_id): Path<Uuid>,
) -> Result<StatusCode, ApiFailure> {
    state.documents.delete_user_upload(user_id, document_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Pipeline progress of one document, including failures.
#[utoipa::path(
    get,
    path = "/api/v1/documents/{document_id}/status",
    params(("document_id" = Uuid, Path, description = "The document.")),
    responses(
        (status = 200, description = "Current pipeline status", body = DocumentStatusResponse),
        (status = 403, description = "Caller never uploaded this content", body = Problem),
        (status = 404, description = "No such document", body = Problem)
    ),
    tag = "Documents"
)]
pub async fn document_status_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<DocumentStatusResponse>, ApiFailure> {
    let progress = state.documents.document_status(user_id, document_id).await?;
    Ok(Json(progress.into()))
}

/// The ordered notes of a document's current annotation.
#[utoipa::path(
    get,
    path = "/api/v1/annotations/{document_id}",
    params(("document_id" = Uuid, Path, description = "The document.")),
    responses(
        (status = 200, description = "Annotation notes in order", body = AnnotationsResponse),
        (status = 403, description = "Caller never uploaded this content", body = Problem),
        (status = 404, description = "No such document", body = Problem),
        (status = 409, description = "Annotations are not ready yet", body = Problem)
    ),
    tag = "Annotations"
)]
pub async fn annotations_handler(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<AnnotationsResponse>, ApiFailure> {
    let notes = state.documents.notes_for_document(user_id, document_id).await?;
    Ok(Json(AnnotationsResponse {
        notes: notes.into_iter().map(Into::into).collect(),
    }))
}
