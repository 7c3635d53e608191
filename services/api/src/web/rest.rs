//! services/api/src/web/rest.rs
//!
//! The master definition for the OpenAPI specification.

use crate::web::documents::{
    self, AnnotationsResponse, DocumentStatusResponse, NoteResponse, UserUploadResponse,
};
use crate::web::problem::Problem;
use crate::web::upload::{
    self, CreateUploadRequest, CreateUploadResponse, FinalizeUploadResponse, UploadFileResponse,
    UploadStatusResponse,
};
use utoipa::OpenApi;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        upload::create_upload_handler,
        upload::upload_file_handler,
        upload::finalize_upload_handler,
        upload::upload_status_handler,
        documents::list_uploads_handler,
        documents::delete_upload_handler,
        documents::document_status_handler,
        documents::annotations_handler,
    ),
    components(
        schemas(
            CreateUploadRequest,
            CreateUploadResponse,
            UploadFileResponse,
            FinalizeUploadResponse,
            UploadStatusResponse,
            UserUploadResponse,
            DocumentStatusResponse,
            NoteResponse,
            AnnotationsResponse,
            Problem
        )
    ),
    tags(
        (name = "Uploads", description = "Deduplicated PDF upload sessions."),
        (name = "Documents", description = "The caller's documents and their pipeline progress."),
        (name = "Annotations", description = "Notes extracted from identified textbooks.")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_is_documented() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        for expected in [
            "/api/v1/upload",
            "/api/v1/upload/{upload_id}/file",
            "/api/v1/upload/{upload_id}/finalize",
            "/api/v1/upload/{upload_id}/status",
            "/api/v1/documents/uploads",
            "/api/v1/documents/uploads/{document_id}",
            "/api/v1/documents/{document_id}/status",
            "/api/v1/annotations/{document_id}",
        ] {
            assert!(paths.iter().any(|p| p.as_str() == expected), "missing {}", expected);
        }
    }
}
