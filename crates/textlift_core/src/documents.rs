//! crates/textlift_core/src/documents.rs
//!
//! Owner-scoped queries over documents: listing, status, annotation notes and
//! removal of the caller's upload record.
//!
//! Ownership is by content: a user owns a document when one of their upload
//! sessions carries the document's hash.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::{AnnotationNote, Document, DocumentProgress, DocumentStatus, UserUpload};
use crate::error::{ServiceError, ServiceResult};
use crate::ports::DatabaseService;

/// Name reported for a document that is not linked to a textbook.
pub const UNLINKED_TEXTBOOK_NAME: &str = "UNKNOWN";

pub struct DocumentService {
    db: Arc<dyn DatabaseService>,
}

impl DocumentService {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    pub async fn list_user_uploads(&self, owner_id: Uuid) -> ServiceResult<Vec<UserUpload>> {
        let hashes = self.db.list_upload_hashes_for_owner(owner_id).await?;
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self.db.list_documents_by_hashes(&hashes).await?;
        let mut uploads = Vec::with_capacity(documents.len());
        for document in documents {
            let upload = match document.textbook_id {
                Some(textbook_id) => {
                    let textbook = self.db.get_textbook(textbook_id).await?;
                    UserUpload {
                        textbook_name: textbook.name.unwrap_or_else(|| UNLINKED_TEXTBOOK_NAME.to_string()),
                        document_status: document.status,
                        document_id: document.id,
                    }
                }
                None => UserUpload {
                    textbook_name: UNLINKED_TEXTBOOK_NAME.to_string(),
                    document_status: DocumentStatus::FailedToIdentifyIsbn,
                    document_id: document.id,
                },
            };
            uploads.push(upload);
        }
        Ok(uploads)
    }

    /// Removes the caller's upload sessions for the document's content. The
    /// document itself stays, as other users may own the same content.
    pub async fn delete_user_upload(&self, owner_id: Uuid, document_id: Uuid) -> ServiceResult<()> {
        let document = self.find_document(document_id).await?;
        let removed = self
            .db
            .delete_uploads_for_owner_and_hash(owner_id, &document.content_hash)
            .await?;
        if removed == 0 {
            return Err(ServiceError::NotFound("No upload found for this document".to_string()));
        }
        info!(%owner_id, %document_id, removed, "Upload record deleted");
        Ok(())
    }

    /// The notes of the document's current annotation, in order.
    pub async fn notes_for_document(&self, owner_id: Uuid, document_id: Uuid) -> ServiceResult<Vec<AnnotationNote>> {
        let document = self.owned_document(owner_id, document_id).await?;
        let not_ready = || {
            ServiceError::Conflict(format!(
                "Annotations are not ready, document is {}",
                document.status
            ))
        };
        if document.status != DocumentStatus::AnnotationsReady {
            return Err(not_ready());
        }
        let textbook_id = document.textbook_id.ok_or_else(not_ready)?;
        let annotation = self
            .db
            .find_annotation_for_textbook(textbook_id)
            .await?
            .ok_or_else(not_ready)?;

        let mut notes = annotation.notes;
        notes.sort_by_key(|n| n.position);
        Ok(notes)
    }

    pub async fn document_status(&self, owner_id: Uuid, document_id: Uuid) -> ServiceResult<DocumentProgress> {
        let document = self.owned_document(owner_id, document_id).await?;
        Ok(DocumentProgress {
            document_id: document.id,
            status: document.status,
            failed: document.status.is_failure(),
            last_error: document.last_error,
        })
    }

    async fn find_document(&self, document_id: Uuid) -> ServiceResult<Document> {
        self.db.get_document(document_id).await.map_err(|e| match e {
            crate::ports::PortError::NotFound(_) => ServiceError::NotFound("Document not found".to_string()),
            other => other.into(),
        })
    }

    async fn owned_document(&self, owner_id: Uuid, document_id: Uuid) -> ServiceResult<Document> {
        let document = self.find_document(document_id).await?;
        if !self.db.owner_has_upload_for_hash(owner_id, &document.content_hash).await? {
            return Err(ServiceError::Forbidden("You do not have access to this document".to_string()));
        }
        Ok(document)
    }
}

