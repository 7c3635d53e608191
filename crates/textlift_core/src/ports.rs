//! crates/textlift_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    Annotation, BookMetadata, Document, OutboxEntry, PdfMetadata, PipelineEvent, Textbook,
    UploadSession, UploadStatus, User,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Persistent storage for every entity plus the pipeline outbox.
///
/// Methods taking a `PipelineEvent` must persist the event in the same
/// transaction as the state change, so a consumer never sees an event before
/// the row it refers to is committed.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Identity ---
    async fn get_user(&self, user_id: Uuid) -> PortResult<User>;

    /// Resolves an auth session cookie to its user id.
    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid>;

    // --- Upload Sessions ---
    async fn create_upload_session(&self, session: &UploadSession) -> PortResult<()>;

    /// Any owner's PENDING or UPLOADING session carrying this hash.
    async fn find_in_flight_upload_by_hash(&self, content_hash: &str) -> PortResult<Option<UploadSession>>;

    /// The session, only if `owner_id` owns it.
    async fn find_upload_session_for_owner(
        &self,
        upload_id: Uuid,
        owner_id: Uuid,
    ) -> PortResult<Option<UploadSession>>;

    /// Moves the session from `from` to `to`; returns false if it was not in `from`.
    async fn transition_upload_status(
        &self,
        upload_id: Uuid,
        from: UploadStatus,
        to: UploadStatus,
    ) -> PortResult<bool>;

    /// UPLOADING -> UPLOADED, recording the client's file name.
    async fn complete_upload(&self, upload_id: Uuid, original_file_name: Option<&str>) -> PortResult<bool>;

    async fn owner_has_upload_for_hash(&self, owner_id: Uuid, content_hash: &str) -> PortResult<bool>;

    async fn list_upload_hashes_for_owner(&self, owner_id: Uuid) -> PortResult<Vec<String>>;

    /// Returns how many sessions were removed.
    async fn delete_uploads_for_owner_and_hash(&self, owner_id: Uuid, content_hash: &str) -> PortResult<u64>;

    // --- Documents ---
    async fn get_document(&self, document_id: Uuid) -> PortResult<Document>;

    async fn find_document_by_hash(&self, content_hash: &str) -> PortResult<Option<Document>>;

    async fn list_documents_by_hashes(&self, content_hashes: &[String]) -> PortResult<Vec<Document>>;

    /// Inserts `document` and enqueues `event` unless a document with the same
    /// hash already exists, in which case the existing row is returned and
    /// nothing is enqueued. The flag reports whether a row was created.
    async fn create_document_if_absent(
        &self,
        document: &Document,
        event: &PipelineEvent,
    ) -> PortResult<(Document, bool)>;

    /// Persists status, file path, textbook link and last error; enqueues
    /// `event` in the same transaction when given.
    async fn update_document(&self, document: &Document, event: Option<&PipelineEvent>) -> PortResult<()>;

    // --- Textbooks ---
    async fn get_textbook(&self, textbook_id: Uuid) -> PortResult<Textbook>;

    async fn find_textbook_by_isbn(&self, isbn: &str) -> PortResult<Option<Textbook>>;

    /// Inserts the textbook unless its ISBN exists; returns the stored row either way.
    async fn create_textbook_if_absent(&self, textbook: &Textbook) -> PortResult<Textbook>;

    async fn update_textbook(&self, textbook: &Textbook) -> PortResult<()>;

    // --- Annotations ---
    /// The textbook's current annotation with its notes in order.
    async fn find_annotation_for_textbook(&self, textbook_id: Uuid) -> PortResult<Option<Annotation>>;

    /// Replaces the textbook's annotation with `annotation` and persists
    /// `document` in the same transaction.
    async fn save_annotation(&self, annotation: &Annotation, document: &Document) -> PortResult<()>;

    // --- Pipeline Outbox ---
    /// Leases up to `limit` unprocessed events in commit order. A leased event
    /// becomes claimable again once `lease` elapses without completion.
    async fn claim_outbox_events(&self, limit: usize, lease: Duration) -> PortResult<Vec<OutboxEntry>>;

    /// Pushes the lease of an event still being worked on to `lease` from now.
    async fn extend_outbox_lease(&self, event_id: Uuid, lease: Duration) -> PortResult<()>;

    async fn complete_outbox_event(&self, event_id: Uuid) -> PortResult<()>;

    /// Marks the event processed but failed, keeping `error` for inspection.
    async fn dead_letter_outbox_event(&self, event_id: Uuid, error: &str) -> PortResult<()>;
}

#[async_trait]
pub trait TextExtractionService: Send + Sync {
    /// Reads the PDF at `pdf_path`, writes its full text to `text_path` and
    /// returns the document information metadata.
    async fn extract(&self, pdf_path: &Path, text_path: &Path) -> PortResult<PdfMetadata>;
}

#[async_trait]
pub trait BookLookupService: Send + Sync {
    /// `Ok(None)` when the lookup has no match.
    async fn lookup_by_isbn(&self, isbn: &str) -> PortResult<Option<BookMetadata>>;
}

#[async_trait]
pub trait StructuredCompletionService: Send + Sync {
    /// Sends a prompt that asks for JSON and returns the model's raw text reply.
    async fn complete_structured(&self, prompt: &str) -> PortResult<String>;
}
