//! crates/textlift_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! Entities reference each other by id only; relations are resolved through the
//! `DatabaseService` port rather than held as object graphs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Name given to placeholder textbooks created when no ISBN could be found.
pub const UNKNOWN_TEXTBOOK_NAME: &str = "UNKNOWN_TEXTBOOK";

/// Prefix of the synthetic ISBN carried by placeholder textbooks.
pub const PLACEHOLDER_ISBN_PREFIX: &str = "UNKNOWN_ISBN_";

/// Raised when a persisted status string does not name a known variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

// Represents a user - identity is issued elsewhere, we only reference it
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub email: Option<String>,
}

//=========================================================================================
// Upload Sessions
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "PENDING",
            UploadStatus::Uploading => "UPLOADING",
            UploadStatus::Uploaded => "UPLOADED",
            UploadStatus::Failed => "FAILED",
        }
    }

    /// Bytes are expected (or currently moving) for sessions in these states.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, UploadStatus::Pending | UploadStatus::Uploading)
    }

    /// PENDING -> UPLOADING -> UPLOADED, or any non-terminal state -> FAILED.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        matches!(
            (self, next),
            (UploadStatus::Pending, UploadStatus::Uploading)
                | (UploadStatus::Uploading, UploadStatus::Uploaded)
                | (UploadStatus::Pending, UploadStatus::Failed)
                | (UploadStatus::Uploading, UploadStatus::Failed)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(UploadStatus::Pending),
            "UPLOADING" => Ok(UploadStatus::Uploading),
            "UPLOADED" => Ok(UploadStatus::Uploaded),
            "FAILED" => Ok(UploadStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One client's attempt to submit a file.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub content_hash: String,
    pub status: UploadStatus,
    pub original_file_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(owner_id: Uuid, content_hash: &str, status: UploadStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            content_hash: content_hash.to_string(),
            status,
            original_file_name: None,
            created_at: Utc::now(),
        }
    }
}

/// How the caller of `create_upload` should proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadMode {
    /// Start sending bytes to the returned upload session.
    NewUpload,
    /// The content is fully processed; use the returned document id.
    CacheHit,
    /// The content is already in flight; poll and retry later.
    CacheHitWait,
}

impl UploadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMode::NewUpload => "NEW_UPLOAD",
            UploadMode::CacheHit => "CACHE_HIT",
            UploadMode::CacheHitWait => "CACHE_HIT_WAIT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUploadOutcome {
    pub mode: UploadMode,
    pub upload_id: Option<Uuid>,
    pub status: Option<UploadStatus>,
    pub document_id: Option<Uuid>,
}

//=========================================================================================
// Documents
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Ready,
    TextExtracted,
    TextbookIdentified,
    AnnotationsGenerating,
    AnnotationsReady,
    FailedTextExtraction,
    FailedToIdentifyIsbn,
    FailedAnnotations,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Ready => "READY",
            DocumentStatus::TextExtracted => "TEXT_EXTRACTED",
            DocumentStatus::TextbookIdentified => "TEXTBOOK_IDENTIFIED",
            DocumentStatus::AnnotationsGenerating => "ANNOTATIONS_GENERATING",
            DocumentStatus::AnnotationsReady => "ANNOTATIONS_READY",
            DocumentStatus::FailedTextExtraction => "FAILED_TEXT_EXTRACTION",
            DocumentStatus::FailedToIdentifyIsbn => "FAILED_TO_IDENTIFY_ISBN",
            DocumentStatus::FailedAnnotations => "FAILED_ANNOTATIONS",
        }
    }

    /// Still moving forward through the pipeline.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Ready
                | DocumentStatus::TextExtracted
                | DocumentStatus::TextbookIdentified
                | DocumentStatus::AnnotationsGenerating
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DocumentStatus::FailedTextExtraction
                | DocumentStatus::FailedToIdentifyIsbn
                | DocumentStatus::FailedAnnotations
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(DocumentStatus::Ready),
            "TEXT_EXTRACTED" => Ok(DocumentStatus::TextExtracted),
            "TEXTBOOK_IDENTIFIED" => Ok(DocumentStatus::TextbookIdentified),
            "ANNOTATIONS_GENERATING" => Ok(DocumentStatus::AnnotationsGenerating),
            "ANNOTATIONS_READY" => Ok(DocumentStatus::AnnotationsReady),
            "FAILED_TEXT_EXTRACTION" => Ok(DocumentStatus::FailedTextExtraction),
            "FAILED_TO_IDENTIFY_ISBN" => Ok(DocumentStatus::FailedToIdentifyIsbn),
            "FAILED_ANNOTATIONS" => Ok(DocumentStatus::FailedAnnotations),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One piece of persisted content, unique per content hash.
///
/// `file_path` first points at the uploaded PDF and is rewritten to the
/// extracted text file once text extraction commits.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    pub content_hash: String,
    pub file_path: String,
    pub original_file_name: Option<String>,
    pub status: DocumentStatus,
    pub textbook_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new_ready(content_hash: &str, file_path: String, original_file_name: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_hash: content_hash.to_string(),
            file_path,
            original_file_name,
            status: DocumentStatus::Ready,
            textbook_id: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

/// One row of the caller's upload listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpload {
    pub textbook_name: String,
    pub document_status: DocumentStatus,
    pub document_id: Uuid,
}

/// Pipeline progress of a single document as seen by its owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentProgress {
    pub document_id: Uuid,
    pub status: DocumentStatus,
    pub failed: bool,
    pub last_error: Option<String>,
}

//=========================================================================================
// Textbooks & Annotations
//=========================================================================================

/// A distinct book edition, keyed by ISBN-13 (or a placeholder sentinel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Textbook {
    pub id: Uuid,
    pub isbn: String,
    pub name: Option<String>,
    pub authors: Vec<String>,
    pub edition: Option<String>,
}

impl Textbook {
    pub fn with_isbn(isbn: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            isbn: isbn.to_string(),
            name: None,
            authors: Vec::new(),
            edition: None,
        }
    }

    /// The textbook for a document whose ISBN could not be identified. The
    /// ISBN is derived from the document, so every attempt for the same
    /// document lands on the same row.
    pub fn placeholder_for(document_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            isbn: format!("{}{}", PLACEHOLDER_ISBN_PREFIX, document_id),
            name: Some(UNKNOWN_TEXTBOOK_NAME.to_string()),
            authors: Vec::new(),
            edition: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.isbn.starts_with(PLACEHOLDER_ISBN_PREFIX)
    }

    /// True when any of name, edition or authors is still blank.
    pub fn needs_enrichment(&self) -> bool {
        is_blank(&self.name) || is_blank(&self.edition) || self.authors.is_empty()
    }

    /// Fills blank fields from `metadata`; populated fields are never overwritten.
    /// Returns whether anything changed.
    pub fn merge_missing(&mut self, metadata: &BookMetadata) -> bool {
        let mut changed = false;
        if is_blank(&self.name) && !is_blank(&metadata.title) {
            self.name = metadata.title.clone();
            changed = true;
        }
        if is_blank(&self.edition) && !is_blank(&metadata.edition) {
            self.edition = metadata.edition.clone();
            changed = true;
        }
        if self.authors.is_empty() && !metadata.authors.is_empty() {
            self.authors = metadata.authors.clone();
            changed = true;
        }
        changed
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// One versioned extraction run for a textbook.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub id: Uuid,
    pub textbook_id: Uuid,
    pub version: i32,
    pub notes: Vec<AnnotationNote>,
    /// Chunks whose extraction failed and were skipped.
    pub failed_chunks: u32,
    pub created_at: DateTime<Utc>,
}

impl Annotation {
    pub fn is_incomplete(&self) -> bool {
        self.failed_chunks > 0
    }
}

/// One extracted finding, ordered by `position` within its annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationNote {
    pub id: Uuid,
    pub annotation_id: Uuid,
    pub position: i32,
    pub note: String,
    pub reason: String,
    pub quote: String,
    pub location: String,
}

//=========================================================================================
// Collaborator payloads
//=========================================================================================

/// Document information dictionary values read from the PDF.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfMetadata {
    pub author: Option<String>,
    pub title: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
}

/// Book metadata returned by an external ISBN lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookMetadata {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub edition: Option<String>,
    pub publisher: Option<String>,
    pub published_date: Option<String>,
}

//=========================================================================================
// Pipeline events
//=========================================================================================

/// Stage-completion events, persisted in the outbox alongside the state change
/// that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    DocumentQueued {
        document_id: Uuid,
    },
    DocumentReadyForIdentification {
        document_id: Uuid,
        metadata: PdfMetadata,
    },
    TextbookIdentified {
        textbook_id: Uuid,
        document_id: Uuid,
    },
}

impl PipelineEvent {
    pub fn document_id(&self) -> Uuid {
        match self {
            PipelineEvent::DocumentQueued { document_id }
            | PipelineEvent::DocumentReadyForIdentification { document_id, .. }
            | PipelineEvent::TextbookIdentified { document_id, .. } => *document_id,
        }
    }
}

/// A claimed, not yet processed outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event: PipelineEvent,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transitions_follow_the_state_machine() {
        use UploadStatus::*;
        assert!(Pending.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Uploaded));
        assert!(Uploading.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Uploaded));
        assert!(!Uploaded.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn statuses_parse_their_own_names() {
        for status in [
            DocumentStatus::Ready,
            DocumentStatus::TextExtracted,
            DocumentStatus::AnnotationsReady,
            DocumentStatus::FailedAnnotations,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<UploadStatus>().is_err());
    }

    #[test]
    fn merge_only_fills_blank_fields() {
        let mut book = Textbook::with_isbn("9783161484100");
        book.name = Some("Kept".into());
        let changed = book.merge_missing(&BookMetadata {
            title: Some("Replaced".into()),
            authors: vec!["A. Author".into()],
            ..Default::default()
        });
        assert!(changed);
        assert_eq!(book.name.as_deref(), Some("Kept"));
        assert_eq!(book.authors, vec!["A. Author".to_string()]);
        assert!(book.needs_enrichment());
    }

    #[test]
    fn placeholder_isbns_are_per_document() {
        let document_id = Uuid::new_v4();
        let a = Textbook::placeholder_for(document_id);
        let again = Textbook::placeholder_for(document_id);
        let other = Textbook::placeholder_for(Uuid::new_v4());
        assert!(a.is_placeholder());
        assert_eq!(a.isbn, again.isbn);
        assert_ne!(a.isbn, other.isbn);
        assert_eq!(a.name.as_deref(), Some(UNKNOWN_TEXTBOOK_NAME));
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::to_string(&PipelineEvent::DocumentQueued { document_id: id }).unwrap();
        assert!(json.contains("\"type\":\"document_queued\""));
    }
}
