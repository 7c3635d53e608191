//! crates/textlift_core/src/upload.rs
//!
//! The upload-session state machine and hash-based deduplication.
//!
//! Every operation takes the caller's identity explicitly; a session is only
//! visible to the user who created it.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    CreateUploadOutcome, Document, DocumentStatus, PipelineEvent, UploadMode, UploadSession, UploadStatus,
};
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::PipelineWaker;
use crate::ports::DatabaseService;
use crate::storage::{remove_file_best_effort, StorageLayout};

/// Leading bytes every accepted upload must start with.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    /// Ceiling on the size a client may announce when creating an upload.
    pub max_declared_bytes: u64,
    /// Ceiling on the bytes actually accepted for one file.
    pub max_file_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_declared_bytes: 250_000_000,
            max_file_bytes: 25 * 1024 * 1024,
        }
    }
}

pub struct UploadService {
    db: Arc<dyn DatabaseService>,
    storage: StorageLayout,
    limits: UploadLimits,
    waker: PipelineWaker,
}

impl UploadService {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        storage: StorageLayout,
        limits: UploadLimits,
        waker: PipelineWaker,
    ) -> Self {
        Self {
            db,
            storage,
            limits,
            waker,
        }
    }

    /// Decides whether the caller uploads new bytes, reuses a processed
    /// document, or waits on content that is already in flight.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn create_upload(
        &self,
        owner_id: Uuid,
        content_hash: &str,
        size_bytes: u64,
    ) -> ServiceResult<CreateUploadOutcome> {
        if size_bytes > self.limits.max_declared_bytes {
            return Err(ServiceError::PayloadTooLarge {
                message: "File is too large".to_string(),
                limit: self.limits.max_declared_bytes,
            });
        }
        let content_hash = content_hash.trim();
        if content_hash.is_empty() {
            return Err(ServiceError::BadRequest("contentHash must not be empty".to_string()));
        }

        self.db.get_user(owner_id).await?;

        // 1. Someone is already sending these bytes.
        if let Some(in_flight) = self.db.find_in_flight_upload_by_hash(content_hash).await? {
            return Ok(CreateUploadOutcome {
                mode: UploadMode::CacheHitWait,
                upload_id: Some(in_flight.id),
                status: Some(in_flight.status),
                document_id: None,
            });
        }

        // 2-4. The content already has a document.
        if let Some(existing) = self.db.find_document_by_hash(content_hash).await? {
            return match existing.status {
                DocumentStatus::AnnotationsReady => {
                    self.record_cache_hit_owner(owner_id, content_hash).await?;
                    Ok(CreateUploadOutcome {
                        mode: UploadMode::CacheHit,
                        upload_id: None,
                        status: None,
                        document_id: Some(existing.id),
                    })
                }
                status if status.is_in_progress() => Ok(CreateUploadOutcome {
                    mode: UploadMode::CacheHitWait,
                    upload_id: None,
                    status: None,
                    document_id: None,
                }),
                status => Err(ServiceError::Conflict(format!(
                    "Document exists but is in state: {}",
                    status
                ))),
            };
        }

        // 5. Unknown content.
        let session = UploadSession::new(owner_id, content_hash, UploadStatus::Pending);
        self.db.create_upload_session(&session).await?;
        info!(upload_id = %session.id, "Created upload session");

        Ok(CreateUploadOutcome {
            mode: UploadMode::NewUpload,
            upload_id: Some(session.id),
            status: Some(session.status),
            document_id: None,
        })
    }

    /// Receives the file bytes for a PENDING session.
    ///
    /// Bytes go to a `.part` file that is validated and then atomically
    /// renamed, so the final path never holds a partial file. Any failure
    /// after the session starts moving marks it FAILED.
    #[instrument(skip(self, body), fields(upload_id = %upload_id, owner_id = %owner_id))]
    pub async fn accept_bytes<S, E>(
        &self,
        upload_id: Uuid,
        owner_id: Uuid,
        original_file_name: Option<String>,
        declared_size: Option<u64>,
        body: S,
    ) -> ServiceResult<UploadSession>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
        E: Display,
    {
        let mut session = self.owned_session(upload_id, owner_id).await?;
        if session.status != UploadStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "Upload session is {}, bytes can only be sent to a PENDING session",
                session.status
            )));
        }
        if !self
            .db
            .transition_upload_status(upload_id, UploadStatus::Pending, UploadStatus::Uploading)
            .await?
        {
            return Err(ServiceError::Conflict("Upload session is no longer PENDING".to_string()));
        }

        let part_path = self.storage.upload_part_path(upload_id);
        if let Err(err) = self.store_file(upload_id, &part_path, declared_size, body).await {
            remove_file_best_effort(&part_path).await;
            if let Err(mark_err) = self
                .db
                .transition_upload_status(upload_id, UploadStatus::Uploading, UploadStatus::Failed)
                .await
            {
                warn!(error = %mark_err, "Failed to mark upload session FAILED");
            }
            warn!(error = %err, "Upload rejected");
            return Err(err);
        }

        if !self.db.complete_upload(upload_id, original_file_name.as_deref()).await? {
            return Err(ServiceError::Conflict("Upload session left UPLOADING unexpectedly".to_string()));
        }
        info!("Upload stored");

        session.status = UploadStatus::Uploaded;
        session.original_file_name = original_file_name;
        Ok(session)
    }

    /// Turns an UPLOADED session into a document and queues it for processing.
    ///
    /// Finalizing content that already has a document returns that document
    /// without creating a second one or queueing it again.
    #[instrument(skip(self), fields(upload_id = %upload_id, owner_id = %owner_id))]
    pub async fn finalize(&self, upload_id: Uuid, owner_id: Uuid) -> ServiceResult<Document> {
        let session = self.owned_session(upload_id, owner_id).await?;
        if session.status != UploadStatus::Uploaded {
            return Err(ServiceError::Conflict(format!(
                "Upload session is {}, expected UPLOADED",
                session.status
            )));
        }

        let pdf_path = self.storage.upload_pdf_path(upload_id);
        if let Some(existing) = self.db.find_document_by_hash(&session.content_hash).await? {
            self.discard_duplicate(&existing, &pdf_path).await;
            return Ok(existing);
        }

        let document = Document::new_ready(
            &session.content_hash,
            pdf_path.to_string_lossy().into_owned(),
            session.original_file_name.clone(),
        );
        let event = PipelineEvent::DocumentQueued {
            document_id: document.id,
        };
        let (document, created) = self.db.create_document_if_absent(&document, &event).await?;

        if created {
            info!(document_id = %document.id, "Document queued for processing");
            self.waker.wake();
        } else {
            self.discard_duplicate(&document, &pdf_path).await;
        }
        Ok(document)
    }

    pub async fn poll_status(&self, upload_id: Uuid, owner_id: Uuid) -> ServiceResult<UploadStatus> {
        Ok(self.owned_session(upload_id, owner_id).await?.status)
    }

    async fn owned_session(&self, upload_id: Uuid, owner_id: Uuid) -> ServiceResult<UploadSession> {
        self.db
            .find_upload_session_for_owner(upload_id, owner_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Upload session not found".to_string()))
    }

    /// A cache hit still makes the caller an owner of the content, so listing
    /// and annotation access work for them.
    async fn record_cache_hit_owner(&self, owner_id: Uuid, content_hash: &str) -> ServiceResult<()> {
        if self.db.owner_has_upload_for_hash(owner_id, content_hash).await? {
            return Ok(());
        }
        let session = UploadSession::new(owner_id, content_hash, UploadStatus::Uploaded);
        self.db.create_upload_session(&session).await?;
        Ok(())
    }

    async fn discard_duplicate(&self, existing: &Document, own_pdf: &Path) {
        if Path::new(&existing.file_path) != own_pdf {
            info!(document_id = %existing.id, "Content already has a document, discarding duplicate upload");
            remove_file_best_effort(own_pdf).await;
        }
    }

    async fn store_file<S, E>(
        &self,
        upload_id: Uuid,
        part_path: &Path,
        declared_size: Option<u64>,
        mut body: S,
    ) -> ServiceResult<()>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
        E: Display,
    {
        let limit = self.limits.max_file_bytes;
        let too_large = || ServiceError::PayloadTooLarge {
            message: "File is too large".to_string(),
            limit,
        };
        if declared_size.is_some_and(|size| size > limit) {
            return Err(too_large());
        }

        self.storage.ensure_root().await?;
        let mut file = tokio::fs::File::create(part_path).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ServiceError::BadRequest(format!("Failed to read upload body: {}", e)))?;
            written += chunk.len() as u64;
            if written > limit {
                return Err(too_large());
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if written == 0 {
            return Err(ServiceError::BadRequest("File is empty".to_string()));
        }
        validate_signature(part_path).await?;

        tokio::fs::rename(part_path, self.storage.upload_pdf_path(upload_id)).await?;
        Ok(())
    }
}

/// Checks the file starts with the PDF magic bytes.
async fn validate_signature(path: &Path) -> ServiceResult<()> {
    let mut head = [0u8; PDF_MAGIC.len()];
    let mut file = tokio::fs::File::open(path).await?;
    let mut read = 0;
    while read < head.len() {
        let n = file.read(&mut head[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }
    if read == head.len() && head == PDF_MAGIC {
        Ok(())
    } else {
        Err(ServiceError::UnsupportedMediaType("Not a PDF".to_string()))
    }
}
