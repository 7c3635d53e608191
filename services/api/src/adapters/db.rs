//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! Every state change that emits a pipeline event writes the event into
//! `pipeline_outbox` inside the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;
use textlift_core::domain::{
    Annotation, AnnotationNote, Document, OutboxEntry, PipelineEvent, Textbook, UploadSession, UploadStatus, User,
};
use textlift_core::ports::{DatabaseService, PortError, PortResult};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Creates a new `PgDatabase`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> PortResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(unexpected)
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

/// Maps unique-constraint violations to `Conflict`, everything else to `Unexpected`.
fn write_error(e: sqlx::Error) -> PortError {
    let unique_violation = e
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505");
    if unique_violation {
        PortError::Conflict(e.to_string())
    } else {
        unexpected(e)
    }
}

fn not_found(what: &'static str, id: Uuid) -> impl FnOnce(sqlx::Error) -> PortError {
    move |e| match e {
        sqlx::Error::RowNotFound => PortError::NotFound(format!("{} {} not found", what, id)),
        _ => unexpected(e),
    }
}

fn corrupt<E: std::fmt::Display>(e: E) -> PortError {
    PortError::Unexpected(format!("Corrupt row: {}", e))
}

async fn enqueue(tx: &mut Transaction<'static, Postgres>, event: &PipelineEvent) -> PortResult<()> {
    sqlx::query("INSERT INTO pipeline_outbox (id, event) VALUES ($1, $2)")
        .bind(Uuid::new_v4())
        .bind(Json(event))
        .execute(&mut **tx)
        .await
        .map_err(unexpected)?;
    Ok(())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    email: Option<String>,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            user_id: self.user_id,
            email: self.email,
        }
    }
}

const UPLOAD_COLUMNS: &str = "id, owner_id, content_hash, status, original_file_name, created_at";

#[derive(FromRow)]
struct UploadSessionRecord {
    id: Uuid,
    owner_id: Uuid,
    content_hash: String,
    status: String,
    original_file_name: Option<String>,
    created_at: DateTime<Utc>,
}
impl UploadSessionRecord {
    fn to_domain(self) -> PortResult<UploadSession> {
        Ok(UploadSession {
            id: self.id,
            owner_id: self.owner_id,
            content_hash: self.content_hash,
            status: self.status.parse().map_err(corrupt)?,
            original_file_name: self.original_file_name,
            created_at: self.created_at,
        })
    }
}

const DOCUMENT_COLUMNS: &str =
    "id, content_hash, file_path, original_file_name, status, textbook_id, last_error, created_at";

#[derive(FromRow)]
struct DocumentRecord {
    id: Uuid,
    content_hash: String,
    file_path: String,
    original_file_name: Option<String>,
    status: String,
    textbook_id: Option<Uuid>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}
impl DocumentRecord {
    fn to_domain(self) -> PortResult<Document> {
        Ok(Document {
            id: self.id,
            content_hash: self.content_hash,
            file_path: self.file_path,
            original_file_name: self.original_file_name,
            status: self.status.parse().map_err(corrupt)?,
            textbook_id: self.textbook_id,
            last_error: self.last_error,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct TextbookRecord {
    id: Uuid,
    isbn: String,
    name: Option<String>,
    authors: Vec<String>,
    edition: Option<String>,
}
impl TextbookRecord {
    fn to_domain(self) -> Textbook {
        Textbook {
            id: self.id,
            isbn: self.isbn,
            name: self.name,
            authors: self.authors,
            edition: self.edition,
        }
    }
}

#[derive(FromRow)]
struct AnnotationRecord {
    id: Uuid,
    textbook_id: Uuid,
    version: i32,
    failed_chunks: i32,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct AnnotationNoteRecord {
    id: Uuid,
    annotation_id: Uuid,
    position: i32,
    note: String,
    reason: String,
    quote: String,
    location: String,
}
impl AnnotationNoteRecord {
    fn to_domain(self) -> AnnotationNote {
        AnnotationNote {
            id: self.id,
            annotation_id: self.annotation_id,
            position: self.position,
            note: self.note,
            reason: self.reason,
            quote: self.quote,
            location: self.location,
        }
    }
}

#[derive(FromRow)]
struct OutboxRecord {
    id: Uuid,
    seq: i64,
    event: Json<PipelineEvent>,
    attempts: i32,
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for PgDatabase {
    // --- Identity ---
    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>("SELECT user_id, email FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found("User", user_id))?;
        Ok(record.to_domain())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        sqlx::query_scalar::<_, Uuid>("SELECT user_id FROM auth_sessions WHERE id = $1 AND expires_at > now()")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or(PortError::Unauthorized)
    }

    // --- Upload Sessions ---
    async fn create_upload_session(&self, session: &UploadSession) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO upload_sessions (id, owner_id, content_hash, status, original_file_name, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(session.id)
        .bind(session.owner_id)
        .bind(&session.content_hash)
        .bind(session.status.as_str())
        .bind(&session.original_file_name)
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn find_in_flight_upload_by_hash(&self, content_hash: &str) -> PortResult<Option<UploadSession>> {
        let sql = format!(
            "SELECT {} FROM upload_sessions WHERE content_hash = $1 AND status IN ('PENDING', 'UPLOADING') \
             ORDER BY created_at ASC LIMIT 1",
            UPLOAD_COLUMNS
        );
        sqlx::query_as::<_, UploadSessionRecord>(&sql)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(UploadSessionRecord::to_domain)
            .transpose()
    }

    async fn find_upload_session_for_owner(
        &self,
        upload_id: Uuid,
        owner_id: Uuid,
    ) -> PortResult<Option<UploadSession>> {
        let sql = format!("SELECT {} FROM upload_sessions WHERE id = $1 AND owner_id = $2", UPLOAD_COLUMNS);
        sqlx::query_as::<_, UploadSessionRecord>(&sql)
            .bind(upload_id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(UploadSessionRecord::to_domain)
            .transpose()
    }

    async fn transition_upload_status(
        &self,
        upload_id: Uuid,
        from: UploadStatus,
        to: UploadStatus,
    ) -> PortResult<bool> {
        if !from.can_transition_to(to) {
            return Err(PortError::Conflict(format!("Illegal upload transition {} -> {}", from, to)));
        }
        let result = sqlx::query("UPDATE upload_sessions SET status = $3 WHERE id = $1 AND status = $2")
            .bind(upload_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_upload(&self, upload_id: Uuid, original_file_name: Option<&str>) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = 'UPLOADED', original_file_name = $2 \
             WHERE id = $1 AND status = 'UPLOADING'",
        )
        .bind(upload_id)
        .bind(original_file_name)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn owner_has_upload_for_hash(&self, owner_id: Uuid, content_hash: &str) -> PortResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM upload_sessions WHERE owner_id = $1 AND content_hash = $2)",
        )
        .bind(owner_id)
        .bind(content_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn list_upload_hashes_for_owner(&self, owner_id: Uuid) -> PortResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT content_hash FROM upload_sessions WHERE owner_id = $1 \
             GROUP BY content_hash ORDER BY MIN(created_at) ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn delete_uploads_for_owner_and_hash(&self, owner_id: Uuid, content_hash: &str) -> PortResult<u64> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE owner_id = $1 AND content_hash = $2")
            .bind(owner_id)
            .bind(content_hash)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(result.rows_affected())
    }

    // --- Documents ---
    async fn get_document(&self, document_id: Uuid) -> PortResult<Document> {
        let sql = format!("SELECT {} FROM documents WHERE id = $1", DOCUMENT_COLUMNS);
        sqlx::query_as::<_, DocumentRecord>(&sql)
            .bind(document_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found("Document", document_id))?
            .to_domain()
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> PortResult<Option<Document>> {
        let sql = format!("SELECT {} FROM documents WHERE content_hash = $1", DOCUMENT_COLUMNS);
        sqlx::query_as::<_, DocumentRecord>(&sql)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(DocumentRecord::to_domain)
            .transpose()
    }

    async fn list_documents_by_hashes(&self, content_hashes: &[String]) -> PortResult<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE content_hash = ANY($1) ORDER BY created_at ASC",
            DOCUMENT_COLUMNS
        );
        sqlx::query_as::<_, DocumentRecord>(&sql)
            .bind(content_hashes)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?
            .into_iter()
            .map(DocumentRecord::to_domain)
            .collect()
    }

    async fn create_document_if_absent(
        &self,
        document: &Document,
        event: &PipelineEvent,
    ) -> PortResult<(Document, bool)> {
        let mut tx = self.begin().await?;
        let inserted = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO documents (id, content_hash, file_path, original_file_name, status, textbook_id, last_error, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (content_hash) DO NOTHING RETURNING id",
        )
        .bind(document.id)
        .bind(&document.content_hash)
        .bind(&document.file_path)
        .bind(&document.original_file_name)
        .bind(document.status.as_str())
        .bind(document.textbook_id)
        .bind(&document.last_error)
        .bind(document.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(write_error)?;

        if inserted.is_some() {
            enqueue(&mut tx, event).await?;
            tx.commit().await.map_err(unexpected)?;
            return Ok((document.clone(), true));
        }

        let sql = format!("SELECT {} FROM documents WHERE content_hash = $1", DOCUMENT_COLUMNS);
        let existing = sqlx::query_as::<_, DocumentRecord>(&sql)
            .bind(&document.content_hash)
            .fetch_one(&mut *tx)
            .await
            .map_err(unexpected)?
            .to_domain()?;
        tx.commit().await.map_err(unexpected)?;
        Ok((existing, false))
    }

    async fn update_document(&self, document: &Document, event: Option<&PipelineEvent>) -> PortResult<()> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "UPDATE documents SET file_path = $2, status = $3, textbook_id = $4, last_error = $5 WHERE id = $1",
        )
        .bind(document.id)
        .bind(&document.file_path)
        .bind(document.status.as_str())
        .bind(document.textbook_id)
        .bind(&document.last_error)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Document {} not found", document.id)));
        }
        if let Some(event) = event {
            enqueue(&mut tx, event).await?;
        }
        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    // --- Textbooks ---
    async fn get_textbook(&self, textbook_id: Uuid) -> PortResult<Textbook> {
        let record = sqlx::query_as::<_, TextbookRecord>(
            "SELECT id, isbn, name, authors, edition FROM textbooks WHERE id = $1",
        )
        .bind(textbook_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found("Textbook", textbook_id))?;
        Ok(record.to_domain())
    }

    async fn find_textbook_by_isbn(&self, isbn: &str) -> PortResult<Option<Textbook>> {
        let record = sqlx::query_as::<_, TextbookRecord>(
            "SELECT id, isbn, name, authors, edition FROM textbooks WHERE isbn = $1",
        )
        .bind(isbn)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(TextbookRecord::to_domain))
    }

    async fn create_textbook_if_absent(&self, textbook: &Textbook) -> PortResult<Textbook> {
        sqlx::query(
            "INSERT INTO textbooks (id, isbn, name, authors, edition) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (isbn) DO NOTHING",
        )
        .bind(textbook.id)
        .bind(&textbook.isbn)
        .bind(&textbook.name)
        .bind(&textbook.authors)
        .bind(&textbook.edition)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        self.find_textbook_by_isbn(&textbook.isbn)
            .await?
            .ok_or_else(|| PortError::Unexpected(format!("Textbook {} vanished after insert", textbook.isbn)))
    }

    async fn update_textbook(&self, textbook: &Textbook) -> PortResult<()> {
        sqlx::query("UPDATE textbooks SET name = $2, authors = $3, edition = $4 WHERE id = $1")
            .bind(textbook.id)
            .bind(&textbook.name)
            .bind(&textbook.authors)
            .bind(&textbook.edition)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    // --- Annotations ---
    async fn find_annotation_for_textbook(&self, textbook_id: Uuid) -> PortResult<Option<Annotation>> {
        let Some(record) = sqlx::query_as::<_, AnnotationRecord>(
            "SELECT id, textbook_id, version, failed_chunks, created_at FROM annotations WHERE textbook_id = $1",
        )
        .bind(textbook_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        else {
            return Ok(None);
        };

        let notes = sqlx::query_as::<_, AnnotationNoteRecord>(
            "SELECT id, annotation_id, position, note, reason, quote, location \
             FROM annotation_notes WHERE annotation_id = $1 ORDER BY position ASC",
        )
        .bind(record.id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(Some(Annotation {
            id: record.id,
            textbook_id: record.textbook_id,
            version: record.version,
            notes: notes.into_iter().map(AnnotationNoteRecord::to_domain).collect(),
            failed_chunks: record.failed_chunks.max(0) as u32,
            created_at: record.created_at,
        }))
    }

    async fn save_annotation(&self, annotation: &Annotation, document: &Document) -> PortResult<()> {
        let mut tx = self.begin().await?;

        sqlx::query("DELETE FROM annotations WHERE textbook_id = $1")
            .bind(annotation.textbook_id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        sqlx::query(
            "INSERT INTO annotations (id, textbook_id, version, failed_chunks, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(annotation.id)
        .bind(annotation.textbook_id)
        .bind(annotation.version)
        .bind(annotation.failed_chunks as i32)
        .bind(annotation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;

        for note in &annotation.notes {
            sqlx::query(
                "INSERT INTO annotation_notes (id, annotation_id, position, note, reason, quote, location) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(note.id)
            .bind(annotation.id)
            .bind(note.position)
            .bind(&note.note)
            .bind(&note.reason)
            .bind(&note.quote)
            .bind(&note.location)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        }

        sqlx::query("UPDATE documents SET status = $2, textbook_id = $3, last_error = $4 WHERE id = $1")
            .bind(document.id)
            .bind(document.status.as_str())
            .bind(document.textbook_id)
            .bind(&document.last_error)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(())
    }

    // --- Pipeline Outbox ---
    async fn claim_outbox_events(&self, limit: usize, lease: Duration) -> PortResult<Vec<OutboxEntry>> {
        let mut records = sqlx::query_as::<_, OutboxRecord>(
            "UPDATE pipeline_outbox SET locked_until = now() + make_interval(secs => $2), attempts = attempts + 1 \
             WHERE id IN ( \
                 SELECT id FROM pipeline_outbox \
                 WHERE processed_at IS NULL AND (locked_until IS NULL OR locked_until < now()) \
                 ORDER BY seq ASC LIMIT $1 FOR UPDATE SKIP LOCKED) \
             RETURNING id, seq, event, attempts",
        )
        .bind(limit as i64)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        records.sort_by_key(|r| r.seq);
        Ok(records
            .into_iter()
            .map(|r| OutboxEntry {
                id: r.id,
                event: r.event.0,
                attempts: r.attempts.max(0) as u32,
            })
            .collect())
    }

    async fn complete_outbox_event(&self, event_id: Uuid) -> PortResult<()> {
        sqlx::query("UPDATE pipeline_outbox SET processed_at = now(), locked_until = NULL WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn extend_outbox_lease(&self, event_id: Uuid, lease: Duration) -> PortResult<()> {
        sqlx::query(
            "UPDATE pipeline_outbox SET locked_until = now() + make_interval(secs => $2) \
             WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(event_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn dead_letter_outbox_event(&self, event_id: Uuid, error: &str) -> PortResult<()> {
        sqlx::query(
            "UPDATE pipeline_outbox SET processed_at = now(), locked_until = NULL, error = $2 WHERE id = $1",
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }
}
