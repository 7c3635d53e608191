//! services/api/src/adapters/memory.rs
//!
//! An in-process implementation of the `DatabaseService` port.
//!
//! All tables live behind one mutex, so every method is a transaction by
//! construction. Used for local development without PostgreSQL and by the
//! integration tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use textlift_core::domain::{
    Annotation, Document, OutboxEntry, PipelineEvent, Textbook, UploadSession, UploadStatus, User,
};
use textlift_core::ports::{DatabaseService, PortError, PortResult};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct OutboxRow {
    id: Uuid,
    event: PipelineEvent,
    attempts: u32,
    locked_until: Option<Instant>,
    processed: bool,
    error: Option<String>,
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    auth_sessions: HashMap<String, Uuid>,
    uploads: Vec<UploadSession>,
    documents: HashMap<Uuid, Document>,
    textbooks: HashMap<Uuid, Textbook>,
    /// Keyed by textbook id; one annotation per textbook.
    annotations: HashMap<Uuid, Annotation>,
    outbox: Vec<OutboxRow>,
}

impl Tables {
    fn enqueue(&mut self, event: &PipelineEvent) {
        self.outbox.push(OutboxRow {
            id: Uuid::new_v4(),
            event: event.clone(),
            attempts: 0,
            locked_until: None,
            processed: false,
            error: None,
        });
    }

    fn upload_mut(&mut self, upload_id: Uuid) -> Option<&mut UploadSession> {
        self.uploads.iter_mut().find(|u| u.id == upload_id)
    }
}

#[derive(Default)]
pub struct InMemoryDatabase {
    tables: Mutex<Tables>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user, as the credential service would.
    pub async fn insert_user(&self, user: User) {
        self.tables.lock().await.users.insert(user.user_id, user);
    }

    /// Registers an auth session cookie value for `user_id`.
    pub async fn insert_auth_session(&self, session_id: &str, user_id: Uuid) {
        self.tables
            .lock()
            .await
            .auth_sessions
            .insert(session_id.to_string(), user_id);
    }

    /// Events not yet completed or dead-lettered.
    pub async fn pending_event_count(&self) -> usize {
        self.tables.lock().await.outbox.iter().filter(|row| !row.processed).count()
    }

    /// Errors recorded on dead-lettered events, in commit order.
    pub async fn dead_letters(&self) -> Vec<String> {
        self.tables
            .lock()
            .await
            .outbox
            .iter()
            .filter_map(|row| row.error.clone())
            .collect()
    }

    /// All events ever enqueued, in commit order.
    pub async fn enqueued_events(&self) -> Vec<PipelineEvent> {
        self.tables.lock().await.outbox.iter().map(|row| row.event.clone()).collect()
    }
}

#[async_trait]
impl DatabaseService for InMemoryDatabase {
    // --- Identity ---
    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        self.tables
            .lock()
            .await
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        self.tables
            .lock()
            .await
            .auth_sessions
            .get(session_id)
            .copied()
            .ok_or(PortError::Unauthorized)
    }

    // --- Upload Sessions ---
    async fn create_upload_session(&self, session: &UploadSession) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.uploads.iter().any(|u| u.id == session.id) {
            return Err(PortError::Conflict(format!("Upload session {} exists", session.id)));
        }
        tables.uploads.push(session.clone());
        Ok(())
    }

    async fn find_in_flight_upload_by_hash(&self, content_hash: &str) -> PortResult<Option<UploadSession>> {
        Ok(self
            .tables
            .lock()
            .await
            .uploads
            .iter()
            .find(|u| u.content_hash == content_hash && u.status.is_in_flight())
            .cloned())
    }

    async fn find_upload_session_for_owner(
        &self,
        upload_id: Uuid,
        owner_id: Uuid,
    ) -> PortResult<Option<UploadSession>> {
        Ok(self
            .tables
            .lock()
            .await
            .uploads
            .iter()
            .find(|u| u.id == upload_id && u.owner_id == owner_id)
            .cloned())
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
        let mut tables = self.tables.lock().await;
        match tables.upload_mut(upload_id) {
            Some(upload) if upload.status == from => {
                upload.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_upload(&self, upload_id: Uuid, original_file_name: Option<&str>) -> PortResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.upload_mut(upload_id) {
            Some(upload) if upload.status == UploadStatus::Uploading => {
                upload.status = UploadStatus::Uploaded;
                upload.original_file_name = original_file_name.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn owner_has_upload_for_hash(&self, owner_id: Uuid, content_hash: &str) -> PortResult<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .uploads
            .iter()
            .any(|u| u.owner_id == owner_id && u.content_hash == content_hash))
    }

    async fn list_upload_hashes_for_owner(&self, owner_id: Uuid) -> PortResult<Vec<String>> {
        let tables = self.tables.lock().await;
        let mut hashes: Vec<String> = Vec::new();
        for upload in tables.uploads.iter().filter(|u| u.owner_id == owner_id) {
            if !hashes.contains(&upload.content_hash) {
                hashes.push(upload.content_hash.clone());
            }
        }
        Ok(hashes)
    }

    async fn delete_uploads_for_owner_and_hash(&self, owner_id: Uuid, content_hash: &str) -> PortResult<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.uploads.len();
        tables
            .uploads
            .retain(|u| !(u.owner_id == owner_id && u.content_hash == content_hash));
        Ok((before - tables.uploads.len()) as u64)
    }

    // --- Documents ---
    async fn get_document(&self, document_id: Uuid) -> PortResult<Document> {
        self.tables
            .lock()
            .await
            .documents
            .get(&document_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Document {} not found", document_id)))
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> PortResult<Option<Document>> {
        Ok(self
            .tables
            .lock()
            .await
            .documents
            .values()
            .find(|d| d.content_hash == content_hash)
            .cloned())
    }

    async fn list_documents_by_hashes(&self, content_hashes: &[String]) -> PortResult<Vec<Document>> {
        let tables = self.tables.lock().await;
        let mut documents: Vec<Document> = tables
            .documents
            .values()
            .filter(|d| content_hashes.contains(&d.content_hash))
            .cloned()
            .collect();
        documents.sort_by_key(|d| d.created_at);
        Ok(documents)
    }

    async fn create_document_if_absent(
        &self,
        document: &Document,
        event: &PipelineEvent,
    ) -> PortResult<(Document, bool)> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .documents
            .values()
            .find(|d| d.content_hash == document.content_hash)
        {
            return Ok((existing.clone(), false));
        }
        tables.documents.insert(document.id, document.clone());
        tables.enqueue(event);
        Ok((document.clone(), true))
    }

    async fn update_document(&self, document: &Document, event: Option<&PipelineEvent>) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .documents
            .get_mut(&document.id)
            .ok_or_else(|| PortError::NotFound(format!("Document {} not found", document.id)))?;
        stored.file_path = document.file_path.clone();
        stored.status = document.status;
        stored.textbook_id = document.textbook_id;
        stored.last_error = document.last_error.clone();
        if let Some(event) = event {
            tables.enqueue(event);
        }
        Ok(())
    }

    // --- Textbooks ---
    async fn get_textbook(&self, textbook_id: Uuid) -> PortResult<Textbook> {
        self.tables
            .lock()
            .await
            .textbooks
            .get(&textbook_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Textbook {} not found", textbook_id)))
    }

    async fn find_textbook_by_isbn(&self, isbn: &str) -> PortResult<Option<Textbook>> {
        Ok(self
            .tables
            .lock()
            .await
            .textbooks
            .values()
            .find(|t| t.isbn == isbn)
            .cloned())
    }

    async fn create_textbook_if_absent(&self, textbook: &Textbook) -> PortResult<Textbook> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.textbooks.values().find(|t| t.isbn == textbook.isbn) {
            return Ok(existing.clone());
        }
        tables.textbooks.insert(textbook.id, textbook.clone());
        Ok(textbook.clone())
    }

    async fn update_textbook(&self, textbook: &Textbook) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .textbooks
            .get_mut(&textbook.id)
            .ok_or_else(|| PortError::NotFound(format!("Textbook {} not found", textbook.id)))?;
        stored.name = textbook.name.clone();
        stored.authors = textbook.authors.clone();
        stored.edition = textbook.edition.clone();
        Ok(())
    }

    // --- Annotations ---
    async fn find_annotation_for_textbook(&self, textbook_id: Uuid) -> PortResult<Option<Annotation>> {
        Ok(self.tables.lock().await.annotations.get(&textbook_id).cloned())
    }

    async fn save_annotation(&self, annotation: &Annotation, document: &Document) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        if !tables.textbooks.contains_key(&annotation.textbook_id) {
            return Err(PortError::NotFound(format!("Textbook {} not found", annotation.textbook_id)));
        }
        let stored = tables
            .documents
            .get_mut(&document.id)
            .ok_or_else(|| PortError::NotFound(format!("Document {} not found", document.id)))?;
        stored.status = document.status;
        stored.textbook_id = document.textbook_id;
        stored.last_error = document.last_error.clone();

        let mut annotation = annotation.clone();
        annotation.notes.sort_by_key(|n| n.position);
        tables.annotations.insert(annotation.textbook_id, annotation);
        Ok(())
    }

    // --- Pipeline Outbox ---
    async fn claim_outbox_events(&self, limit: usize, lease: Duration) -> PortResult<Vec<OutboxEntry>> {
        let mut tables = self.tables.lock().await;
        let now = Instant::now();
        let mut claimed = Vec::new();
        for row in tables.outbox.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let leased = row.locked_until.is_some_and(|until| until > now);
            if row.processed || leased {
                continue;
            }
            row.locked_until = Some(now + lease);
            row.attempts += 1;
            claimed.push(OutboxEntry {
                id: row.id,
                event: row.event.clone(),
                attempts: row.attempts,
            });
        }
        Ok(claimed)
    }

    async fn extend_outbox_lease(&self, event_id: Uuid, lease: Duration) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables.outbox.iter_mut().find(|row| row.id == event_id && !row.processed) {
            row.locked_until = Some(Instant::now() + lease);
        }
        Ok(())
    }

    async fn complete_outbox_event(&self, event_id: Uuid) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables.outbox.iter_mut().find(|row| row.id == event_id) {
            row.processed = true;
            row.locked_until = None;
        }
        Ok(())
    }

    async fn dead_letter_outbox_event(&self, event_id: Uuid, error: &str) -> PortResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables.outbox.iter_mut().find(|row| row.id == event_id) {
            row.processed = true;
            row.locked_until = None;
            row.error = Some(error.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_hash_returns_the_first_document_without_an_event() {
        let db = InMemoryDatabase::new();
        let first = Document::new_ready("h1", "/tmp/a.pdf".into(), None);
        let second = Document::new_ready("h1", "/tmp/b.pdf".into(), None);

        let (stored, created) = db
            .create_document_if_absent(&first, &PipelineEvent::DocumentQueued { document_id: first.id })
            .await
            .unwrap();
        assert!(created);
        assert_eq!(stored.id, first.id);

        let (stored, created) = db
            .create_document_if_absent(&second, &PipelineEvent::DocumentQueued { document_id: second.id })
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(stored.id, first.id);
        assert_eq!(db.pending_event_count().await, 1);
    }

    #[tokio::test]
    async fn leased_events_are_not_claimed_twice_until_the_lease_expires() {
        let db = InMemoryDatabase::new();
        let doc = Document::new_ready("h", "/tmp/x.pdf".into(), None);
        db.create_document_if_absent(&doc, &PipelineEvent::DocumentQueued { document_id: doc.id })
            .await
            .unwrap();

        let first = db.claim_outbox_events(10, Duration::from_millis(20)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(db.claim_outbox_events(10, Duration::from_millis(20)).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = db.claim_outbox_events(10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);

        db.complete_outbox_event(again[0].id).await.unwrap();
        assert_eq!(db.pending_event_count().await, 0);
    }

    #[tokio::test]
    async fn extended_leases_keep_events_from_being_reclaimed() {
        let db = InMemoryDatabase::new();
        let doc = Document::new_ready("h", "/tmp/x.pdf".into(), None);
        db.create_document_if_absent(&doc, &PipelineEvent::DocumentQueued { document_id: doc.id })
            .await
            .unwrap();

        let claimed = db.claim_outbox_events(10, Duration::from_millis(20)).await.unwrap();
        db.extend_outbox_lease(claimed[0].id, Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(db.claim_outbox_events(10, Duration::from_millis(20)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_transitions_are_compare_and_set() {
        let db = InMemoryDatabase::new();
        let session = UploadSession::new(Uuid::new_v4(), "h", UploadStatus::Pending);
        db.create_upload_session(&session).await.unwrap();

        assert!(db
            .transition_upload_status(session.id, UploadStatus::Pending, UploadStatus::Uploading)
            .await
            .unwrap());
        assert!(!db
            .transition_upload_status(session.id, UploadStatus::Pending, UploadStatus::Uploading)
            .await
            .unwrap());
        assert!(db
            .transition_upload_status(session.id, UploadStatus::Uploaded, UploadStatus::Pending)
            .await
            .is_err());
        assert!(db.complete_upload(session.id, Some("book.pdf")).await.unwrap());
    }
}
