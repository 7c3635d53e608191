//! End-to-end runs of the upload flow and the document pipeline against the
//! in-memory store, with fake text extraction, book lookup and model.

use api_lib::adapters::InMemoryDatabase;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use textlift_core::domain::{
    BookMetadata, DocumentStatus, PdfMetadata, PipelineEvent, Textbook, UploadMode, UploadStatus, User,
    PLACEHOLDER_ISBN_PREFIX,
};
use textlift_core::ports::{
    BookLookupService, DatabaseService, PortError, PortResult, StructuredCompletionService, TextExtractionService,
};
use textlift_core::{
    AnnotationExtractor, DocumentService, IsbnResolver, Pipeline, PipelineConfig, PipelineWaker, ServiceError,
    StorageLayout, UploadLimits, UploadService,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BOOK_TEXT: &str = "Introduction to Systems\nSecond Edition\nISBN 978-3-16-148410-0\n\nChapter 1\nThe earth is flat.\n";
const NOTES_REPLY: &str = r#"[
  {"note": "Claim is wrong", "reason": "The earth is round", "quote": "The earth is flat.", "location": "Chapter 1"},
  {"note": "Dated edition", "reason": "Superseded", "quote": "Second Edition", "location": "Title page"}
]"#;

//=========================================================================================
// Fakes
//=========================================================================================

/// Writes fixed text for any PDF that exists on disk.
struct FakeExtractor {
    text: &'static str,
    fail: bool,
}

#[async_trait]
impl TextExtractionService for FakeExtractor {
    async fn extract(&self, pdf_path: &Path, text_path: &Path) -> PortResult<PdfMetadata> {
        if self.fail {
            return Err(PortError::Unexpected("PDF parser crashed".to_string()));
        }
        tokio::fs::metadata(pdf_path)
            .await
            .map_err(|_| PortError::NotFound(format!("PDF missing at {}", pdf_path.display())))?;
        tokio::fs::write(text_path, self.text)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(PdfMetadata {
            author: Some("A. Writer; B. Editor".to_string()),
            title: Some("Title From PDF".to_string()),
            ..Default::default()
        })
    }
}

struct FakeLookup;

#[async_trait]
impl BookLookupService for FakeLookup {
    async fn lookup_by_isbn(&self, isbn: &str) -> PortResult<Option<BookMetadata>> {
        Ok((isbn == "9783161484100").then(|| BookMetadata {
            title: Some("Introduction to Systems".to_string()),
            authors: vec!["A. Writer".to_string()],
            edition: Some("Second Edition".to_string()),
            ..Default::default()
        }))
    }
}

struct FakeCompletion {
    reply: &'static str,
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl StructuredCompletionService for FakeCompletion {
    async fn complete_structured(&self, _prompt: &str) -> PortResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.reply.to_string())
    }
}

//=========================================================================================
// Harness
//=========================================================================================

struct Harness {
    db: Arc<InMemoryDatabase>,
    uploads: UploadService,
    documents: DocumentService,
    pipeline: Pipeline,
    completion: Arc<FakeCompletion>,
    storage: TempDir,
}

fn harness(text: &'static str, reply: &'static str, extraction_fails: bool) -> Harness {
    harness_with(text, reply, extraction_fails, PipelineConfig::default().lease, Duration::ZERO)
}

/// A harness whose model takes `reply_delay` to answer and whose claims
/// expire after `lease`.
fn harness_with(
    text: &'static str,
    reply: &'static str,
    extraction_fails: bool,
    lease: Duration,
    reply_delay: Duration,
) -> Harness {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = StorageLayout::new(storage_dir.path());
    let db = Arc::new(InMemoryDatabase::new());
    let completion = Arc::new(FakeCompletion {
        reply,
        delay: reply_delay,
        calls: AtomicUsize::new(0),
    });
    let waker = PipelineWaker::new();

    let resolver = Arc::new(IsbnResolver::new(db.clone(), Arc::new(FakeLookup), waker.clone()));
    let annotator = Arc::new(AnnotationExtractor::new(db.clone(), completion.clone()));
    let pipeline = Pipeline::new(
        db.clone(),
        Arc::new(FakeExtractor {
            text,
            fail: extraction_fails,
        }),
        resolver,
        annotator,
        storage.clone(),
        PipelineConfig {
            workers: 2,
            max_attempts: 2,
            retry_base: Duration::from_millis(1),
            lease,
            ..PipelineConfig::default()
        },
        waker.clone(),
    );
    let uploads = UploadService::new(db.clone(), storage, UploadLimits::default(), waker);
    let documents = DocumentService::new(db.clone());

    Harness {
        db,
        uploads,
        documents,
        pipeline,
        completion,
        storage: storage_dir,
    }
}

impl Harness {
    async fn user(&self) -> Uuid {
        let user_id = Uuid::new_v4();
        self.db
            .insert_user(User {
                user_id,
                email: Some(format!("{}@example.com", user_id)),
            })
            .await;
        user_id
    }

    /// Creates a session and sends `body` into it; returns the upload id.
    async fn upload(&self, owner: Uuid, hash: &str, body: &'static [u8]) -> Uuid {
        let outcome = self.uploads.create_upload(owner, hash, body.len() as u64).await.unwrap();
        assert_eq!(outcome.mode, UploadMode::NewUpload);
        let upload_id = outcome.upload_id.unwrap();
        let session = self
            .uploads
            .accept_bytes(upload_id, owner, Some("book.pdf".to_string()), None, pdf_body(body))
            .await
            .unwrap();
        assert_eq!(session.status, UploadStatus::Uploaded);
        upload_id
    }

    fn files_with_extension(&self, extension: &str) -> usize {
        std::fs::read_dir(self.storage.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == extension))
            .count()
    }
}

fn pdf_body(bytes: &'static [u8]) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin {
    let (head, tail) = bytes.split_at(bytes.len().min(4));
    stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(head)),
        Ok(Bytes::from_static(tail)),
    ])
}

const PDF_BYTES: &[u8] = b"%PDF-1.5\nfake body standing in for a real document\n%%EOF\n";
const OTHER_PDF_BYTES: &[u8] = b"%PDF-1.7\nanother scan of the same edition\n%%EOF\n";

//=========================================================================================
// Scenarios
//=========================================================================================

#[tokio::test]
async fn uploaded_pdf_flows_through_to_annotations() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;

    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, owner).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Ready);

    h.pipeline.run_until_idle().await.unwrap();

    let document = h.db.get_document(document.id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::AnnotationsReady);
    assert!(document.last_error.is_none());

    let textbook = h.db.get_textbook(document.textbook_id.unwrap()).await.unwrap();
    assert_eq!(textbook.isbn, "9783161484100");
    assert_eq!(textbook.name.as_deref(), Some("Introduction to Systems"));
    assert_eq!(textbook.edition.as_deref(), Some("Second Edition"));

    let notes = h.documents.notes_for_document(owner, document.id).await.unwrap();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0].quote, "The earth is flat.");
    assert_eq!(notes[1].location, "Title page");

    let annotation = h.db.find_annotation_for_textbook(textbook.id).await.unwrap().unwrap();
    assert_eq!(annotation.version, 1);
    assert_eq!(annotation.failed_chunks, 0);

    let listed = h.documents.list_user_uploads(owner).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].textbook_name, "Introduction to Systems");
    assert_eq!(listed[0].document_status, DocumentStatus::AnnotationsReady);

    // Intermediate files are consumed by the next stage.
    assert_eq!(h.files_with_extension("pdf"), 0);
    assert_eq!(h.files_with_extension("txt"), 0);
    assert_eq!(h.db.pending_event_count().await, 0);
    assert!(h.db.dead_letters().await.is_empty());
}

#[tokio::test]
async fn dispatcher_loop_processes_events_until_cancelled() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;
    let shutdown = CancellationToken::new();
    let dispatcher = tokio::spawn(h.pipeline.clone().run(shutdown.clone()));

    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, owner).await.unwrap();

    let ready = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = h.db.get_document(document.id).await.unwrap().status;
            if status == DocumentStatus::AnnotationsReady {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("document reaches ANNOTATIONS_READY");
    assert_eq!(ready, DocumentStatus::AnnotationsReady);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), dispatcher)
        .await
        .expect("dispatcher stops after cancellation")
        .unwrap();
}

#[tokio::test]
async fn concurrent_finalize_of_the_same_content_creates_one_document() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let alice = h.user().await;
    let bob = h.user().await;

    let alice_upload = h.upload(alice, "same-hash", PDF_BYTES).await;
    // Alice's bytes are in, but nothing is finalized yet, so Bob uploads too.
    let bob_upload = h.upload(bob, "same-hash", PDF_BYTES).await;

    let (a, b) = tokio::join!(
        h.uploads.finalize(alice_upload, alice),
        h.uploads.finalize(bob_upload, bob)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id, b.id);

    let queued = h
        .db
        .enqueued_events()
        .await
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::DocumentQueued { .. }))
        .count();
    assert_eq!(queued, 1);
    // The losing side removed its redundant copy.
    assert_eq!(h.files_with_extension("pdf"), 1);
}

#[tokio::test]
async fn finalize_is_idempotent_and_bytes_are_accepted_once() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;
    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;

    let again = h
        .uploads
        .accept_bytes(upload_id, owner, None, None, pdf_body(PDF_BYTES))
        .await;
    assert!(matches!(again, Err(ServiceError::Conflict(_))));

    let first = h.uploads.finalize(upload_id, owner).await.unwrap();
    let second = h.uploads.finalize(upload_id, owner).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.db.enqueued_events().await.len(), 1);
}

#[tokio::test]
async fn sessions_are_private_to_their_owner() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;
    let stranger = h.user().await;
    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;

    assert!(matches!(
        h.uploads.poll_status(upload_id, stranger).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        h.uploads.finalize(upload_id, stranger).await,
        Err(ServiceError::NotFound(_))
    ));
    assert_eq!(h.uploads.poll_status(upload_id, owner).await.unwrap(), UploadStatus::Uploaded);
}

#[tokio::test]
async fn finalize_before_bytes_is_a_conflict() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;
    let outcome = h.uploads.create_upload(owner, "hash-1", 10).await.unwrap();

    let result = h.uploads.finalize(outcome.upload_id.unwrap(), owner).await;
    assert!(matches!(result, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn rejected_bytes_fail_the_session() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;
    let outcome = h.uploads.create_upload(owner, "not-a-pdf", 11).await.unwrap();
    let upload_id = outcome.upload_id.unwrap();

    let result = h
        .uploads
        .accept_bytes(upload_id, owner, None, None, pdf_body(b"hello world"))
        .await;
    assert!(matches!(result, Err(ServiceError::UnsupportedMediaType(_))));
    assert_eq!(h.uploads.poll_status(upload_id, owner).await.unwrap(), UploadStatus::Failed);
    assert_eq!(h.files_with_extension("part"), 0);
    assert_eq!(h.files_with_extension("pdf"), 0);
}

#[tokio::test]
async fn declared_size_above_the_ceiling_is_rejected() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;
    let result = h.uploads.create_upload(owner, "huge", 250_000_001).await;
    assert!(matches!(result, Err(ServiceError::PayloadTooLarge { .. })));
}

#[tokio::test]
async fn in_flight_content_tells_the_caller_to_wait() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let alice = h.user().await;
    let bob = h.user().await;

    let pending = h.uploads.create_upload(alice, "hash-1", 100).await.unwrap();
    let waiting = h.uploads.create_upload(bob, "hash-1", 100).await.unwrap();
    assert_eq!(waiting.mode, UploadMode::CacheHitWait);
    assert_eq!(waiting.upload_id, pending.upload_id);
    assert!(waiting.document_id.is_none());
}

#[tokio::test]
async fn processed_content_is_a_cache_hit_that_grants_access() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let alice = h.user().await;
    let bob = h.user().await;

    let upload_id = h.upload(alice, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, alice).await.unwrap();

    // Still in the pipeline: the second caller is asked to wait.
    let early = h.uploads.create_upload(bob, "hash-1", 100).await.unwrap();
    assert_eq!(early.mode, UploadMode::CacheHitWait);
    assert!(matches!(
        h.documents.notes_for_document(bob, document.id).await,
        Err(ServiceError::Forbidden(_))
    ));

    h.pipeline.run_until_idle().await.unwrap();

    let hit = h.uploads.create_upload(bob, "hash-1", 100).await.unwrap();
    assert_eq!(hit.mode, UploadMode::CacheHit);
    assert_eq!(hit.document_id, Some(document.id));
    assert_eq!(h.documents.notes_for_document(bob, document.id).await.unwrap().len(), 2);
    assert_eq!(h.documents.list_user_uploads(bob).await.unwrap().len(), 1);
}

#[tokio::test]
async fn another_scan_of_an_annotated_edition_reuses_its_annotations() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;

    let first = h.upload(owner, "scan-1", PDF_BYTES).await;
    h.uploads.finalize(first, owner).await.unwrap();
    h.pipeline.run_until_idle().await.unwrap();
    let calls = h.completion.calls.load(Ordering::SeqCst);

    let second = h.upload(owner, "scan-2", OTHER_PDF_BYTES).await;
    let document = h.uploads.finalize(second, owner).await.unwrap();
    h.pipeline.run_until_idle().await.unwrap();

    let document = h.db.get_document(document.id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::AnnotationsReady);
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), calls);
    assert_eq!(h.documents.notes_for_document(owner, document.id).await.unwrap().len(), 2);
    assert_eq!(h.files_with_extension("txt"), 0);
}

#[tokio::test]
async fn text_without_an_isbn_gets_a_placeholder_textbook() {
    let h = harness("Lecture notes\nNo identifiers here.\n", "[]", false);
    let owner = h.user().await;
    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, owner).await.unwrap();

    h.pipeline.run_until_idle().await.unwrap();

    let document = h.db.get_document(document.id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::AnnotationsReady);
    let textbook = h.db.get_textbook(document.textbook_id.unwrap()).await.unwrap();
    assert!(textbook.isbn.starts_with(PLACEHOLDER_ISBN_PREFIX));
    assert!(h.documents.notes_for_document(owner, document.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn retried_identification_reuses_the_documents_placeholder() {
    let h = harness("Lecture notes\nNo identifiers here.\n", "[]", false);
    let owner = h.user().await;
    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, owner).await.unwrap();

    // An earlier attempt created the placeholder but never linked it.
    let earlier = h
        .db
        .create_textbook_if_absent(&Textbook::placeholder_for(document.id))
        .await
        .unwrap();

    h.pipeline.run_until_idle().await.unwrap();

    let document = h.db.get_document(document.id).await.unwrap();
    assert_eq!(document.textbook_id, Some(earlier.id));
    assert_eq!(document.status, DocumentStatus::AnnotationsReady);
}

#[tokio::test]
async fn slow_stages_keep_their_claim_until_they_finish() {
    let h = harness_with(
        BOOK_TEXT,
        NOTES_REPLY,
        false,
        Duration::from_millis(150),
        Duration::from_millis(400),
    );
    let owner = h.user().await;
    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, owner).await.unwrap();

    h.pipeline.run_until_idle().await.unwrap();

    let document = h.db.get_document(document.id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::AnnotationsReady);
    // The book text fits in one chunk, so one call means one run of the stage.
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 1);
    assert!(h.db.dead_letters().await.is_empty());
}

#[tokio::test]
async fn extraction_failure_parks_the_document_and_dead_letters_the_event() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, true);
    let owner = h.user().await;
    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, owner).await.unwrap();

    h.pipeline.run_until_idle().await.unwrap();

    let progress = h.documents.document_status(owner, document.id).await.unwrap();
    assert_eq!(progress.status, DocumentStatus::FailedTextExtraction);
    assert!(progress.failed);
    assert!(progress.last_error.unwrap().contains("PDF parser crashed"));

    let dead = h.db.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(h.db.pending_event_count().await, 0);

    // A failed document blocks re-upload of the same content.
    let again = h.uploads.create_upload(owner, "hash-1", 100).await;
    assert!(matches!(again, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn malformed_model_output_fails_the_annotation_stage() {
    let h = harness(BOOK_TEXT, "Sure! Here are the notes you asked for.", false);
    let owner = h.user().await;
    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, owner).await.unwrap();

    h.pipeline.run_until_idle().await.unwrap();

    let document = h.db.get_document(document.id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::FailedAnnotations);
    // One attempt plus one retry, one chunk each.
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 2);
    assert!(matches!(
        h.documents.notes_for_document(owner, document.id).await,
        Err(ServiceError::Conflict(_))
    ));
}

#[tokio::test]
async fn unlinked_documents_are_listed_as_unidentified() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;
    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, owner).await.unwrap();

    let listed = h.documents.list_user_uploads(owner).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].document_id, document.id);
    assert_eq!(listed[0].textbook_name, "UNKNOWN");
    assert_eq!(listed[0].document_status, DocumentStatus::FailedToIdentifyIsbn);

    h.pipeline.run_until_idle().await.unwrap();

    let listed = h.documents.list_user_uploads(owner).await.unwrap();
    assert_eq!(listed[0].textbook_name, "Introduction to Systems");
    assert_eq!(listed[0].document_status, DocumentStatus::AnnotationsReady);
}

#[tokio::test]
async fn deleting_an_upload_removes_it_from_the_listing() {
    let h = harness(BOOK_TEXT, NOTES_REPLY, false);
    let owner = h.user().await;
    let upload_id = h.upload(owner, "hash-1", PDF_BYTES).await;
    let document = h.uploads.finalize(upload_id, owner).await.unwrap();
    h.pipeline.run_until_idle().await.unwrap();

    h.documents.delete_user_upload(owner, document.id).await.unwrap();
    assert!(h.documents.list_user_uploads(owner).await.unwrap().is_empty());
    assert!(matches!(
        h.documents.delete_user_upload(owner, document.id).await,
        Err(ServiceError::NotFound(_))
    ));
}
