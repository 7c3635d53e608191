//! crates/textlift_core/src/pipeline.rs
//!
//! The document lifecycle orchestrator.
//!
//! Stage reactions are driven from the persisted outbox: a producer commits its
//! state change together with the event, then wakes the dispatcher. The
//! dispatcher leases pending events and runs each on a bounded worker pool, so
//! a reaction never observes a state that has not been committed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::annotation::AnnotationExtractor;
use crate::domain::{DocumentStatus, OutboxEntry, PipelineEvent};
use crate::error::{ServiceError, ServiceResult};
use crate::ports::{DatabaseService, TextExtractionService};
use crate::storage::{remove_file_best_effort, StorageLayout};
use crate::textbook::IsbnResolver;

//=========================================================================================
// Configuration & Wake-up
//=========================================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Reactions allowed to run at the same time.
    pub workers: usize,
    /// Attempts per reaction, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub retry_base: Duration,
    /// How long a claimed event stays invisible to other claims.
    pub lease: Duration,
    /// Fallback poll interval for wake-ups that were missed.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            retry_base: Duration::from_millis(500),
            lease: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Signals the dispatcher that new events were committed.
///
/// A wake with no one waiting is remembered, so a producer committing just
/// before the dispatcher parks is never lost.
#[derive(Debug, Clone, Default)]
pub struct PipelineWaker(Arc<Notify>);

impl PipelineWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.0.notify_one();
    }

    async fn notified(&self) {
        self.0.notified().await
    }
}

//=========================================================================================
// Stages
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TextExtraction,
    Identification,
    Annotation,
}

impl Stage {
    pub fn of(event: &PipelineEvent) -> Self {
        match event {
            PipelineEvent::DocumentQueued { .. } => Stage::TextExtraction,
            PipelineEvent::DocumentReadyForIdentification { .. } => Stage::Identification,
            PipelineEvent::TextbookIdentified { .. } => Stage::Annotation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::TextExtraction => "text_extraction",
            Stage::Identification => "identification",
            Stage::Annotation => "annotation",
        }
    }

    /// Document statuses this stage may run from. Later statuses mean the
    /// stage already committed and the event is a redelivery.
    pub fn accepts(&self, status: DocumentStatus) -> bool {
        match self {
            Stage::TextExtraction => status == DocumentStatus::Ready,
            Stage::Identification => matches!(
                status,
                DocumentStatus::TextExtracted | DocumentStatus::TextbookIdentified
            ),
            Stage::Annotation => matches!(
                status,
                DocumentStatus::TextbookIdentified | DocumentStatus::AnnotationsGenerating
            ),
        }
    }

    pub fn failure_status(&self) -> DocumentStatus {
        match self {
            Stage::TextExtraction => DocumentStatus::FailedTextExtraction,
            Stage::Identification => DocumentStatus::FailedToIdentifyIsbn,
            Stage::Annotation => DocumentStatus::FailedAnnotations,
        }
    }

    /// Conflict error for a document this stage may not run on.
    pub fn reject(&self, document_id: Uuid, status: DocumentStatus) -> ServiceError {
        ServiceError::Conflict(format!(
            "Document {} is {}, {} cannot run",
            document_id,
            status,
            self.as_str()
        ))
    }
}

//=========================================================================================
// The Orchestrator
//=========================================================================================

#[derive(Clone)]
pub struct Pipeline {
    db: Arc<dyn DatabaseService>,
    text_extractor: Arc<dyn TextExtractionService>,
    resolver: Arc<IsbnResolver>,
    annotator: Arc<AnnotationExtractor>,
    storage: StorageLayout,
    config: PipelineConfig,
    waker: PipelineWaker,
    workers: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        text_extractor: Arc<dyn TextExtractionService>,
        resolver: Arc<IsbnResolver>,
        annotator: Arc<AnnotationExtractor>,
        storage: StorageLayout,
        mut config: PipelineConfig,
        waker: PipelineWaker,
    ) -> Self {
        config.workers = config.workers.max(1);
        config.max_attempts = config.max_attempts.max(1);
        let workers = Arc::new(Semaphore::new(config.workers));
        Self {
            db,
            text_extractor,
            resolver,
            annotator,
            storage,
            config,
            waker,
            workers,
        }
    }

    pub fn waker(&self) -> PipelineWaker {
        self.waker.clone()
    }

    /// Dispatches events until `shutdown` fires, then waits for in-flight
    /// reactions to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(workers = self.config.workers, "Pipeline dispatcher started");
        loop {
            if let Err(e) = self.dispatch_pending().await {
                error!(error = %e, "Failed to claim pipeline events");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.waker.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Pipeline dispatcher stopping, waiting for in-flight reactions");
        let _drained = self.workers.acquire_many(self.config.workers as u32).await;
        info!("Pipeline dispatcher stopped");
    }

    /// Claims as many events as there are idle workers and spawns a reaction
    /// for each. Returns how many were dispatched.
    pub async fn dispatch_pending(&self) -> ServiceResult<usize> {
        let idle = self.workers.available_permits();
        if idle == 0 {
            return Ok(0);
        }
        let entries = self.db.claim_outbox_events(idle, self.config.lease).await?;
        let count = entries.len();

        for entry in entries {
            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Err(ServiceError::Internal("Pipeline worker pool is closed".to_string())),
            };
            let pipeline = self.clone();
            tokio::spawn(async move {
                pipeline.process_entry(entry).await;
                drop(permit);
                // Another batch may be waiting for a free worker.
                pipeline.waker.wake();
            });
        }
        if count > 0 {
            debug!(count, "Dispatched pipeline events");
        }
        Ok(count)
    }

    /// Runs reactions until the outbox is drained and no worker is busy.
    pub async fn run_until_idle(&self) -> ServiceResult<()> {
        loop {
            let busy = self.workers.available_permits() < self.config.workers;
            let dispatched = self.dispatch_pending().await?;
            if !busy && dispatched == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[instrument(skip(self, entry), fields(event_id = %entry.id, document_id = %entry.event.document_id(), stage = Stage::of(&entry.event).as_str()))]
    async fn process_entry(&self, entry: OutboxEntry) {
        let outcome = self.handle_with_retry(&entry.event);
        tokio::pin!(outcome);

        // The lease is renewed while the reaction runs, so a slow stage is
        // never claimed a second time by another worker.
        let mut heartbeat = tokio::time::interval((self.config.lease / 3).max(Duration::from_millis(1)));
        heartbeat.tick().await;
        let result = loop {
            tokio::select! {
                result = &mut outcome => break result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.db.extend_outbox_lease(entry.id, self.config.lease).await {
                        warn!(error = %e, "Failed to extend pipeline event lease");
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.db.complete_outbox_event(entry.id).await {
                    error!(error = %e, "Failed to mark pipeline event processed");
                }
            }
            Err(err) => {
                error!(error = %err, "Pipeline stage failed");
                self.mark_stage_failed(&entry.event, &err).await;
                if let Err(e) = self.db.dead_letter_outbox_event(entry.id, &err.to_string()).await {
                    error!(error = %e, "Failed to dead-letter pipeline event");
                }
            }
        }
    }

    async fn handle_with_retry(&self, event: &PipelineEvent) -> ServiceResult<()> {
        let mut attempt = 1;
        loop {
            match self.handle(event).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.retry_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Pipeline stage failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn handle(&self, event: &PipelineEvent) -> ServiceResult<()> {
        match event {
            PipelineEvent::DocumentQueued { document_id } => self.extract_text(*document_id).await,
            PipelineEvent::DocumentReadyForIdentification { document_id, metadata } => {
                self.resolver.identify(*document_id, metadata).await.map(|_| ())
            }
            PipelineEvent::TextbookIdentified {
                textbook_id,
                document_id,
            } => self.annotator.generate(*textbook_id, *document_id).await.map(|_| ()),
        }
    }

    /// READY -> TEXT_EXTRACTED: writes the full text next to the upload and
    /// repoints the document at it.
    #[instrument(skip(self))]
    async fn extract_text(&self, document_id: Uuid) -> ServiceResult<()> {
        let mut document = self.db.get_document(document_id).await?;
        if !Stage::TextExtraction.accepts(document.status) {
            return Err(Stage::TextExtraction.reject(document_id, document.status));
        }

        let pdf_path = PathBuf::from(&document.file_path);
        let text_path = self.storage.extracted_text_path(document_id);
        let metadata = match self.text_extractor.extract(&pdf_path, &text_path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                remove_file_best_effort(&text_path).await;
                return Err(e.into());
            }
        };

        document.file_path = text_path.to_string_lossy().into_owned();
        document.status = DocumentStatus::TextExtracted;
        document.last_error = None;
        let event = PipelineEvent::DocumentReadyForIdentification { document_id, metadata };
        self.db.update_document(&document, Some(&event)).await?;
        self.waker.wake();
        info!("Text extracted");

        remove_file_best_effort(&pdf_path).await;
        Ok(())
    }

    /// Parks the document in the stage's failure status, unless it already
    /// moved past the stage.
    async fn mark_stage_failed(&self, event: &PipelineEvent, err: &ServiceError) {
        let stage = Stage::of(event);
        let mut document = match self.db.get_document(event.document_id()).await {
            Ok(document) => document,
            Err(e) => {
                warn!(error = %e, "Cannot record stage failure, document unavailable");
                return;
            }
        };
        if !stage.accepts(document.status) {
            return;
        }

        document.status = stage.failure_status();
        document.last_error = Some(err.to_string());
        match self.db.update_document(&document, None).await {
            Ok(()) => warn!(status = %document.status, "Document parked after stage failure"),
            Err(e) => error!(error = %e, "Failed to record stage failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_accept_their_input_and_redelivery_statuses() {
        assert!(Stage::TextExtraction.accepts(DocumentStatus::Ready));
        assert!(!Stage::TextExtraction.accepts(DocumentStatus::TextExtracted));
        assert!(Stage::Identification.accepts(DocumentStatus::TextbookIdentified));
        assert!(!Stage::Identification.accepts(DocumentStatus::AnnotationsReady));
        assert!(Stage::Annotation.accepts(DocumentStatus::AnnotationsGenerating));
        assert!(!Stage::Annotation.accepts(DocumentStatus::FailedAnnotations));
    }

    #[test]
    fn every_stage_has_its_own_failure_status() {
        for stage in [Stage::TextExtraction, Stage::Identification, Stage::Annotation] {
            assert!(stage.failure_status().is_failure());
            assert!(!stage.accepts(stage.failure_status()));
        }
    }

    #[tokio::test]
    async fn wake_before_wait_is_not_lost() {
        let waker = PipelineWaker::new();
        waker.wake();
        tokio::time::timeout(Duration::from_millis(100), waker.notified())
            .await
            .expect("stored wake-up");
    }
}
