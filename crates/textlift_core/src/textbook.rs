//! crates/textlift_core/src/textbook.rs
//!
//! Resolves an extracted document to a textbook edition.
//!
//! The front matter is scanned for an ISBN-13; the document is linked to the
//! textbook carrying that ISBN (created on first sight) or to the document's
//! own placeholder when nothing validates. Known ISBNs are enriched from the book
//! lookup, strictly additively.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{BookMetadata, DocumentStatus, PdfMetadata, PipelineEvent, Textbook};
use crate::error::{ServiceError, ServiceResult};
use crate::isbn::{find_best_isbn13, FRONT_MATTER_CHARS};
use crate::pipeline::{PipelineWaker, Stage};
use crate::ports::{BookLookupService, DatabaseService};
use crate::storage::remove_file_best_effort;

/// What identification settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub textbook_id: Uuid,
    pub isbn: Option<String>,
    /// The textbook already had annotations, so generation was skipped.
    pub already_annotated: bool,
}

pub struct IsbnResolver {
    db: Arc<dyn DatabaseService>,
    lookup: Arc<dyn BookLookupService>,
    waker: PipelineWaker,
}

impl IsbnResolver {
    pub fn new(db: Arc<dyn DatabaseService>, lookup: Arc<dyn BookLookupService>, waker: PipelineWaker) -> Self {
        Self { db, lookup, waker }
    }

    #[instrument(skip(self, metadata))]
    pub async fn identify(&self, document_id: Uuid, metadata: &PdfMetadata) -> ServiceResult<Identification> {
        let mut document = self.db.get_document(document_id).await?;
        if !Stage::Identification.accepts(document.status) {
            return Err(Stage::Identification.reject(document_id, document.status));
        }

        // Redelivery of an event whose reaction already committed.
        if document.status == DocumentStatus::TextbookIdentified {
            if let Some(textbook_id) = document.textbook_id {
                let textbook = self.db.get_textbook(textbook_id).await?;
                return Ok(Identification {
                    textbook_id,
                    isbn: (!textbook.is_placeholder()).then_some(textbook.isbn),
                    already_annotated: false,
                });
            }
        }

        let front_matter = read_front_matter(Path::new(&document.file_path)).await?;
        let isbn = find_best_isbn13(&front_matter);

        let mut textbook = match &isbn {
            Some(isbn) => match self.db.find_textbook_by_isbn(isbn).await? {
                Some(existing) => existing,
                None => self.db.create_textbook_if_absent(&Textbook::with_isbn(isbn)).await?,
            },
            None => {
                warn!("No valid ISBN-13 in front matter, using a placeholder textbook");
                self.db.create_textbook_if_absent(&Textbook::placeholder_for(document_id)).await?
            }
        };

        if isbn.is_some() && textbook.needs_enrichment() {
            self.enrich(&mut textbook, metadata).await?;
        }

        let already_annotated = self.db.find_annotation_for_textbook(textbook.id).await?.is_some();

        document.textbook_id = Some(textbook.id);
        document.last_error = None;
        if already_annotated {
            // The edition was annotated through another upload; nothing to generate.
            document.status = DocumentStatus::AnnotationsReady;
            self.db.update_document(&document, None).await?;
            remove_file_best_effort(Path::new(&document.file_path)).await;
        } else {
            document.status = DocumentStatus::TextbookIdentified;
            let event = PipelineEvent::TextbookIdentified {
                textbook_id: textbook.id,
                document_id,
            };
            self.db.update_document(&document, Some(&event)).await?;
            self.waker.wake();
        }

        info!(textbook_id = %textbook.id, isbn = ?isbn, already_annotated, "Textbook identified");
        Ok(Identification {
            textbook_id: textbook.id,
            isbn,
            already_annotated,
        })
    }

    /// Fills blank textbook fields from the lookup, then from the PDF's own
    /// information dictionary. Lookup failures only cost the enrichment.
    async fn enrich(&self, textbook: &mut Textbook, metadata: &PdfMetadata) -> ServiceResult<()> {
        let mut changed = false;
        match self.lookup.lookup_by_isbn(&textbook.isbn).await {
            Ok(Some(found)) => changed |= textbook.merge_missing(&found),
            Ok(None) => info!(isbn = %textbook.isbn, "No book metadata found for ISBN"),
            Err(e) => warn!(isbn = %textbook.isbn, error = %e, "Book lookup failed, skipping enrichment"),
        }
        if textbook.needs_enrichment() {
            changed |= textbook.merge_missing(&metadata_from_pdf(metadata));
        }
        if changed {
            self.db.update_textbook(textbook).await?;
        }
        Ok(())
    }
}

fn metadata_from_pdf(metadata: &PdfMetadata) -> BookMetadata {
    let authors = metadata
        .author
        .as_deref()
        .map(|a| {
            a.split(';')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    BookMetadata {
        title: metadata.title.clone(),
        authors,
        ..Default::default()
    }
}

/// Reads at most `FRONT_MATTER_CHARS` characters from the start of the text file.
async fn read_front_matter(path: &Path) -> ServiceResult<String> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ServiceError::NotFound(format!(
                "Extracted text missing at {}",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };

    // UTF-8 needs at most four bytes per character.
    let mut bytes = Vec::new();
    file.take((FRONT_MATTER_CHARS * 4) as u64).read_to_end(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).chars().take(FRONT_MATTER_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_authors_split_on_semicolons() {
        let book = metadata_from_pdf(&PdfMetadata {
            author: Some("Ada Lovelace; Charles Babbage ;".into()),
            title: Some("Notes".into()),
            ..Default::default()
        });
        assert_eq!(book.authors, vec!["Ada Lovelace".to_string(), "Charles Babbage".to_string()]);
        assert_eq!(book.title.as_deref(), Some("Notes"));
    }

    #[tokio::test]
    async fn front_matter_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        tokio::fs::write(&path, "é".repeat(FRONT_MATTER_CHARS + 10)).await.unwrap();
        let front = read_front_matter(&path).await.unwrap();
        assert_eq!(front.chars().count(), FRONT_MATTER_CHARS);
    }

    #[tokio::test]
    async fn missing_text_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_front_matter(&dir.path().join("gone.txt")).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
