//! crates/textlift_core/src/annotation.rs
//!
//! Chunked annotation extraction over a document's full text.
//!
//! The text file is streamed line by line into `ChunkAccumulator`; every
//! flushed chunk is sent, in order, to the structured completion service and
//! its findings are appended to the run. A chunk that errors or returns an
//! invalid shape is skipped and counted, so one bad reply never discards the
//! rest of the document.

use chrono::Utc;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::chunking::{ChunkAccumulator, CHUNK_TARGET_BYTES};
use crate::domain::{Annotation, AnnotationNote, DocumentStatus};
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::Stage;
use crate::ports::{DatabaseService, StructuredCompletionService};
use crate::storage::remove_file_best_effort;

/// One finding as the model must return it: exactly these four strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractedNote {
    pub note: String,
    pub reason: String,
    pub quote: String,
    pub location: String,
}

/// Summary of a finished extraction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRun {
    pub annotation_id: Uuid,
    pub version: i32,
    pub chunks: u32,
    pub failed_chunks: u32,
    pub notes: usize,
}

pub struct AnnotationExtractor {
    db: Arc<dyn DatabaseService>,
    completion: Arc<dyn StructuredCompletionService>,
    chunk_target: usize,
}

impl AnnotationExtractor {
    pub fn new(db: Arc<dyn DatabaseService>, completion: Arc<dyn StructuredCompletionService>) -> Self {
        Self {
            db,
            completion,
            chunk_target: CHUNK_TARGET_BYTES,
        }
    }

    /// Overrides the chunk size target.
    pub fn with_chunk_target(mut self, chunk_target: usize) -> Self {
        self.chunk_target = chunk_target.max(1);
        self
    }

    #[instrument(skip(self))]
    pub async fn generate(&self, textbook_id: Uuid, document_id: Uuid) -> ServiceResult<AnnotationRun> {
        let mut document = self.db.get_document(document_id).await?;
        if !Stage::Annotation.accepts(document.status) {
            return Err(Stage::Annotation.reject(document_id, document.status));
        }
        if document.textbook_id != Some(textbook_id) {
            return Err(ServiceError::Conflict(format!(
                "Document {} is not linked to textbook {}",
                document_id, textbook_id
            )));
        }
        let textbook = self.db.get_textbook(textbook_id).await?;

        if document.status == DocumentStatus::TextbookIdentified {
            document.status = DocumentStatus::AnnotationsGenerating;
            self.db.update_document(&document, None).await?;
        }

        let text_path = document.file_path.clone();
        let file = match tokio::fs::File::open(&text_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ServiceError::NotFound(format!("Extracted text missing at {}", text_path)))
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut accumulator = ChunkAccumulator::new(self.chunk_target);
        let mut collected = Vec::new();
        let mut chunks = 0u32;
        let mut failed_chunks = 0u32;
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            if let Some(chunk) = accumulator.push_line(&line) {
                chunks += 1;
                if !self.extract_chunk(chunks, &chunk, &mut collected).await {
                    failed_chunks += 1;
                }
            }
        }
        if let Some(chunk) = accumulator.finish() {
            chunks += 1;
            if !self.extract_chunk(chunks, &chunk, &mut collected).await {
                failed_chunks += 1;
            }
        }

        if chunks > 0 && failed_chunks == chunks {
            return Err(ServiceError::Internal(format!(
                "Annotation extraction failed for all {} chunks",
                chunks
            )));
        }

        let previous_version = self
            .db
            .find_annotation_for_textbook(textbook.id)
            .await?
            .map_or(0, |previous| previous.version);
        let annotation_id = Uuid::new_v4();
        let notes: Vec<AnnotationNote> = collected
            .into_iter()
            .enumerate()
            .map(|(position, found)| AnnotationNote {
                id: Uuid::new_v4(),
                annotation_id,
                position: position as i32,
                note: found.note,
                reason: found.reason,
                quote: found.quote,
                location: found.location,
            })
            .collect();
        let annotation = Annotation {
            id: annotation_id,
            textbook_id: textbook.id,
            version: previous_version + 1,
            notes,
            failed_chunks,
            created_at: Utc::now(),
        };

        document.status = DocumentStatus::AnnotationsReady;
        document.last_error = if failed_chunks > 0 {
            Some(format!("{} of {} chunks could not be annotated", failed_chunks, chunks))
        } else {
            None
        };
        self.db.save_annotation(&annotation, &document).await?;
        remove_file_best_effort(Path::new(&text_path)).await;

        info!(
            version = annotation.version,
            chunks,
            failed_chunks,
            notes = annotation.notes.len(),
            "Annotations ready"
        );
        Ok(AnnotationRun {
            annotation_id,
            version: annotation.version,
            chunks,
            failed_chunks,
            notes: annotation.notes.len(),
        })
    }

    /// Appends the chunk's findings; false when the chunk had to be skipped.
    async fn extract_chunk(&self, index: u32, chunk: &str, collected: &mut Vec<ExtractedNote>) -> bool {
        let raw = match self.completion.complete_structured(&build_prompt(chunk)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(chunk = index, error = %e, "Completion failed, skipping chunk");
                return false;
            }
        };
        match parse_notes(&raw) {
            Ok(notes) => {
                collected.extend(notes);
                true
            }
            Err(e) => {
                warn!(chunk = index, error = %e, "Malformed annotation reply, skipping chunk");
                false
            }
        }
    }
}

pub fn build_prompt(chunk: &str) -> String {
    format!(
        "You are an information extraction engine.\n\
         \n\
         Task: From the TEXT, extract only statements that are outdated, wrong, or questionable.\n\
         If none exist, return [].\n\
         \n\
         Output rules (MUST follow exactly):\n\
         - Return ONLY valid JSON (no prose).\n\
         - Return a JSON array (even if one item).\n\
         - Each item is an object with exactly these 4 keys, all STRING values: note, reason, quote, location\n\
         - Do not include markdown, backticks, or code fences.\n\
         \n\
         TEXT:\n{}",
        chunk
    )
}

/// Validates a model reply as a JSON array of `ExtractedNote`.
///
/// A surrounding markdown code fence is tolerated, as are `\_` escapes some
/// models emit; anything else that is not exactly the expected shape fails.
/// Valid JSON is taken as is, so an escaped backslash before an underscore
/// keeps its meaning.
pub fn parse_notes(raw: &str) -> Result<Vec<ExtractedNote>, serde_json::Error> {
    let body = strip_code_fence(raw.trim());
    match serde_json::from_str::<Vec<ExtractedNote>>(body) {
        Ok(notes) => Ok(notes),
        Err(err) if body.contains("\\_") => serde_json::from_str(&body.replace("\\_", "_")).map_err(|_| err),
        Err(err) => Err(err),
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    // Drop the info string ("json") on the opening fence line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_array_in_order() {
        let raw = r#"[{"note":"a","reason":"b","quote":"c","location":"p1"},
                      {"note":"d","reason":"e","quote":"f","location":"p2"}]"#;
        let notes = parse_notes(raw).unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].note, "a");
        assert_eq!(notes[1].location, "p2");
    }

    #[test]
    fn tolerates_code_fences_and_escaped_underscores() {
        let raw = "```json\n[{\"note\":\"snake\\_case\",\"reason\":\"r\",\"quote\":\"q\",\"location\":\"l\"}]\n```";
        let notes = parse_notes(raw).unwrap();
        assert_eq!(notes[0].note, "snake_case");
        assert!(parse_notes("```\n[]\n```").unwrap().is_empty());
    }

    #[test]
    fn escaped_backslashes_before_underscores_survive() {
        let raw = r#"[{"note":"C:\\my_dir and a\\_b","reason":"r","quote":"q","location":"l"}]"#;
        let notes = parse_notes(raw).unwrap();
        assert_eq!(notes[0].note, r"C:\my_dir and a\_b");
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(parse_notes(r#"{"note":"a","reason":"b","quote":"c","location":"d"}"#).is_err());
        assert!(parse_notes(r#"[{"note":"a","reason":"b","quote":"c"}]"#).is_err());
        assert!(parse_notes(r#"[{"note":"a","reason":"b","quote":"c","location":4}]"#).is_err());
        assert!(parse_notes(r#"[{"note":"a","reason":"b","quote":"c","location":"d","page":1}]"#).is_err());
        assert!(parse_notes("Here are the notes you asked for").is_err());
    }

    #[test]
    fn prompt_carries_the_chunk_verbatim() {
        let prompt = build_prompt("line one\nline two\n");
        assert!(prompt.ends_with("TEXT:\nline one\nline two\n"));
        assert!(prompt.contains("note, reason, quote, location"));
    }
}
