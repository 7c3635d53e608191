//! services/api/src/adapters/pdf.rs
//!
//! This module contains the PDF adapter, which implements the `TextExtractionService`
//! port using `lopdf`. Parsing is CPU-bound and runs on the blocking pool.

use async_trait::async_trait;
use lopdf::Object;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use textlift_core::domain::PdfMetadata;
use textlift_core::ports::{PortError, PortResult, TextExtractionService};
use tracing::{debug, warn};

/// Pages extracted per `extract_text` call, bounding the size of each
/// intermediate string.
const PAGE_WINDOW: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct PdfTextExtractor;

impl PdfTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TextExtractionService for PdfTextExtractor {
    async fn extract(&self, pdf_path: &Path, text_path: &Path) -> PortResult<PdfMetadata> {
        let pdf_path: PathBuf = pdf_path.to_path_buf();
        let text_path: PathBuf = text_path.to_path_buf();
        tokio::task::spawn_blocking(move || extract_blocking(&pdf_path, &text_path))
            .await
            .map_err(|e| PortError::Unexpected(format!("PDF extraction task failed: {}", e)))?
    }
}

fn extract_blocking(pdf_path: &Path, text_path: &Path) -> PortResult<PdfMetadata> {
    if !pdf_path.exists() {
        return Err(PortError::NotFound(format!("PDF missing at {}", pdf_path.display())));
    }
    let doc = lopdf::Document::load(pdf_path)
        .map_err(|e| PortError::Unexpected(format!("Failed to load PDF {}: {}", pdf_path.display(), e)))?;

    let metadata = read_metadata(&doc);
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    debug!(page_count = pages.len(), "Extracting text from PDF");

    let io_err = |e: std::io::Error| match e.kind() {
        ErrorKind::NotFound => PortError::NotFound(e.to_string()),
        _ => PortError::Unexpected(format!("Failed to write extracted text: {}", e)),
    };
    let mut out = BufWriter::new(File::create(text_path).map_err(io_err)?);
    let mut written = 0usize;
    for window in pages.chunks(PAGE_WINDOW) {
        match doc.extract_text(window) {
            Ok(text) => {
                out.write_all(text.as_bytes()).map_err(io_err)?;
                written += text.len();
            }
            Err(e) => warn!(first_page = window[0], error = %e, "Failed to extract page window, skipping"),
        }
    }
    out.flush().map_err(io_err)?;

    if written == 0 && !pages.is_empty() {
        return Err(PortError::Unexpected("No text could be extracted from the PDF".to_string()));
    }
    Ok(metadata)
}

/// Reads the trailer's document information dictionary, if any.
fn read_metadata(doc: &lopdf::Document) -> PdfMetadata {
    let info = doc
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| match obj {
            Object::Reference(id) => doc.get_object(*id).ok(),
            other => Some(other),
        })
        .and_then(|obj| obj.as_dict().ok());

    let field = |key: &[u8]| {
        info.and_then(|dict| dict.get(key).ok())
            .and_then(|value| value.as_str().ok())
            .map(decode_text_string)
            .filter(|value| !value.trim().is_empty())
    };

    PdfMetadata {
        author: field(b"Author"),
        title: field(b"Title"),
        subject: field(b"Subject"),
        keywords: field(b"Keywords"),
    }
}

/// Text strings are UTF-16BE when they carry a byte order mark, otherwise
/// treated as (mostly ASCII) single-byte text.
fn decode_text_string(bytes: &[u8]) -> String {
    match bytes.strip_prefix(&[0xFE, 0xFF]) {
        Some(utf16) => {
            let units: Vec<u16> = utf16
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}
