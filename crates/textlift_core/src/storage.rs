//! crates/textlift_core/src/storage.rs
//!
//! On-disk layout for uploaded PDFs and extracted text.
//!
//! Uploads are keyed by upload id, extracted text by document id, all under a
//! single root directory. Both kinds of file are deleted once the next stage
//! has consumed them.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Final location of a fully received upload.
    pub fn upload_pdf_path(&self, upload_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.pdf", upload_id))
    }

    /// In-progress location; only ever renamed into `upload_pdf_path`.
    pub fn upload_part_path(&self, upload_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.pdf.part", upload_id))
    }

    pub fn extracted_text_path(&self, document_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.txt", document_id))
    }
}

/// Deletes `path`, treating an already missing file as success.
pub async fn remove_file_best_effort(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_keyed_under_the_root() {
        let layout = StorageLayout::new("/tmp/textlift/uploads");
        let id = Uuid::nil();
        assert_eq!(
            layout.upload_pdf_path(id),
            PathBuf::from("/tmp/textlift/uploads/00000000-0000-0000-0000-000000000000.pdf")
        );
        assert!(layout.upload_part_path(id).to_string_lossy().ends_with(".pdf.part"));
        assert!(layout.extracted_text_path(id).to_string_lossy().ends_with(".txt"));
    }

    #[tokio::test]
    async fn removing_a_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        remove_file_best_effort(&dir.path().join("absent.pdf")).await;
    }
}
