pub mod annotation_llm;
pub mod books;
pub mod db;
pub mod memory;
pub mod pdf;

pub use annotation_llm::OpenAiAnnotationAdapter;
pub use books::GoogleBooksAdapter;
pub use db::PgDatabase;
pub use memory::InMemoryDatabase;
pub use pdf::PdfTextExtractor;
