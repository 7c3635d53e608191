pub mod annotation;
pub mod chunking;
pub mod documents;
pub mod domain;
pub mod error;
pub mod isbn;
pub mod pipeline;
pub mod ports;
pub mod storage;
pub mod textbook;
pub mod upload;

pub use annotation::AnnotationExtractor;
pub use documents::DocumentService;
pub use domain::{
    Annotation, AnnotationNote, Document, DocumentStatus, PipelineEvent, Textbook, UploadSession, UploadStatus,
    User,
};
pub use error::{ServiceError, ServiceResult};
pub use pipeline::{Pipeline, PipelineConfig, PipelineWaker};
pub use ports::{
    BookLookupService, DatabaseService, PortError, PortResult, StructuredCompletionService, TextExtractionService,
};
pub use storage::StorageLayout;
pub use textbook::IsbnResolver;
pub use upload::{UploadLimits, UploadService};
