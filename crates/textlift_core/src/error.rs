//! crates/textlift_core/src/error.rs
//!
//! The error type returned by the core use-cases.

use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{message}")]
    PayloadTooLarge { message: String, limit: u64 },
    #[error("{0}")]
    UnsupportedMediaType(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Only infrastructure failures are worth another attempt; state-machine
    /// and lookup failures will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Internal(_))
    }
}

impl From<PortError> for ServiceError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::NotFound(msg) => ServiceError::NotFound(msg),
            PortError::Conflict(msg) => ServiceError::Conflict(msg),
            PortError::Unauthorized => ServiceError::Unauthorized("Unauthorized".to_string()),
            PortError::Unexpected(msg) => ServiceError::Internal(msg),
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}
