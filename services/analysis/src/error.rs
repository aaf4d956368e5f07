//! Error taxonomy shared by the core components.

use crate::analysis_invoker::AnalysisError;
use thiserror::Error;

/// Errors raised by the record lifecycle and batch orchestration core
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Malformed input; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or invalid identity
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// The vision capability failed for one image
    #[error("Analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    /// Object store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl ServiceError {
    /// Build a validation error from anything printable
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Build a storage error from anything printable
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Stable machine-readable code for API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Authorization(_) => "UNAUTHORIZED",
            Self::Analysis(_) => "ANALYSIS_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

/// Result alias for core operations
pub type ServiceResult<T> = Result<T, ServiceError>;
