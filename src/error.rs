//! Error types for the recommendation core
//!
//! `CoreError` is the taxonomy every public operation returns. Lower layers
//! (`VectorError`, `VectorStorageError`, `ClusteringError`) convert into it
//! with `?`, so callers only ever match on one enum.

use crate::vector::{ClusteringError, ItemId, VectorError, VectorStorageError};
use thiserror::Error;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Caller errors: the vector shape is wrong
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure the encoder and index use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector: {reason}")]
    InvalidVector { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    /// External encoder failed; the core never retries
    #[error("Encoding failed: {reason}")]
    EncodingFailed { reason: String },

    /// Nothing indexed yet; expected during cold start
    #[error("Index is empty. Ingest items before requesting recommendations.")]
    EmptyIndex,

    #[error(
        "Staging capacity exceeded ({staged} of {cap} staged entries) while a rebuild is in flight"
    )]
    CapacityExceeded { staged: usize, cap: usize },

    #[error("Service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    #[error("Item {item_id} not found. It may have been deleted or never ingested.")]
    NotFound { item_id: ItemId },

    /// Storage errors
    #[error("Vector storage I/O failed: {source}")]
    Storage {
        #[from]
        source: std::io::Error,
    },

    #[error("Vector storage appears to be corrupted: {reason}")]
    StorageCorrupted { reason: String },

    /// Change feed errors
    #[error("Metadata source '{source_name}' failed: {reason}")]
    Source { source_name: String, reason: String },

    /// Configuration errors
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl CoreError {
    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::InvalidVector { .. } => "INVALID_VECTOR",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::EncodingFailed { .. } => "ENCODING_FAILED",
            Self::EmptyIndex => "EMPTY_INDEX",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::StorageCorrupted { .. } => "STORAGE_CORRUPTED",
            Self::Source { .. } => "SOURCE_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
        .to_string()
    }

    /// Whether the caller may retry the same call later.
    ///
    /// The core itself never retries; this only informs caller policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EncodingFailed { .. }
                | Self::CapacityExceeded { .. }
                | Self::ServiceUnavailable { .. }
                | Self::Source { .. }
        )
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::DimensionMismatch { .. } => vec![
                "Check that [index] dimension matches the embedding model output",
                "Delete the data directory and re-ingest after changing models",
            ],
            Self::EncodingFailed { .. } => vec![
                "The item was left in its previous state; retry the ingest",
                "Verify the embedding model downloaded correctly",
            ],
            Self::EmptyIndex => vec!["Ingest items with 'folio ingest' or 'folio sync' first"],
            Self::CapacityExceeded { .. } => vec![
                "Retry after the in-flight rebuild publishes",
                "Raise [index] staging_cap if this happens under normal load",
            ],
            Self::ServiceUnavailable { .. } => {
                vec!["The service is shutting down; retry against a new instance"]
            }
            Self::StorageCorrupted { .. } => vec![
                "Restore vectors.log from backup",
                "Delete the data directory and run 'folio sync' to rebuild from the metadata store",
            ],
            Self::Storage { .. } => vec![
                "Check disk space and permissions in the data directory",
                "Ensure no other folio process holds the data directory",
            ],
            Self::Source { .. } => vec![
                "The sync cursor was kept before the failing record",
                "Fix the record in the metadata store and run 'folio sync' again",
            ],
            Self::Config { .. } => vec!["Run 'folio config' to inspect the effective settings"],
            _ => vec![],
        }
    }
}

impl From<VectorError> for CoreError {
    fn from(err: VectorError) -> Self {
        match err {
            VectorError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            VectorError::InvalidVector { reason } => Self::InvalidVector { reason },
            VectorError::InvalidItemId { value } => Self::InvalidInput {
                reason: format!("'{value}' is not a valid item id"),
            },
            VectorError::NotFound(item_id) => Self::NotFound { item_id },
            VectorError::Storage(source) => Self::Storage { source },
            VectorError::EmbeddingFailed(reason) => Self::EncodingFailed { reason },
            VectorError::VersionMismatch { expected, actual } => Self::StorageCorrupted {
                reason: format!("format version {actual}, expected {expected}"),
            },
            other @ (VectorError::InvalidDimension { .. }
            | VectorError::InvalidScore { .. }
            | VectorError::ClusteringFailed(_)) => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

impl From<VectorStorageError> for CoreError {
    fn from(err: VectorStorageError) -> Self {
        match err {
            VectorStorageError::Io(source) => Self::Storage { source },
            VectorStorageError::InvalidFormat(reason) => Self::StorageCorrupted { reason },
            VectorStorageError::Vector(e) => e.into(),
        }
    }
}

impl From<ClusteringError> for CoreError {
    fn from(err: ClusteringError) -> Self {
        Self::Internal {
            reason: format!("snapshot partitioning failed: {err}"),
        }
    }
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
