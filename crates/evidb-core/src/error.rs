use thiserror::Error;

use crate::types::{ChunkId, ProviderIdentity};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Provider mismatch: index was built with {index}, query uses {query}")]
    ProviderMismatch { index: ProviderIdentity, query: ProviderIdentity },

    #[error("Embedding provider {provider} timed out after {attempts} attempt(s)")]
    ProviderTimeout { provider: String, attempts: u32 },

    #[error("Embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Embedding provider failed: {0}")]
    Provider(String),

    #[error("Generator failed: {0}")]
    Generation(String),

    #[error("Persisted index is corrupt: {0}")]
    Corruption(String),

    #[error("Duplicate chunk id: {0}")]
    DuplicateChunk(ChunkId),

    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Failures that leave no trace in the index and are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ProviderTimeout { .. } | Error::ProviderUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
