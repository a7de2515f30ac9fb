//! Error types for the ranking core

use thiserror::Error;

/// Errors raised by the engine, the store and the dispatcher.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    /// Malformed document, query or setting value.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A document with this url is already part of the collection.
    #[error("document already exists: {url}")]
    DuplicateDocument { url: String },

    /// No document with this url is part of the collection.
    #[error("unknown document: {url}")]
    UnknownDocument { url: String },

    /// Attempted to overwrite a protected store key through `set`.
    #[error("store key is protected: {key}")]
    KeyProtected { key: String },

    /// Durable storage is missing or corrupt.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A worker-pool job panicked or its result was lost.
    #[error("compute failed: {0}")]
    ComputeFailed(String),

    /// The dispatcher queue is full.
    #[error("dispatcher overloaded: {limit} jobs already queued")]
    Overloaded { limit: usize },

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias used across the crate
pub type SearchResult<T> = std::result::Result<T, SearchError>;

impl SearchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Stable snake_case tag reported on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::DuplicateDocument { .. } => "duplicate_document",
            Self::UnknownDocument { .. } => "unknown_document",
            Self::KeyProtected { .. } => "key_protected",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::ComputeFailed(_) => "compute_failed",
            Self::Overloaded { .. } => "overloaded",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Validation errors are reported to the caller and never escalate.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::DuplicateDocument { .. }
                | Self::UnknownDocument { .. }
                | Self::KeyProtected { .. }
        )
    }
}

impl From<std::io::Error> for SearchError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<bincode::Error> for SearchError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_snake_case() {
        assert_eq!(SearchError::invalid("x").kind(), "invalid_input");
        assert_eq!(SearchError::ComputeFailed("boom".into()).kind(), "compute_failed");
        assert_eq!(SearchError::Overloaded { limit: 4 }.kind(), "overloaded");
    }

    #[test]
    fn validation_classification() {
        assert!(SearchError::UnknownDocument { url: "/x".into() }.is_validation());
        assert!(SearchError::KeyProtected { key: "model".into() }.is_validation());
        assert!(!SearchError::ComputeFailed("x".into()).is_validation());
        assert!(!SearchError::StoreUnavailable("x".into()).is_validation());
    }
}
