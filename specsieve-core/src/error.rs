//! Error types for each pipeline component.
//!
//! Orchestration code (processor, readers, CLI) works in `anyhow::Result`
//! and downcasts to these when it needs to pick an exit status.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no pages could be extracted from {0}")]
    NoPagesExtracted(String),

    #[error("page {page} failed: {message}")]
    PageFailed { page: u32, message: String },

    #[error("structure reader error: {0}")]
    Reader(String),

    #[error("artifact {0} already exists and is never rewritten")]
    ArtifactExists(String),

    #[error("artifact {document_id} failed {issues} integrity check(s)")]
    IntegrityFailed { document_id: String, issues: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("region render failed: {0}")]
    RenderFailed(String),

    #[error("recognition failed: {0}")]
    RecognitionFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("{kind} corrections cannot be recorded at {scope} scope")]
    InvalidScope { kind: String, scope: String },

    #[error("{scope} scope requires {what}")]
    MissingOwner { scope: String, what: String },

    #[error("invalid owner {owner:?}: {reason}")]
    InvalidOwner { owner: String, reason: String },

    #[error("correction payload is incomplete: {0}")]
    EmptyPayload(String),

    #[error("unknown device: {0}")]
    MissingDevice(String),

    #[error("invalid pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl CorrectionError {
    /// Bad input from the caller rather than an environment failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CorrectionError::InvalidScope { .. }
                | CorrectionError::MissingOwner { .. }
                | CorrectionError::InvalidOwner { .. }
                | CorrectionError::EmptyPayload(_)
                | CorrectionError::InvalidPattern { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("no cache entry for hash {0}")]
    NotFound(String),

    #[error("cache entry {0} is already verified")]
    AlreadyVerified(String),

    #[error("rate limit exhausted after waiting {waited:?}")]
    RateLimited { waited: Duration },

    #[error("generation failed: {0}")]
    Generation(String),
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::RateLimited { .. })
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::StoreUnavailable(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("index is empty")]
    EmptyIndex,

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limit_is_retryable() {
        assert!(CacheError::RateLimited {
            waited: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!CacheError::StoreUnavailable("down".into()).is_retryable());
        assert!(!CacheError::AlreadyVerified("abc".into()).is_retryable());
    }

    #[test]
    fn validation_errors_are_classified() {
        assert!(CorrectionError::EmptyPayload("corrected".into()).is_validation());
        assert!(CorrectionError::InvalidOwner {
            owner: "../x".into(),
            reason: "path separator".into()
        }
        .is_validation());
        assert!(!CorrectionError::MissingDevice("dev".into()).is_validation());
    }
}
