//! Error types for the gateway

use thiserror::Error;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    /// Ingest pipeline error
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// General error
    #[error("{0}")]
    General(String),
}

/// Errors raised by the ingest pipeline (parser, staging, coordinator).
///
/// Each variant has a fixed HTTP disposition used by the server handlers.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed exposition stream
    #[error("parsing failed: {0}")]
    Parse(String),

    /// Sample carried an instance_id label that contradicts the target
    #[error("instance_id mismatch in metric '{family}': expected '{expected}', got '{got}'")]
    IdentityMismatch {
        /// Family the offending sample belongs to
        family: String,
        /// instance_id the request targeted
        expected: String,
        /// instance_id found on the sample
        got: String,
    },

    /// Request body exceeded the configured cap
    #[error("request body too large")]
    RequestTooLarge,

    /// Chunk sequence id is not a non-negative integer
    #[error("invalid seq_id: {0}")]
    BadSequence(String),

    /// Commit targeted an unknown or empty transaction
    #[error("transaction not found or empty: {0}")]
    TxnNotFound(String),

    /// Staging buffer reached its capacity
    #[error("staging buffer is full")]
    StagingFull,

    /// Reading the request body failed
    #[error("read error: {0}")]
    Read(#[from] std::io::Error),
}

impl IngestError {
    /// HTTP status code this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            IngestError::Parse(_) | IngestError::IdentityMismatch { .. } => 400,
            IngestError::BadSequence(_) => 400,
            IngestError::RequestTooLarge => 413,
            IngestError::TxnNotFound(_) => 404,
            IngestError::StagingFull => 503,
            IngestError::Read(_) => 400,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
