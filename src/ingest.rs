//! Ingest coordinator
//!
//! Orchestrates the two commit paths against the parser, the staging
//! buffer, and the live store: single-shot bodies land directly, chunked
//! bodies are staged under a transaction hash and reassembled on commit.
//! Either way a commit fully installs a new family map or leaves the
//! previous one intact.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::parser;
use crate::storage::Storage;

/// How the request body is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    /// Raw Prometheus text exposition
    Text,
    /// JSON array of exposition lines (`?format=json`)
    Json,
}

impl BodyFormat {
    /// Derive the format from the `format` query parameter
    pub fn from_query(format: Option<&str>) -> Self {
        match format {
            Some("json") => BodyFormat::Json,
            _ => BodyFormat::Text,
        }
    }
}

/// What a successful commit installed, for logging
#[derive(Debug, Clone, Copy)]
pub struct IngestOutcome {
    /// Families installed
    pub families: usize,
    /// Bytes fed to the parser
    pub bytes: usize,
    /// Chunks the payload arrived in
    pub chunks: u64,
}

/// Coordinates pushers against the parser, staging buffer, and live store
pub struct Ingestor {
    storage: Arc<Storage>,
    max_body_size: usize,
    default_ttl: Duration,
    overwrite_instance_id: bool,
}

impl Ingestor {
    /// Build a coordinator over the shared storage
    pub fn new(storage: Arc<Storage>, cfg: &IngestConfig) -> Self {
        Self {
            storage,
            max_body_size: cfg.max_body_size,
            default_ttl: cfg.transaction_ttl(),
            overwrite_instance_id: cfg.overwrite_instance_id,
        }
    }

    /// Ingest an entire payload in one request.
    pub fn single_shot(
        &self,
        instance_id: &str,
        body: Bytes,
        format: BodyFormat,
    ) -> Result<IngestOutcome, IngestError> {
        let text = self.read_body(body, format)?;

        let families = parser::parse_and_validate(&text[..], instance_id, self.overwrite_instance_id)?;
        let outcome = IngestOutcome {
            families: families.len(),
            bytes: text.len(),
            chunks: 1,
        };

        self.storage
            .update_ingested(instance_id, families, text.len(), 1);

        Ok(outcome)
    }

    /// Stage one chunk of a transaction.
    ///
    /// `seq_id` comes straight from the URL and must be a non-negative
    /// integer; everything else about the transaction is the staging
    /// buffer's business.
    pub fn chunk(
        &self,
        instance_id: &str,
        txn_hash: &str,
        seq_id: &str,
        body: Bytes,
        format: BodyFormat,
    ) -> Result<(), IngestError> {
        let seq: u64 = seq_id
            .parse()
            .map_err(|_| IngestError::BadSequence(seq_id.to_string()))?;

        let data = self.read_body(body, format)?;

        self.storage
            .append_to_staging(txn_hash, instance_id, seq, data, self.default_ttl)
    }

    /// Reassemble and commit a staged transaction.
    pub fn commit(&self, instance_id: &str, txn_hash: &str) -> Result<IngestOutcome, IngestError> {
        let txn = self
            .storage
            .retrieve_staging(txn_hash)
            .ok_or_else(|| IngestError::TxnNotFound(txn_hash.to_string()))?;

        let families =
            parser::parse_and_validate(&txn.data[..], instance_id, self.overwrite_instance_id)?;
        let outcome = IngestOutcome {
            families: families.len(),
            bytes: txn.total_bytes,
            chunks: txn.chunk_count as u64,
        };

        self.storage
            .update_ingested(instance_id, families, txn.total_bytes, outcome.chunks);

        Ok(outcome)
    }

    /// Enforce the body cap and apply the `format=json` translation.
    fn read_body(&self, body: Bytes, format: BodyFormat) -> Result<Bytes, IngestError> {
        if body.len() > self.max_body_size {
            return Err(IngestError::RequestTooLarge);
        }
        match format {
            BodyFormat::Text => Ok(body),
            BodyFormat::Json => Ok(Bytes::from(parser::json_array_to_text(&body)?)),
        }
    }
}
