//! Staging buffer for in-flight chunked uploads
//!
//! Chunks of one transaction arrive in any order under an opaque
//! caller-chosen `txn_hash`. The buffer holds them until commit, bounded
//! by `max_staging_size` bytes in total and by a per-transaction TTL.
//! Only one transaction may be in flight per instance; a new transaction
//! evicts any other transaction of the same instance.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::IngestError;

use super::Storage;

/// One in-flight chunked upload
#[derive(Debug)]
pub(crate) struct StagingItem {
    pub(crate) instance_id: String,
    pub(crate) chunks: HashMap<u64, Bytes>,
    pub(crate) expires_at: Instant,
    pub(crate) byte_size: usize,
}

/// All staged transactions plus the aggregate byte count
#[derive(Debug, Default)]
pub(crate) struct StagingState {
    pub(crate) store: HashMap<String, StagingItem>,
    pub(crate) size: usize,
}

/// A committed transaction pulled out of the staging buffer
#[derive(Debug)]
pub struct RetrievedTransaction {
    /// Chunks concatenated in ascending sequence order, with a newline
    /// injected between chunks where the earlier chunk lacked one
    pub data: Bytes,
    /// Number of chunks reassembled
    pub chunk_count: usize,
    /// Byte length of `data` (post-injection)
    pub total_bytes: usize,
}

impl Storage {
    /// Append one chunk to a transaction, creating the transaction if
    /// needed.
    ///
    /// A transaction found expired is discarded and restarted. On
    /// creation, every other live transaction of the same instance is
    /// evicted and the TTL becomes `max(default_ttl, scrape interval of
    /// the instance)`. `expires_at` is set on creation only; later chunks
    /// do not refresh it. Admission is gated on the aggregate staging
    /// size: a chunk that would push it past the ceiling fails with
    /// [`IngestError::StagingFull`] and changes nothing.
    pub fn append_to_staging(
        &self,
        txn_hash: &str,
        instance_id: &str,
        seq_id: u64,
        data: Bytes,
        default_ttl: Duration,
    ) -> Result<(), IngestError> {
        let mut guard = self.staging().lock();
        let staging = &mut *guard;
        let now = Instant::now();

        // An expired transaction under this hash starts over
        if staging
            .store
            .get(txn_hash)
            .is_some_and(|item| now > item.expires_at)
        {
            if let Some(item) = staging.store.remove(txn_hash) {
                staging.size -= item.byte_size;
            }
        }

        if !staging.store.contains_key(txn_hash) {
            // Single in-flight transaction per instance
            let doomed: Vec<String> = staging
                .store
                .iter()
                .filter(|(_, item)| item.instance_id == instance_id)
                .map(|(hash, _)| hash.clone())
                .collect();
            for hash in doomed {
                if let Some(item) = staging.store.remove(&hash) {
                    staging.size -= item.byte_size;
                    tracing::trace!(txn = %hash, instance_id, "evicted stale transaction");
                }
            }

            // Slow pushers on slow scrape cycles get a wider window
            let mut ttl = default_ttl;
            let interval = self.scrape_interval_of(instance_id);
            if interval > 0.0 {
                let scrape_ttl = Duration::from_secs_f64(interval);
                if scrape_ttl > ttl {
                    ttl = scrape_ttl;
                }
            }

            if staging.size + data.len() > self.max_staging_size() {
                return Err(IngestError::StagingFull);
            }

            staging.size += data.len();
            let byte_size = data.len();
            let mut chunks = HashMap::new();
            chunks.insert(seq_id, data);
            staging.store.insert(
                txn_hash.to_string(),
                StagingItem {
                    instance_id: instance_id.to_string(),
                    chunks,
                    expires_at: now + ttl,
                    byte_size,
                },
            );
            return Ok(());
        }

        if let Some(item) = staging.store.get_mut(txn_hash) {
            // A repeated sequence number overwrites its earlier bytes
            let overwritten = item.chunks.get(&seq_id).map(|b| b.len()).unwrap_or(0);
            let prospective = staging.size - overwritten + data.len();
            if prospective > self.max_staging_size() {
                return Err(IngestError::StagingFull);
            }

            item.byte_size = item.byte_size - overwritten + data.len();
            item.chunks.insert(seq_id, data);
            staging.size = prospective;
        }

        Ok(())
    }

    /// Remove a transaction and reassemble its chunks.
    ///
    /// Returns `None` for an unknown, expired, or empty transaction; in
    /// every case the transaction is gone from the buffer afterwards.
    pub fn retrieve_staging(&self, txn_hash: &str) -> Option<RetrievedTransaction> {
        let mut guard = self.staging().lock();
        let staging = &mut *guard;

        let item = staging.store.remove(txn_hash)?;
        staging.size -= item.byte_size;
        drop(guard);

        if Instant::now() > item.expires_at || item.chunks.is_empty() {
            return None;
        }

        let mut keys: Vec<u64> = item.chunks.keys().copied().collect();
        keys.sort_unstable();

        let mut data = Vec::with_capacity(item.byte_size + keys.len());
        let last = *keys.last()?;
        for key in &keys {
            let chunk = &item.chunks[key];
            data.extend_from_slice(chunk);
            if *key != last && !chunk.is_empty() && chunk[chunk.len() - 1] != b'\n' {
                data.push(b'\n');
            }
        }

        let total_bytes = data.len();
        Some(RetrievedTransaction {
            data: Bytes::from(data),
            chunk_count: keys.len(),
            total_bytes,
        })
    }

    /// Remove all transactions expired as of `now`, crediting each to its
    /// instance's `expired_transactions` counter. Returns the removed
    /// count.
    pub fn sweep_staging(&self, now: Instant) -> usize {
        let mut guard = self.staging().lock();
        let staging = &mut *guard;

        let doomed: Vec<String> = staging
            .store
            .iter()
            .filter(|(_, item)| now > item.expires_at)
            .map(|(hash, _)| hash.clone())
            .collect();

        if doomed.is_empty() {
            return 0;
        }

        let mut expired_by_instance: HashMap<String, u64> = HashMap::new();
        for hash in &doomed {
            if let Some(item) = staging.store.remove(hash) {
                staging.size -= item.byte_size;
                *expired_by_instance
                    .entry(item.instance_id.clone())
                    .or_default() += 1;
                tracing::trace!(txn = %hash, instance_id = %item.instance_id, "dropped expired transaction");
            }
        }

        // Lock order: staging is held, live is taken second
        self.credit_expired(&expired_by_instance);

        doomed.len()
    }

    /// Current aggregate size of the staging buffer in bytes
    pub fn staging_size(&self) -> usize {
        self.staging().lock().size
    }

    #[cfg(test)]
    pub(crate) fn staging_item_sizes(&self) -> Vec<usize> {
        self.staging()
            .lock()
            .store
            .values()
            .map(|item| item.byte_size)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn staging_txn_count(&self) -> usize {
        self.staging().lock().store.len()
    }
}
