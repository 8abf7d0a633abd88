//! Live and staging metrics state
//!
//! The [`Storage`] is the single shared root for everything the gateway
//! knows: per-instance latest-value snapshots from four sources, plus the
//! staging buffer for in-flight chunked uploads. Two locks protect it: a
//! read-preferring `live` lock over instance states and an exclusive
//! `staging` lock over the chunk buffer. When both are needed the staging
//! lock is taken first; no caller holds the live lock while requesting the
//! staging lock.
//!
//! Family maps are immutable from the moment they are installed. Writers
//! replace the `Arc`, never the contents, which is what makes the shallow
//! [`Storage::snapshot`] safe to read while writers keep going.

mod gc;
mod staging;

pub use gc::StagingGc;
pub use staging::RetrievedTransaction;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};

use crate::types::{
    FamilyMap, MetricFamily, MetricKind, DEFAULT_SCRAPE_INTERVAL, SCRAPE_INTERVAL_FAMILY,
    STATUS_FAMILY,
};

use staging::StagingState;

/// Technical statistics about data ingestion for one instance
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    /// Instant of the last successful ingest, `None` until the first
    pub last_ingest: Option<SystemTime>,
    /// Total bytes received via the ingest API
    pub total_bytes: u64,
    /// Total chunks received via the ingest API
    pub total_chunks: u64,
    /// Chunked transactions dropped by TTL expiration
    pub expired_transactions: u64,
}

/// Latest known state of one game server instance
///
/// Created lazily on first write and never destroyed. Each source field is
/// replaced wholesale by its owning component.
#[derive(Debug, Clone, Default)]
pub struct InstanceState {
    /// Instant of the most recent successful ingest commit
    pub last_ingest_update: Option<SystemTime>,
    /// Families from the most recent ingest commit
    pub ingested_families: Option<Arc<FamilyMap>>,
    /// Most recently seen status family, kept across updates so the
    /// collector can synthesize a down signal after ingest goes stale
    pub cached_status_family: Option<Arc<MetricFamily>>,
    /// Families from the generic poll sideband
    pub polled_families: Option<Arc<FamilyMap>>,
    /// Families from the A2S poll worker
    pub a2s_families: Option<Arc<FamilyMap>>,
    /// Families from the RCon poll worker
    pub rcon_families: Option<Arc<FamilyMap>>,
    /// Ingest bookkeeping counters
    pub ingest_stats: IngestStats,
    /// Scrape interval the pusher reported, 0 until the first ingest
    pub scrape_interval: f64,
}

/// Shared live + staging metrics state
pub struct Storage {
    live: RwLock<HashMap<String, InstanceState>>,
    staging: Mutex<StagingState>,
    max_staging_size: usize,
}

impl Storage {
    /// Create a storage with the given staging-buffer ceiling in bytes
    pub fn new(max_staging_size: usize) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            staging: Mutex::new(StagingState::default()),
            max_staging_size,
        }
    }

    /// Install the families received from a pusher.
    ///
    /// Replaces `ingested_families` atomically, refreshes the ingest
    /// bookkeeping, picks up the advertised scrape interval, and retains
    /// the status family for the staleness-collapse path.
    pub fn update_ingested(
        &self,
        instance_id: &str,
        families: FamilyMap,
        bytes_added: usize,
        chunks_added: u64,
    ) {
        let interval = families
            .get(SCRAPE_INTERVAL_FAMILY)
            .filter(|f| f.kind == MetricKind::Gauge)
            .and_then(|f| f.first_value());

        let cached_status = families.get(STATUS_FAMILY).cloned().map(Arc::new);
        let families = Arc::new(families);
        let now = SystemTime::now();

        let mut live = self.live.write();
        let state = live.entry(instance_id.to_string()).or_default();

        state.ingested_families = Some(families);
        state.last_ingest_update = Some(now);
        state.ingest_stats.last_ingest = Some(now);
        state.ingest_stats.total_bytes += bytes_added as u64;
        state.ingest_stats.total_chunks += chunks_added;

        match interval {
            Some(v) => state.scrape_interval = v,
            None if state.scrape_interval == 0.0 => {
                state.scrape_interval = DEFAULT_SCRAPE_INTERVAL
            }
            None => {}
        }

        if let Some(status) = cached_status {
            state.cached_status_family = Some(status);
        }
    }

    /// Replace the generic poll sideband for an instance
    pub fn update_polled(&self, instance_id: &str, families: FamilyMap) {
        let mut live = self.live.write();
        let state = live.entry(instance_id.to_string()).or_default();
        state.polled_families = Some(Arc::new(families));
    }

    /// Replace the A2S sideband for an instance
    pub fn update_a2s(&self, instance_id: &str, families: FamilyMap) {
        let mut live = self.live.write();
        let state = live.entry(instance_id.to_string()).or_default();
        state.a2s_families = Some(Arc::new(families));
    }

    /// Replace the RCon sideband for an instance
    pub fn update_rcon(&self, instance_id: &str, families: FamilyMap) {
        let mut live = self.live.write();
        let state = live.entry(instance_id.to_string()).or_default();
        state.rcon_families = Some(Arc::new(families));
    }

    /// Shallow copy of all instance states, safe to read while writers
    /// keep replacing family references.
    pub fn snapshot(&self) -> HashMap<String, InstanceState> {
        self.live.read().clone()
    }

    /// Read one field of the live store without a full snapshot.
    /// Used by the staging buffer's dynamic-TTL lookup.
    pub(crate) fn scrape_interval_of(&self, instance_id: &str) -> f64 {
        self.live
            .read()
            .get(instance_id)
            .map(|s| s.scrape_interval)
            .unwrap_or(0.0)
    }

    /// Credit expired transactions to their instances. Called by the
    /// staging sweep with the staging lock already held.
    pub(crate) fn credit_expired(&self, expired_by_instance: &HashMap<String, u64>) {
        let mut live = self.live.write();
        for (instance_id, count) in expired_by_instance {
            let state = live.entry(instance_id.clone()).or_default();
            state.ingest_stats.expired_transactions += count;
        }
    }

    pub(crate) fn staging(&self) -> &Mutex<StagingState> {
        &self.staging
    }

    pub(crate) fn max_staging_size(&self) -> usize {
        self.max_staging_size
    }
}
