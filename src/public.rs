//! Public status projector
//!
//! Filters the live store down to the JSON view anyone may see: an
//! allow-list of family values (summed across samples) and an allow-list
//! of family label sets with a deny-list of label keys. Responses are
//! cached briefly so a popular status page cannot stampede the store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::PublicExportConfig;
use crate::storage::{InstanceState, Storage};
use crate::types::FamilyMap;

/// Whether a response came from the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Served unchanged from the cache
    Hit,
    /// Recomputed on demand
    Miss,
}

impl CacheState {
    /// Value for the `X-Cache` response header
    pub fn header_value(&self) -> &'static str {
        match self {
            CacheState::Hit => "HIT",
            CacheState::Miss => "MISS",
        }
    }
}

/// The public view of one instance
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PublicStatusData {
    /// Family name -> sum of its sample values
    pub values: BTreeMap<String, f64>,
    /// Family name -> label name -> sorted unique label values
    pub labels: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

struct CacheEntry {
    body: String,
    expires_at: Instant,
}

/// Projects the live store into cached public JSON responses
pub struct PublicProjector {
    storage: Arc<Storage>,
    export: PublicExportConfig,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl PublicProjector {
    /// Build a projector with the configured allow/deny lists
    pub fn new(storage: Arc<Storage>, export: PublicExportConfig, cache_ttl: Duration) -> Self {
        Self {
            storage,
            export,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// JSON body for all instances, keyed by instance id
    pub fn status_all(&self) -> (String, CacheState) {
        if let Some(body) = self.cache_lookup("all") {
            return (body, CacheState::Hit);
        }

        let states = self.storage.snapshot();
        let view: BTreeMap<&String, PublicStatusData> = states
            .iter()
            .map(|(id, state)| (id, self.project(state)))
            .collect();

        let body = serde_json::to_string(&view).unwrap_or_else(|_| "{}".to_string());
        self.cache_store("all", &body);
        (body, CacheState::Miss)
    }

    /// JSON body for one instance, or `None` when it is unknown
    pub fn status_single(&self, instance_id: &str) -> Option<(String, CacheState)> {
        if let Some(body) = self.cache_lookup(instance_id) {
            return Some((body, CacheState::Hit));
        }

        let states = self.storage.snapshot();
        let state = states.get(instance_id)?;

        let data = self.project(state);
        let body = serde_json::to_string(&data).unwrap_or_else(|_| "{}".to_string());
        self.cache_store(instance_id, &body);
        Some((body, CacheState::Miss))
    }

    fn cache_lookup(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock();
        let entry = cache.get(key)?;
        if Instant::now() < entry.expires_at {
            Some(entry.body.clone())
        } else {
            None
        }
    }

    fn cache_store(&self, key: &str, body: &str) {
        self.cache.lock().insert(
            key.to_string(),
            CacheEntry {
                body: body.to_string(),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
    }

    /// Project one instance through the allow/deny lists.
    ///
    /// Sources are processed in precedence order; a later source's family
    /// replaces an earlier one's entry of the same name. When no ingested
    /// families exist, the cached status family stands in for them.
    fn project(&self, state: &InstanceState) -> PublicStatusData {
        let mut out = PublicStatusData::default();

        for source in [
            &state.polled_families,
            &state.a2s_families,
            &state.rcon_families,
        ]
        .into_iter()
        .flatten()
        {
            self.project_families(&mut out, source);
        }

        if let Some(ingested) = &state.ingested_families {
            self.project_families(&mut out, ingested);
        } else if let Some(status) = &state.cached_status_family {
            let mut synthetic = FamilyMap::new();
            synthetic.insert(status.name.clone(), (**status).clone());
            self.project_families(&mut out, &synthetic);
        }

        out
    }

    fn project_families(&self, out: &mut PublicStatusData, families: &FamilyMap) {
        for (name, family) in families {
            if family.samples.is_empty() {
                continue;
            }

            if self.export.values.iter().any(|v| v == name) {
                let sum = if family.kind.is_exportable() {
                    family.samples.iter().map(|s| s.value).sum()
                } else {
                    0.0
                };
                out.values.insert(name.clone(), sum);
            }

            if self.export.labels.iter().any(|l| l == name) {
                let mut sets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
                for sample in &family.samples {
                    for (label, value) in &sample.labels {
                        if label.is_empty()
                            || self.export.labels_exclude.iter().any(|e| e == label)
                        {
                            continue;
                        }
                        sets.entry(label.clone()).or_default().insert(value.clone());
                    }
                }

                let kv: BTreeMap<String, Vec<String>> = sets
                    .into_iter()
                    .map(|(label, values)| (label, values.into_iter().collect()))
                    .collect();
                out.labels.insert(name.clone(), kv);
            }
        }
    }
}
