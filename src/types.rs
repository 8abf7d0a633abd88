//! Core data types used throughout the gateway

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

/// Label every sample must carry to be attributable to a game server.
pub const INSTANCE_ID_LABEL: &str = "instance_id";

/// Family whose samples are retained across updates for the staleness-collapse path.
pub const STATUS_FAMILY: &str = "dayz_metricz_status";

/// Family that advertises the pusher's own scrape interval.
pub const SCRAPE_INTERVAL_FAMILY: &str = "dayz_metricz_scrape_interval_seconds";

/// Family whose samples get a derived `buid` label from `steam_id`.
pub const PLAYER_LOADED_FAMILY: &str = "dayz_metricz_player_loaded";

/// Scrape interval assumed until an instance reports its own.
pub const DEFAULT_SCRAPE_INTERVAL: f64 = 60.0;

/// Mapping family-name -> family, the unit of installation into the live store.
pub type FamilyMap = HashMap<String, MetricFamily>;

/// Metric family type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    /// Point-in-time value
    Gauge,
    /// Monotonically increasing value
    Counter,
    /// Declared with an unsupported or missing TYPE line
    Untyped,
}

impl MetricKind {
    /// Parse a `# TYPE` token. Unknown types collapse to `Untyped`.
    pub fn from_type_token(token: &str) -> Self {
        match token {
            "gauge" => MetricKind::Gauge,
            "counter" => MetricKind::Counter,
            _ => MetricKind::Untyped,
        }
    }

    /// Exposition-format type token
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
            MetricKind::Untyped => "untyped",
        }
    }

    /// Whether the scrape path emits samples of this kind
    pub fn is_exportable(&self) -> bool {
        matches!(self, MetricKind::Gauge | MetricKind::Counter)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single sample: an ordered label set and a floating-point value
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// (name, value) pairs, kept sorted by name
    pub labels: Vec<(String, String)>,
    /// Sample value
    pub value: f64,
}

impl Sample {
    /// Create a sample with no labels
    pub fn new(value: f64) -> Self {
        Self {
            labels: Vec::new(),
            value,
        }
    }

    /// Builder-style label append
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((name.into(), value.into()));
        self
    }

    /// Look up a label value by name
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Sort labels lexicographically by name, ascending
    pub fn sort_labels(&mut self) {
        self.labels.sort_by(|a, b| a.0.cmp(&b.0));
    }

    /// 64-bit fingerprint over the label set.
    ///
    /// Hashes `name NUL value NUL` in stored order, so callers must sort
    /// labels first for `{a=1,b=2}` and `{b=2,a=1}` to collide.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for (name, value) in &self.labels {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(value.as_bytes());
            hasher.update(&[0]);
        }
        hasher.digest()
    }
}

/// A named, typed collection of samples
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    /// Family name
    pub name: String,
    /// HELP text, empty if the stream had none
    pub help: String,
    /// Family type
    pub kind: MetricKind,
    /// Samples, unique per sorted-label fingerprint
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    /// Create an empty family
    pub fn new(name: impl Into<String>, help: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            samples: Vec::new(),
        }
    }

    /// Append a sample
    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// First sample's value, if any. Used for single-valued advisory
    /// families like the scrape interval.
    pub fn first_value(&self) -> Option<f64> {
        self.samples.first().map(|s| s.value)
    }
}
