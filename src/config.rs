//! Gateway configuration
//!
//! Loaded from a JSON file, with every field defaulted so an empty file (or
//! no file) yields a runnable gateway. Validation catches the logical
//! errors a file can express: duplicate or empty instance ids and sources
//! configured without an address or password.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Root configuration object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP address the HTTP server listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Ingest limits and behavior
    pub ingest: IngestConfig,

    /// Public /status endpoint behavior
    pub public: PublicConfig,

    /// Staleness detection thresholds
    pub stale: StaleConfig,

    /// What /status exports and how it filters labels
    pub public_export: PublicExportConfig,

    /// Monitored/ingested instances
    pub servers: Vec<ServerDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            ingest: IngestConfig::default(),
            public: PublicConfig::default(),
            stale: StaleConfig::default(),
            public_export: PublicExportConfig::default(),
            servers: Vec::new(),
        }
    }
}

/// Ingest request lifecycle and safety limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Max HTTP request body in bytes (hard limit)
    pub max_body_size: usize,

    /// Max memory in bytes held by incomplete transactions
    pub max_staging_size: usize,

    /// TTL in seconds for incomplete chunked uploads
    pub transaction_ttl_secs: u64,

    /// How often expired transactions are swept, in seconds
    pub gc_interval_secs: u64,

    /// Allow the payload's instance_id label to be rewritten when it
    /// differs from the instance_id in the URL
    pub overwrite_instance_id: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_body_size: 4 * 1024 * 1024,
            max_staging_size: 64 * 1024 * 1024,
            transaction_ttl_secs: 15,
            gc_interval_secs: 60,
            overwrite_instance_id: false,
        }
    }
}

impl IngestConfig {
    /// TTL for incomplete chunked uploads
    pub fn transaction_ttl(&self) -> Duration {
        Duration::from_secs(self.transaction_ttl_secs)
    }

    /// Sweep period for the staging garbage collector
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

/// Public endpoint behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicConfig {
    /// Enable /status endpoints
    pub enabled: bool,

    /// TTL in seconds for cached /status responses
    pub cache_ttl_secs: u64,

    /// Send `Access-Control-Allow-Origin: *` on public JSON endpoints
    pub cors: bool,
}

impl Default for PublicConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_ttl_secs: 15,
            cors: false,
        }
    }
}

impl PublicConfig {
    /// TTL for cached public responses
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Staleness detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaleConfig {
    /// Multiplies the instance's scrape interval to decide "down"
    pub multiplier: f64,

    /// Lower bound in seconds for stale marking regardless of multiplier
    pub min_age_secs: u64,
}

impl Default for StaleConfig {
    fn default() -> Self {
        Self {
            multiplier: 2.0,
            min_age_secs: 30,
        }
    }
}

impl StaleConfig {
    /// Lower bound for stale marking
    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }
}

/// Allow/deny lists shaping the public /status output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicExportConfig {
    /// Family names whose summed values are included
    pub values: Vec<String>,

    /// Family names whose label sets are included
    pub labels: Vec<String>,

    /// Label keys removed from exported labels
    pub labels_exclude: Vec<String>,
}

impl Default for PublicExportConfig {
    fn default() -> Self {
        Self {
            values: vec![
                "dayz_metricz_status".to_string(),
                "metricz_a2s_info".to_string(),
            ],
            labels: vec![
                "dayz_metricz_status".to_string(),
                "metricz_a2s_info".to_string(),
            ],
            labels_exclude: vec![
                "steam_id".to_string(),
                "guid".to_string(),
                "buid".to_string(),
                "name".to_string(),
                "ip".to_string(),
                "city".to_string(),
                "country".to_string(),
            ],
        }
    }
}

/// One logical instance and its poll sources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDefinition {
    /// Stable logical id used in URLs and labels; unique and non-empty
    pub instance_id: String,

    /// Optional A2S polling source
    pub a2s: Option<A2sConfig>,

    /// Optional RCon polling source
    pub rcon: Option<RconConfig>,
}

/// A2S polling source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct A2sConfig {
    /// "host:port" of the A2S query endpoint
    pub address: String,

    /// Polling interval in seconds
    pub poll_interval_secs: u64,

    /// Per-request deadline in seconds
    pub deadline_secs: u64,

    /// UDP read buffer size
    pub buffer_size: u16,
}

impl Default for A2sConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            poll_interval_secs: 15,
            deadline_secs: 5,
            buffer_size: 1400,
        }
    }
}

impl A2sConfig {
    /// Polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Per-request deadline
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// RCon polling source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RconConfig {
    /// "host:port" of the RCon endpoint
    pub address: String,

    /// RCon password
    pub password: String,

    /// Polling interval in seconds
    pub poll_interval_secs: u64,

    /// Idle keepalive period in seconds
    pub keepalive_secs: u64,

    /// Per-operation deadline in seconds
    pub deadline_secs: u64,

    /// Read buffer for RCon packets
    pub buffer_size: u16,

    /// Number of login attempts on connect
    pub login_attempts: u32,
}

impl Default for RconConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            password: String::new(),
            poll_interval_secs: 15,
            keepalive_secs: 30,
            deadline_secs: 5,
            buffer_size: 1024,
            login_attempts: 1,
        }
    }
}

impl RconConfig {
    /// Polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Idle keepalive period
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Per-operation deadline
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8098".to_string()
}

impl Config {
    /// Load configuration from a JSON file and validate it.
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();

        let cfg = if path.exists() {
            let data = std::fs::read(path)?;
            serde_json::from_slice(&data)
                .map_err(|e| Error::Configuration(format!("failed to parse config file: {e}")))?
        } else {
            Self::default()
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check logical constraints the type system cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = std::collections::HashSet::new();

        for (i, srv) in self.servers.iter().enumerate() {
            if srv.instance_id.is_empty() {
                return Err(Error::Configuration(format!(
                    "server at index {i} has empty instance_id"
                )));
            }
            if !seen.insert(srv.instance_id.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate instance_id found: '{}'",
                    srv.instance_id
                )));
            }

            if let Some(a2s) = &srv.a2s {
                if a2s.address.is_empty() {
                    return Err(Error::Configuration(format!(
                        "instance '{}': a2s enabled but address is empty",
                        srv.instance_id
                    )));
                }
            }

            if let Some(rcon) = &srv.rcon {
                if rcon.address.is_empty() {
                    return Err(Error::Configuration(format!(
                        "instance '{}': rcon enabled but address is empty",
                        srv.instance_id
                    )));
                }
                if rcon.password.is_empty() {
                    return Err(Error::Configuration(format!(
                        "instance '{}': rcon enabled but password is empty",
                        srv.instance_id
                    )));
                }
            }
        }

        if self.stale.multiplier <= 0.0 {
            return Err(Error::Configuration(
                "stale.multiplier must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.ingest.max_body_size, 4 * 1024 * 1024);
        assert_eq!(cfg.ingest.max_staging_size, 64 * 1024 * 1024);
        assert_eq!(cfg.ingest.transaction_ttl(), Duration::from_secs(15));
        assert_eq!(cfg.ingest.gc_interval(), Duration::from_secs(60));
        assert!(!cfg.ingest.overwrite_instance_id);
        assert_eq!(cfg.stale.multiplier, 2.0);
        assert_eq!(cfg.stale.min_age(), Duration::from_secs(30));
        assert_eq!(cfg.public.cache_ttl(), Duration::from_secs(15));
        assert!(cfg
            .public_export
            .labels_exclude
            .contains(&"steam_id".to_string()));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"ingest": {"max_body_size": 1024}}"#).unwrap();
        assert_eq!(cfg.ingest.max_body_size, 1024);
        assert_eq!(cfg.ingest.transaction_ttl_secs, 15);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let cfg: Config = serde_json::from_str(
            r#"{"servers": [{"instance_id": "a"}, {"instance_id": "a"}]}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_instance_id() {
        let cfg: Config = serde_json::from_str(r#"{"servers": [{"instance_id": ""}]}"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_requires_rcon_password() {
        let cfg: Config = serde_json::from_str(
            r#"{"servers": [{"instance_id": "a", "rcon": {"address": "1.2.3.4:2306"}}]}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_full_server() {
        let cfg: Config = serde_json::from_str(
            r#"{"servers": [{
                "instance_id": "srv-a",
                "a2s": {"address": "1.2.3.4:27016"},
                "rcon": {"address": "1.2.3.4:2306", "password": "secret"}
            }]}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
        let a2s = cfg.servers[0].a2s.as_ref().unwrap();
        assert_eq!(a2s.poll_interval(), Duration::from_secs(15));
        assert_eq!(a2s.buffer_size, 1400);
    }
}
