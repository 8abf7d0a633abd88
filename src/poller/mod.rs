//! Poll workers for external query sources
//!
//! One worker per configured `(instance, source)` pair pulls server
//! metadata on its own ticker and installs the result into the live
//! store, up or down. The wire codecs live behind the [`A2sProbe`] and
//! [`RconConnector`] seams; the workers own the scheduling, deadlines,
//! family conversion, and the RCon reconnect discipline.

pub mod a2s;
pub mod net;
pub mod rcon;

pub use a2s::{A2sProbe, A2sWorker};
pub use rcon::{RconConnection, RconConnector, RconWorker};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::ServerDefinition;
use crate::services::ServiceManager;
use crate::storage::Storage;
use crate::types::{FamilyMap, MetricFamily, MetricKind, Sample, INSTANCE_ID_LABEL};

/// Errors a poll operation can fail with
#[derive(Error, Debug)]
pub enum PollError {
    /// Network failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The per-operation deadline elapsed
    #[error("operation timed out")]
    Timeout,

    /// The remote spoke something unexpected
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The RCon login handshake was rejected
    #[error("login failed: {0}")]
    Login(String),
}

/// Parsed A2S server info, as returned by the probe seam
#[derive(Debug, Clone, Default)]
pub struct A2sInfo {
    /// Server display name
    pub name: String,
    /// Game description
    pub game: String,
    /// Current world/map
    pub map: String,
    /// Server version string
    pub version: String,
    /// Players currently connected
    pub players: u8,
    /// Player slot count
    pub max_players: u8,
    /// Players waiting in queue
    pub queue: u32,
    /// Round-trip time of the info query
    pub ping: Duration,
    /// Game port advertised by the server
    pub port: u16,
    /// Server environment (l/w/m)
    pub environment: char,
}

/// One row of a parsed RCon `players` response
#[derive(Debug, Clone, Default)]
pub struct RconPlayer {
    /// BattlEye identifier
    pub guid: String,
    /// Display name
    pub name: String,
    /// Remote address without port
    pub ip: String,
    /// Latency in milliseconds
    pub ping: u32,
    /// Still in lobby (loading or queued)
    pub lobby: bool,
}

/// Append an `instance_id`-labeled gauge sample, creating the family on
/// first use.
pub(crate) fn add_gauge(
    families: &mut FamilyMap,
    name: &str,
    help: &str,
    value: f64,
    instance_id: &str,
) {
    add_gauge_with_labels(
        families,
        name,
        help,
        value,
        vec![(INSTANCE_ID_LABEL.to_string(), instance_id.to_string())],
    );
}

/// Append a gauge sample with an arbitrary label set (sorted on insert)
pub(crate) fn add_gauge_with_labels(
    families: &mut FamilyMap,
    name: &str,
    help: &str,
    value: f64,
    labels: Vec<(String, String)>,
) {
    let mut sample = Sample { labels, value };
    sample.sort_labels();

    families
        .entry(name.to_string())
        .or_insert_with(|| MetricFamily::new(name, help, MetricKind::Gauge))
        .push(sample);
}

/// Spawns the configured poll workers onto a service manager
pub struct PollerManager {
    storage: Arc<Storage>,
    servers: Vec<ServerDefinition>,
}

impl PollerManager {
    /// Create a manager for the configured servers
    pub fn new(storage: Arc<Storage>, servers: Vec<ServerDefinition>) -> Self {
        Self { storage, servers }
    }

    /// Spawn one worker per configured source
    pub fn start(&self, services: &ServiceManager) {
        for srv in &self.servers {
            if let Some(a2s_cfg) = srv.a2s.as_ref().filter(|c| !c.address.is_empty()) {
                tracing::info!(
                    instance_id = %srv.instance_id,
                    address = %a2s_cfg.address,
                    "Starting A2S poller"
                );
                let probe = net::UdpA2sProbe::new(
                    a2s_cfg.address.clone(),
                    a2s_cfg.deadline(),
                    a2s_cfg.buffer_size,
                );
                services.spawn(Arc::new(A2sWorker::new(
                    self.storage.clone(),
                    srv.instance_id.clone(),
                    a2s_cfg.clone(),
                    probe,
                )));
            }

            if let Some(rcon_cfg) = srv.rcon.as_ref().filter(|c| !c.address.is_empty()) {
                tracing::info!(
                    instance_id = %srv.instance_id,
                    address = %rcon_cfg.address,
                    "Starting RCon poller"
                );
                let connector = net::TcpRconConnector::new(rcon_cfg.clone());
                services.spawn(Arc::new(RconWorker::new(
                    self.storage.clone(),
                    srv.instance_id.clone(),
                    rcon_cfg.clone(),
                    connector,
                )));
            }
        }
    }
}
