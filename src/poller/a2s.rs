//! A2S poll worker
//!
//! Queries the Steam server-info endpoint on a ticker and converts the
//! result into the A2S family set, including an explicit `up` gauge so a
//! dead server is visible rather than absent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::config::A2sConfig;
use crate::services::{Service, ServiceError, ServiceStatus};
use crate::storage::Storage;
use crate::types::FamilyMap;

use super::{add_gauge, add_gauge_with_labels, A2sInfo, PollError};

/// Seam for the A2S wire codec
#[async_trait::async_trait]
pub trait A2sProbe: Send + Sync {
    /// Perform one INFO query
    async fn probe(&self) -> Result<A2sInfo, PollError>;
}

/// Ticker-driven A2S puller for one instance
pub struct A2sWorker<P> {
    storage: Arc<Storage>,
    instance_id: String,
    cfg: A2sConfig,
    probe: P,
    status: RwLock<ServiceStatus>,
}

impl<P: A2sProbe> A2sWorker<P> {
    /// Create a worker polling `probe` at the configured interval
    pub fn new(storage: Arc<Storage>, instance_id: String, cfg: A2sConfig, probe: P) -> Self {
        Self {
            storage,
            instance_id,
            cfg,
            probe,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    /// Poll once under the per-operation deadline and install the result,
    /// up or down.
    async fn poll_once(&self) {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.cfg.deadline(), self.probe.probe()).await {
            Ok(inner) => inner,
            Err(_) => Err(PollError::Timeout),
        };

        let info = match result {
            Ok(info) => {
                tracing::debug!(
                    instance_id = %self.instance_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    server_name = %info.name,
                    players = info.players,
                    "A2S poll collected"
                );
                Some(info)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    instance_id = %self.instance_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "A2S poll failed"
                );
                None
            }
        };

        let families = a2s_families(&self.instance_id, &self.cfg.address, info.as_ref());
        self.storage.update_a2s(&self.instance_id, families);
    }
}

#[async_trait::async_trait]
impl<P: A2sProbe + 'static> Service for A2sWorker<P> {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        let mut tick = interval(self.cfg.poll_interval());

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }

                _ = tick.tick() => {
                    self.poll_once().await;
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "a2s_poller"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

/// Convert a poll result into the A2S family set.
///
/// `None` means the poll failed: the availability gauge goes to 0 and the
/// numeric gauges are published at zero, while the metadata family is
/// withheld.
pub fn a2s_families(instance_id: &str, query_address: &str, info: Option<&A2sInfo>) -> FamilyMap {
    let mut families = FamilyMap::new();

    let mut up = 0.0;
    let mut ping = 0.0;
    let mut players = 0.0;
    let mut slots = 0.0;
    let mut queue = 0.0;

    if let Some(info) = info {
        up = 1.0;
        ping = info.ping.as_secs_f64();
        players = f64::from(info.players);
        slots = f64::from(info.max_players);
        queue = f64::from(info.queue);

        let host = query_address.split(':').next().unwrap_or(query_address);
        add_gauge_with_labels(
            &mut families,
            "metricz_a2s_info",
            "Static metadata about the game server.",
            1.0,
            vec![
                ("instance_id".to_string(), instance_id.to_string()),
                ("server_name".to_string(), info.name.clone()),
                ("server_description".to_string(), info.game.clone()),
                ("world".to_string(), info.map.clone()),
                ("version".to_string(), info.version.clone()),
                ("query_address".to_string(), query_address.to_string()),
                ("game_address".to_string(), format!("{}:{}", host, info.port)),
                ("environment".to_string(), environment_name(info.environment)),
            ],
        );
    }

    add_gauge(
        &mut families,
        "metricz_a2s_up",
        "A2S server availability (1 = up, 0 = down).",
        up,
        instance_id,
    );
    add_gauge(
        &mut families,
        "metricz_a2s_info_response_time_seconds",
        "Server A2S_INFO response time.",
        ping,
        instance_id,
    );
    add_gauge(
        &mut families,
        "metricz_a2s_info_players_online",
        "Online players.",
        players,
        instance_id,
    );
    add_gauge(
        &mut families,
        "metricz_a2s_info_players_slots",
        "Players slots count.",
        slots,
        instance_id,
    );
    add_gauge(
        &mut families,
        "metricz_a2s_info_players_queue",
        "Players wait in queue.",
        queue,
        instance_id,
    );

    families
}

fn environment_name(env: char) -> String {
    match env {
        'l' => "Linux".to_string(),
        'w' => "Windows".to_string(),
        'm' | 'o' => "Mac".to_string(),
        other => other.to_string(),
    }
}
