//! RCon poll worker
//!
//! Keeps a persistent admin-channel session per instance and pulls the
//! player list on a ticker. A failed command closes the connection,
//! reconnects once, and retries once before giving up for the cycle; the
//! cycle's result is installed either way so `metricz_rcon_up` tracks
//! reality.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::interval;

use crate::config::RconConfig;
use crate::services::{Service, ServiceError, ServiceStatus};
use crate::storage::Storage;
use crate::types::FamilyMap;

use super::{add_gauge, add_gauge_with_labels, PollError, RconPlayer};

/// An established admin-channel connection
#[async_trait::async_trait]
pub trait RconConnection: Send {
    /// Run the `players` command and return the parsed rows
    async fn players(&mut self) -> Result<Vec<RconPlayer>, PollError>;

    /// Tear the connection down
    async fn close(&mut self);
}

/// Seam for dialing and logging into the admin channel
#[async_trait::async_trait]
pub trait RconConnector: Send + Sync {
    /// Concrete connection type produced by this connector
    type Conn: RconConnection;

    /// Dial, log in, and start keepalive
    async fn connect(&self) -> Result<Self::Conn, PollError>;
}

/// Persistent session with reconnect-once retry-once discipline
struct RconSession<C: RconConnector> {
    connector: C,
    conn: Option<C::Conn>,
    instance_id: String,
}

impl<C: RconConnector> RconSession<C> {
    fn new(connector: C, instance_id: String) -> Self {
        Self {
            connector,
            conn: None,
            instance_id,
        }
    }

    /// Run one poll cycle. Returns the parsed players on success; on any
    /// failure the caller still gets a family map via `rcon_families(None)`.
    async fn poll(&mut self) -> Result<Vec<RconPlayer>, PollError> {
        if self.conn.is_none() {
            tracing::trace!(instance_id = %self.instance_id, "Inactive RCon connection, connecting");
            match self.connector.connect().await {
                Ok(conn) => self.conn = Some(conn),
                Err(e) => return Err(e),
            }
        }

        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(PollError::Protocol("no connection".to_string())),
        };

        match conn.players().await {
            Ok(players) => Ok(players),
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    instance_id = %self.instance_id,
                    "RCon command failed, reconnecting"
                );
                self.close().await;

                let mut fresh = match self.connector.connect().await {
                    Ok(conn) => conn,
                    Err(conn_err) => {
                        tracing::warn!(
                            error = %conn_err,
                            instance_id = %self.instance_id,
                            "RCon reconnect failed"
                        );
                        return Err(conn_err);
                    }
                };

                match fresh.players().await {
                    Ok(players) => {
                        self.conn = Some(fresh);
                        Ok(players)
                    }
                    Err(retry_err) => {
                        tracing::warn!(
                            error = %retry_err,
                            instance_id = %self.instance_id,
                            "RCon command retry failed"
                        );
                        fresh.close().await;
                        Err(retry_err)
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            tracing::trace!(instance_id = %self.instance_id, "Closing RCon connection");
            conn.close().await;
        }
    }
}

/// Ticker-driven RCon puller for one instance
pub struct RconWorker<C: RconConnector> {
    storage: Arc<Storage>,
    instance_id: String,
    cfg: RconConfig,
    session: AsyncMutex<RconSession<C>>,
    status: RwLock<ServiceStatus>,
}

impl<C: RconConnector> RconWorker<C> {
    /// Create a worker owning its session
    pub fn new(storage: Arc<Storage>, instance_id: String, cfg: RconConfig, connector: C) -> Self {
        let session = RconSession::new(connector, instance_id.clone());
        Self {
            storage,
            instance_id,
            cfg,
            session: AsyncMutex::new(session),
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    /// Poll once under the per-operation deadline and install the result.
    async fn poll_once(&self) {
        let start = Instant::now();
        let mut session = self.session.lock().await;

        let result = match tokio::time::timeout(self.cfg.deadline(), session.poll()).await {
            Ok(inner) => inner,
            Err(_) => {
                // A hung command leaves the connection in an unknown state
                session.close().await;
                Err(PollError::Timeout)
            }
        };

        let players = match result {
            Ok(players) => {
                tracing::debug!(
                    instance_id = %self.instance_id,
                    players = players.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "RCon poll collected"
                );
                Some(players)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    instance_id = %self.instance_id,
                    "RCon poll failed"
                );
                None
            }
        };

        let families = rcon_families(&self.instance_id, players.as_deref());
        self.storage.update_rcon(&self.instance_id, families);
    }
}

#[async_trait::async_trait]
impl<C: RconConnector + 'static> Service for RconWorker<C> {
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

        self.session.lock().await.close().await;
        *self.status.write() = ServiceStatus::Stopped;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rcon_poller"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

/// Convert a poll result into the RCon family set.
///
/// The availability and population gauges exist whether the server is up
/// or not; per-player families only while it is.
pub fn rcon_families(instance_id: &str, players: Option<&[RconPlayer]>) -> FamilyMap {
    let mut families = FamilyMap::new();

    let mut up = 0.0;
    let mut total = 0.0;
    let mut in_lobby = 0.0;

    if let Some(players) = players {
        up = 1.0;
        total = players.len() as f64;

        for p in players {
            let joined = if p.lobby {
                in_lobby += 1.0;
                0.0
            } else {
                1.0
            };

            add_gauge_with_labels(
                &mut families,
                "metricz_rcon_player_joined",
                "Player joined to server (0=lobby, loading or in queue. 1=playing).",
                joined,
                vec![
                    ("instance_id".to_string(), instance_id.to_string()),
                    ("buid".to_string(), p.guid.clone()),
                    ("name".to_string(), p.name.clone()),
                    ("ip".to_string(), p.ip.clone()),
                ],
            );

            add_gauge_with_labels(
                &mut families,
                "metricz_rcon_player_ping_seconds",
                "Player latency.",
                f64::from(p.ping) / 1000.0,
                vec![
                    ("instance_id".to_string(), instance_id.to_string()),
                    ("buid".to_string(), p.guid.clone()),
                ],
            );
        }
    }

    add_gauge(
        &mut families,
        "metricz_rcon_up",
        "RCon availability.",
        up,
        instance_id,
    );
    add_gauge(
        &mut families,
        "metricz_rcon_players_total",
        "Total clients connected (including lobby).",
        total,
        instance_id,
    );
    add_gauge(
        &mut families,
        "metricz_rcon_players_lobby",
        "Players in lobby.",
        in_lobby,
        instance_id,
    );

    families
}
