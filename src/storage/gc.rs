//! Staging garbage collector
//!
//! Periodically sweeps expired staging transactions so abandoned chunked
//! uploads release their memory and show up in the per-instance
//! `expired_transactions` counter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::services::{Service, ServiceError, ServiceStatus};

use super::Storage;

/// Background service sweeping the staging buffer
pub struct StagingGc {
    storage: Arc<Storage>,
    period: Duration,
    status: RwLock<ServiceStatus>,
}

impl StagingGc {
    /// Create a collector sweeping every `period`
    pub fn new(storage: Arc<Storage>, period: Duration) -> Self {
        Self {
            storage,
            period,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }
}

#[async_trait::async_trait]
impl Service for StagingGc {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::info!(
            interval_secs = self.period.as_secs(),
            "Staging garbage collector started"
        );

        let mut tick = interval(self.period);
        // The first tick of a tokio interval fires immediately
        tick.tick().await;

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Staging garbage collector received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Staging garbage collector receiver lagged");
                        }
                    }
                }

                _ = tick.tick() => {
                    let removed = self.storage.sweep_staging(Instant::now());
                    if removed > 0 {
                        tracing::info!(
                            expired_transactions = removed,
                            "Cleaned up expired staging transactions"
                        );
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Staging garbage collector stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "staging_gc"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
