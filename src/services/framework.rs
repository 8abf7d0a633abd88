//! Service lifecycle framework
//!
//! A small contract shared by every background task: run until the
//! shutdown broadcast fires, report a status, and let the manager join
//! the task on the way out.

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Errors a background service can fail with
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The service's periodic work failed fatally
    #[error("service failed: {0}")]
    Failed(String),
}

/// Lifecycle state of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Not started or already finished
    Stopped,
    /// Select loop is running
    Running,
}

/// A long-running background task with cooperative shutdown
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until completion or until `shutdown` fires.
    ///
    /// Implementations are expected to `tokio::select!` between their
    /// periodic work and `shutdown.recv()` and to return promptly once
    /// the signal arrives.
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Current lifecycle state
    fn status(&self) -> ServiceStatus;
}

/// Spawns services and coordinates their shutdown
pub struct ServiceManager {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ServiceManager {
    /// Create a manager with its own shutdown channel
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// A receiver for tasks that are not full [`Service`]s
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a service onto the runtime
    pub fn spawn(&self, service: std::sync::Arc<dyn Service>) {
        let shutdown = self.shutdown_tx.subscribe();
        let name = service.name();
        let handle = tokio::spawn(async move {
            if let Err(e) = service.start(shutdown).await {
                tracing::error!(error = %e, service = name, "Background service failed");
            }
        });
        self.handles.lock().push((name, handle));
    }

    /// Signal shutdown and wait for every spawned service to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles = std::mem::take(&mut *self.handles.lock());
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, service = name, "Service task join failed");
            }
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
