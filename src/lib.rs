//! # metricz-gateway
//!
//! Metrics aggregation gateway for game-server instances. Remote agents
//! push Prometheus text exposition payloads, in one request or as numbered
//! chunks reassembled from a staging buffer; poll workers pull server
//! metadata over the A2S and RCon query channels; and the unified result
//! is published on a Prometheus scrape endpoint plus a filtered public
//! JSON status view.
//!
//! # Architecture
//!
//! ```text
//! pushers ──▶ Ingestor ──▶ (staging buffer | parser) ──▶ Storage
//! pollers ──▶ A2sWorker / RconWorker ────────────────▶ Storage
//! readers ◀── ScrapeExporter (/metrics), PublicProjector (/status)
//! ```
//!
//! The [`storage::Storage`] is the shared root: a read-preferring lock
//! over per-instance latest-value state and an exclusive lock over the
//! staging buffer. Family maps are immutable once installed; writers
//! replace references, which keeps snapshots cheap and safe.

pub mod config;
pub mod error;
pub mod ingest;
pub mod parser;
pub mod poller;
pub mod public;
pub mod scrape;
pub mod services;
pub mod storage;
pub mod types;

pub use error::{Error, IngestError, Result};
