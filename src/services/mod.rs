//! Background Services Module
//!
//! Long-running tasks that keep the gateway healthy: the staging garbage
//! collector and the poll workers. All of them implement the [`Service`]
//! trait and stop promptly when the shared shutdown channel fires.

pub mod framework;

pub use framework::{Service, ServiceError, ServiceManager, ServiceStatus};
