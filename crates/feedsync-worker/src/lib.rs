//! # feedsync-worker
//!
//! Long-running feedsync jobs.
//!
//! - **feed2catalog**: copies gallery feed changes into the catalog
//! - **catalog2search**: publishes catalog commits to the search indexes
//! - **monitor**: validates packages named by the monitoring queue
//!
//! Each job runs on an interval behind a [`Runner`], which publishes its
//! progress to the health endpoints.
//!
//! ## Health Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - Readiness with last successful run
//! - `GET /metrics` - Prometheus metrics
//!
//! ## Usage
//!
//! ```bash
//! # Run as service
//! feedsync-worker feed2catalog --gallery https://gallery.example --port 8081
//!
//! # Drain once and exit
//! feedsync-worker catalog2search --once
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod monitoring;
pub mod runner;

pub use config::{Cli, Command, ServiceArgs};
pub use error::{Result, SyncError};
pub use monitoring::{
    CatalogEntry, CatalogLeafValidator, MonitoringProcessor, PackageMonitoringStatus,
    PackageState, PackageValidator, PackageValidatorContext, ProcessSummary, QueueConsumer,
    QueueMessage, StatusStore, StorageQueue, ValidationResult,
};
pub use runner::{Job, Runner, RunnerConfig, RunnerState, report_lag};
