//! Catalog scan orchestration.
//!
//! Processing drivers consume an append-only catalog of package events. The
//! engine tracks a cursor per driver, starts scans over the window between a
//! driver's cursor and its slowest dependency, and fans every scan out into
//! page and leaf work carried by a message queue. All progress is persisted
//! in a table store with optimistic concurrency, so any number of workers can
//! share the queue and a redelivered message resumes where the last one
//! stopped.
//!
//! The entry points are [`CatalogScanService`] for starting and aborting
//! scans and [`ScanWorker`] for consuming the queue. Both are built from a
//! [`ScanContext`].

#![allow(missing_docs)]

pub mod bucket;
pub mod catalog;
pub mod config;
pub mod context;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod events;
pub mod lease;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod scan;
pub mod service;
pub mod storage;

pub use config::CatalogScanConfig;
pub use context::ScanContext;
pub use error::{CatalogScanError, Result};
pub use registry::{DriverMetadata, DriverName, DriverRegistry};
pub use runtime::{InProcScanEventBus, ScanWorker};
pub use service::{CatalogScanService, UpdateOutcome};
