//! Configuration for hosts of the catalog scan engine.
//!
//! A settings file carries the engine tuning ([`CatalogScanConfig`]) and,
//! optionally, the driver graph the host intends to register. Loading follows
//! a fixed precedence (see [`CatalogScanSettings::load_from_env`]) and
//! [`validate`] checks the result before a worker starts.
//!
//! [`CatalogScanConfig`]: catalog_scan_core::CatalogScanConfig

#![allow(missing_docs)]

pub mod loader;
pub mod registry;
pub mod telemetry;
pub mod validation;

pub use loader::{CatalogScanSettings, ConfigSource};
pub use registry::{DriverSpec, RegistrySpec};
pub use telemetry::init_tracing;
pub use validation::{ConfigGuardRailError, ConfigWarning, validate};
