//! Guard rails applied to loaded settings before a worker starts.

use std::fmt;

use catalog_scan_core::{CatalogScanError, DriverRegistry};
use thiserror::Error;

use crate::CatalogScanSettings;

/// Settings that would break scan processing.
#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("scan.leaf.max_attempts must be at least 1")]
    ZeroLeafAttempts,
    #[error("scan.worker.batch_size must be at least 1")]
    ZeroBatchSize,
    #[error("scan.worker.parallelism must be at least 1")]
    ZeroParallelism,
    #[error("scan.fan_out.requeue_take must be at least 1")]
    ZeroRequeueTake,
    #[error("scan.fan_out.enqueue_take must be at least 1")]
    ZeroEnqueueTake,
    #[error("scan.latest_scans_to_check must be at least 1")]
    ZeroLatestScansToCheck,
    #[error(
        "scan.bucketed_package_cursor {0} is neither an external cursor nor a driver"
    )]
    UnknownBucketCursor(String),
    #[error("driver registry is invalid: {0}")]
    Registry(#[from] CatalogScanError),
}

/// Settings that are legal but probably not intended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A disabled driver is not in the registry.
    UnknownDisabledDriver(String),
    /// The registry has drivers but no external cursor to bound them.
    NoExternalCursors,
    /// Leaf retries run back to back.
    NoLeafBackoff,
    /// Index requeue delays never grow.
    RequeueCapBelowFactor { factor_secs: u64, max_secs: u64 },
    /// Waiting out a leaf's backoff is capped below the redelivery delay.
    MaxWaitBelowTryAgainLater { max_wait_secs: u64, try_again_later_secs: u64 },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::UnknownDisabledDriver(name) => {
                write!(f, "disabled driver {name} is not registered")
            }
            ConfigWarning::NoExternalCursors => {
                f.write_str("registry declares drivers but no external cursor")
            }
            ConfigWarning::NoLeafBackoff => f.write_str(
                "scan.backoff.first_attempt_max_ms and increment_ms are both 0; leaf retries will not back off",
            ),
            ConfigWarning::RequeueCapBelowFactor {
                factor_secs,
                max_secs,
            } => write!(
                f,
                "scan.backoff.requeue_max_secs ({max_secs}) is below requeue_factor_secs ({factor_secs})"
            ),
            ConfigWarning::MaxWaitBelowTryAgainLater {
                max_wait_secs,
                try_again_later_secs,
            } => write!(
                f,
                "scan.leaf.max_wait_secs ({max_wait_secs}) is below try_again_later_secs ({try_again_later_secs})"
            ),
        }
    }
}

/// Check `settings` and build its registry. The registry is `None` when the
/// settings declare no drivers.
pub fn validate(
    settings: &CatalogScanSettings,
) -> Result<(Option<DriverRegistry>, Vec<ConfigWarning>), ConfigGuardRailError> {
    let scan = &settings.scan;
    if scan.leaf.max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroLeafAttempts);
    }
    if scan.worker.batch_size == 0 {
        return Err(ConfigGuardRailError::ZeroBatchSize);
    }
    if scan.worker.parallelism == 0 {
        return Err(ConfigGuardRailError::ZeroParallelism);
    }
    if scan.fan_out.requeue_take == 0 {
        return Err(ConfigGuardRailError::ZeroRequeueTake);
    }
    if scan.fan_out.enqueue_take == 0 {
        return Err(ConfigGuardRailError::ZeroEnqueueTake);
    }
    if scan.latest_scans_to_check == 0 {
        return Err(ConfigGuardRailError::ZeroLatestScansToCheck);
    }

    let mut warnings = Vec::new();
    if scan.backoff.first_attempt_max_ms == 0 && scan.backoff.increment_ms == 0 {
        warnings.push(ConfigWarning::NoLeafBackoff);
    }
    if scan.backoff.requeue_max_secs < scan.backoff.requeue_factor_secs {
        warnings.push(ConfigWarning::RequeueCapBelowFactor {
            factor_secs: scan.backoff.requeue_factor_secs,
            max_secs: scan.backoff.requeue_max_secs,
        });
    }
    if scan.leaf.max_wait_secs < scan.leaf.try_again_later_secs {
        warnings.push(ConfigWarning::MaxWaitBelowTryAgainLater {
            max_wait_secs: scan.leaf.max_wait_secs,
            try_again_later_secs: scan.leaf.try_again_later_secs,
        });
    }

    if settings.registry.is_empty() {
        return Ok((None, warnings));
    }

    let registry = settings.registry.build()?;
    if registry.external_cursors().next().is_none() {
        warnings.push(ConfigWarning::NoExternalCursors);
    }
    for name in &scan.disabled_drivers {
        if !registry.contains(name) {
            warnings.push(ConfigWarning::UnknownDisabledDriver(name.clone()));
        }
    }
    if let Some(cursor) = &scan.bucketed_package_cursor
        && !registry.contains(cursor)
        && !registry.is_external_cursor(cursor)
    {
        return Err(ConfigGuardRailError::UnknownBucketCursor(cursor.clone()));
    }

    Ok((Some(registry), warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(raw: &str) -> CatalogScanSettings {
        CatalogScanSettings::parse_from_str(raw, "test").unwrap()
    }

    #[test]
    fn defaults_pass_without_warnings() {
        let (registry, warnings) = validate(&CatalogScanSettings::default()).unwrap();
        assert!(registry.is_none());
        assert!(warnings.is_empty());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = validate(&settings("[scan.leaf]\nmax_attempts = 0\n")).unwrap_err();
        assert!(matches!(err, ConfigGuardRailError::ZeroLeafAttempts));
    }

    #[test]
    fn zero_enqueue_chunk_is_rejected() {
        let err = validate(&settings("[scan.fan_out]\nenqueue_take = 0\n")).unwrap_err();
        assert!(matches!(err, ConfigGuardRailError::ZeroEnqueueTake));
    }

    #[test]
    fn registry_problems_surface_as_errors_and_warnings() {
        let raw = r#"
[scan]
disabled_drivers = ["Typo"]

[registry]
external_cursors = ["CatalogCursor"]

[[registry.drivers]]
name = "LoadPackageArchive"
dependencies = ["CatalogCursor"]
"#;
        let (registry, warnings) = validate(&settings(raw)).unwrap();
        assert!(registry.unwrap().contains("LoadPackageArchive"));
        assert_eq!(
            warnings,
            vec![ConfigWarning::UnknownDisabledDriver("Typo".into())]
        );

        let cyclic = r#"
[[registry.drivers]]
name = "A"
dependencies = ["B"]

[[registry.drivers]]
name = "B"
dependencies = ["A"]
"#;
        let err = validate(&settings(cyclic)).unwrap_err();
        assert!(matches!(err, ConfigGuardRailError::Registry(_)));
    }

    #[test]
    fn bucket_cursor_must_be_known() {
        let raw = r#"
[scan]
bucketed_package_cursor = "Buckets"

[registry]
external_cursors = ["CatalogCursor"]
"#;
        let err = validate(&settings(raw)).unwrap_err();
        assert!(matches!(err, ConfigGuardRailError::UnknownBucketCursor(name) if name == "Buckets"));
    }
}
