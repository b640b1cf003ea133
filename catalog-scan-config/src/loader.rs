use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use catalog_scan_core::CatalogScanConfig;
use serde::{Deserialize, Serialize};

use crate::registry::RegistrySpec;

/// Names a file holding the settings (TOML or JSON).
pub const CONFIG_PATH_ENV: &str = "CATALOG_SCAN_CONFIG_PATH";
/// Holds the settings inline as JSON.
pub const CONFIG_JSON_ENV: &str = "CATALOG_SCAN_CONFIG_JSON";

const DEFAULT_FILES: &[&str] = &[
    "catalog-scan.toml",
    "catalog-scan.json",
    "config/catalog-scan.toml",
    "config/catalog-scan.json",
];

/// Where the loaded settings came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Everything a host reads at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogScanSettings {
    /// Engine tuning. Missing keys keep their defaults.
    pub scan: CatalogScanConfig,
    /// Driver graph used by `validate` and by hosts that build their registry
    /// from configuration.
    pub registry: RegistrySpec,
}

impl CatalogScanSettings {
    /// Load settings overrides. Evaluation order:
    /// 1) `$CATALOG_SCAN_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$CATALOG_SCAN_CONFIG_JSON` (inline JSON),
    /// 3) the first of `catalog-scan.toml`, `catalog-scan.json`,
    ///    `config/catalog-scan.toml`, `config/catalog-scan.json`,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        Self::load_with(|key| env::var(key).ok(), Path::new("."))
    }

    /// [`Self::load_from_env`] with an explicit variable lookup and a root
    /// for the default file candidates.
    pub fn load_with(
        lookup: impl Fn(&str) -> Option<String>,
        root: &Path,
    ) -> anyhow::Result<(Self, ConfigSource)> {
        if let Some(path) = lookup(CONFIG_PATH_ENV)
            && !path.trim().is_empty()
        {
            let path = PathBuf::from(path);
            let settings = Self::load_from_file(&path)?;
            return Ok((settings, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = lookup(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let settings = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((settings, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(root) {
            let settings = Self::load_from_file(&path)?;
            return Ok((settings, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read catalog scan config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents).with_context(|| {
                format!("invalid catalog scan config {}", path.display())
            }),
            Some("toml") => toml::from_str(&contents).map_err(|err| {
                anyhow!("invalid catalog scan config {}: {err}", path.display())
            }),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    /// Try TOML first, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse catalog scan config {origin}: toml error: {toml_err}; json error: {json_err}"
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid catalog scan config json: {err}"))
    }

    fn find_default_file(root: &Path) -> Option<PathBuf> {
        DEFAULT_FILES
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn falls_back_to_defaults() {
        let root = tempfile::tempdir().unwrap();
        let (settings, source) =
            CatalogScanSettings::load_with(vars(&[]), root.path()).unwrap();
        assert_eq!(source, ConfigSource::Default);
        assert_eq!(settings.scan.old_index_scans_to_keep, 9);
        assert!(settings.registry.drivers.is_empty());
    }

    #[test]
    fn explicit_path_wins_over_inline_json_and_files() {
        let root = tempfile::tempdir().unwrap();
        fs::write(
            root.path().join("catalog-scan.toml"),
            "[scan]\nlatest_scans_to_check = 1\n",
        )
        .unwrap();
        let explicit = root.path().join("custom.toml");
        fs::write(&explicit, "[scan.leaf]\nmax_attempts = 3\n").unwrap();

        let (settings, source) = CatalogScanSettings::load_with(
            vars(&[
                (CONFIG_PATH_ENV, explicit.to_str().unwrap()),
                (CONFIG_JSON_ENV, r#"{"scan":{"latest_scans_to_check":7}}"#),
            ]),
            root.path(),
        )
        .unwrap();

        assert_eq!(source, ConfigSource::EnvPath(explicit));
        assert_eq!(settings.scan.leaf.max_attempts, 3);
        assert_eq!(settings.scan.leaf.try_again_later_secs, 60);
        assert_eq!(settings.scan.latest_scans_to_check, 20);
    }

    #[test]
    fn inline_json_beats_default_files() {
        let root = tempfile::tempdir().unwrap();
        fs::write(
            root.path().join("catalog-scan.toml"),
            "[scan]\nlatest_scans_to_check = 1\n",
        )
        .unwrap();

        let (settings, source) = CatalogScanSettings::load_with(
            vars(&[(CONFIG_JSON_ENV, r#"{"scan":{"latest_scans_to_check":7}}"#)]),
            root.path(),
        )
        .unwrap();
        assert_eq!(source, ConfigSource::EnvInline);
        assert_eq!(settings.scan.latest_scans_to_check, 7);
    }

    #[test]
    fn finds_files_under_config_dir() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("config")).unwrap();
        let path = root.path().join("config/catalog-scan.json");
        fs::write(&path, r#"{"scan":{"disabled_drivers":["LoadPackageArchive"]}}"#)
            .unwrap();

        let (settings, source) =
            CatalogScanSettings::load_with(vars(&[]), root.path()).unwrap();
        assert_eq!(source, ConfigSource::File(path));
        assert!(settings.scan.is_disabled("LoadPackageArchive"));
    }

    #[test]
    fn unknown_extension_tries_both_formats() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("settings.conf");
        fs::write(&path, r#"{"scan":{"fan_out":{"requeue_take":5}}}"#).unwrap();
        let settings = CatalogScanSettings::load_from_file(&path).unwrap();
        assert_eq!(settings.scan.fan_out.requeue_take, 5);

        fs::write(&path, "scan = [").unwrap();
        let err = CatalogScanSettings::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("toml error"));
    }
}
