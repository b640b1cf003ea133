//! Inspect and validate catalog scan settings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use catalog_scan_config::{CatalogScanSettings, ConfigSource, init_tracing, validate};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "catalog-scan-config",
    about = "Inspect and validate catalog scan settings"
)]
struct Cli {
    /// Settings file; overrides CATALOG_SCAN_CONFIG_PATH and the default
    /// file lookup
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Dotenv file read before resolving settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved settings
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: Format,
    },
    /// Validate the settings and the driver registry they declare
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Toml,
    Json,
}

fn load(cli: &Cli) -> Result<(CatalogScanSettings, ConfigSource)> {
    if let Some(path) = &cli.config {
        let settings = CatalogScanSettings::load_from_file(path)?;
        return Ok((settings, ConfigSource::File(path.clone())));
    }
    CatalogScanSettings::load_from_env()
}

fn load_env_file(path: &Path) -> Result<()> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(()),
        Err(err) if err.not_found() => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    load_env_file(&cli.env_file)?;
    init_tracing("catalog_scan_config=info")?;

    let (settings, source) = load(&cli)?;
    info!(?source, "resolved catalog scan settings");

    match cli.command {
        Command::Show { format } => {
            let rendered = match format {
                Format::Toml => toml::to_string_pretty(&settings)?,
                Format::Json => serde_json::to_string_pretty(&settings)?,
            };
            println!("{rendered}");
        }
        Command::Check => {
            let (registry, warnings) = validate(&settings)?;
            for warning in &warnings {
                warn!("{warning}");
            }
            match registry {
                Some(registry) => println!(
                    "ok: {} startable drivers, {} warnings",
                    registry.startable_drivers().len(),
                    warnings.len()
                ),
                None => println!("ok: no drivers declared, {} warnings", warnings.len()),
            }
        }
    }

    Ok(())
}
