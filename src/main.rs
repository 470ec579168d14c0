//! CLI Entry Point for mesura
//!
//! # Usage
//!
//! Poll every configured source until Ctrl-C:
//! ```bash
//! mesura run --config mesura.toml
//! ```
//!
//! Show the resolved configuration:
//! ```bash
//! mesura check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mesura::app::{build_scheduler, plan_source, SourceKind, SourcePlan};
use mesura::config::{MesuraConfig, StorageLayout, DEFAULT_CONFIG_FILE};
use mesura::logging::{self, OutputFormat};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "mesura", version)]
#[command(about = "Polls home-monitoring sources and stores their readings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every enabled source until interrupted
    Run {
        /// Configuration file (optional)
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Directory for databases and CSV files
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// SQLite database layout
        #[arg(long, value_enum)]
        layout: Option<StorageLayout>,

        /// P1 meter endpoint
        #[arg(long)]
        energy_api: Option<String>,

        /// Energy polling interval (e.g. 1m)
        #[arg(long)]
        energy_interval: Option<String>,

        /// Weather polling interval (e.g. 10m)
        #[arg(long)]
        weather_interval: Option<String>,

        /// evohome polling interval (e.g. 5m)
        #[arg(long)]
        evohome_interval: Option<String>,

        /// Log output format
        #[arg(long, value_enum)]
        log_format: Option<OutputFormat>,
    },

    /// Print the resolved configuration and which sources would run
    CheckConfig {
        /// Configuration file (optional)
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

/// Command-line values layered over the loaded configuration.
#[derive(Default)]
struct Overrides {
    data_dir: Option<PathBuf>,
    layout: Option<StorageLayout>,
    energy_api: Option<String>,
    energy_interval: Option<String>,
    weather_interval: Option<String>,
    evohome_interval: Option<String>,
    log_format: Option<OutputFormat>,
}

impl Overrides {
    fn apply(self, config: &mut MesuraConfig) {
        if let Some(dir) = self.data_dir {
            config.storage.data_dir = dir;
        }
        if let Some(layout) = self.layout {
            config.storage.layout = layout;
        }
        if let Some(url) = self.energy_api {
            config.energy.api_url = url;
        }
        if let Some(interval) = self.energy_interval {
            config.energy.interval = interval;
        }
        if let Some(interval) = self.weather_interval {
            config.weather.interval = interval;
        }
        if let Some(interval) = self.evohome_interval {
            config.evohome.interval = interval;
        }
        if let Some(format) = self.log_format {
            config.application.log_format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            data_dir,
            layout,
            energy_api,
            energy_interval,
            weather_interval,
            evohome_interval,
            log_format,
        } => {
            let overrides = Overrides {
                data_dir,
                layout,
                energy_api,
                energy_interval,
                weather_interval,
                evohome_interval,
                log_format,
            };
            run(config, overrides).await
        }
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load(path: &Path, overrides: Overrides) -> Result<MesuraConfig> {
    let mut config = MesuraConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    overrides.apply(&mut config);
    Ok(config)
}

async fn run(path: PathBuf, overrides: Overrides) -> Result<()> {
    let config = load(&path, overrides)?;
    logging::init_from_config(&config)?;
    config.validate().context("Invalid configuration")?;

    info!("mesura {} starting, data in {}", env!("CARGO_PKG_VERSION"), config.storage.data_dir.display());
    let scheduler = build_scheduler(&config)?;
    scheduler.run_all().await?;
    info!("mesura stopped");
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path, Overrides::default())?;
    print!("{}", config.redacted().to_toml()?);
    println!();

    match config.validate() {
        Ok(()) => println!("# configuration is valid"),
        Err(e) => println!("# configuration is INVALID: {}", e),
    }
    for source in SourceKind::ALL {
        match plan_source(&config, source) {
            SourcePlan::Scheduled(interval) => println!("# {}: every {:?}", source, interval),
            SourcePlan::Disabled => println!("# {}: disabled", source),
            SourcePlan::Skipped(e) => println!("# {}: skipped ({})", source, e),
        }
    }
    Ok(())
}
