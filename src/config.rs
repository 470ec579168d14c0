//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. `mesura.toml` (or the file given on the command line); optional
//! 3. the conventional credential variables `OPENWEATHER_API_KEY`,
//!    `EVOHOME_USERNAME` (or `EVOHOME_EMAIL`) and `EVOHOME_PASSWORD`
//! 4. environment variables prefixed with `MESURA_`, using `__` between
//!    section and key (e.g. `MESURA_ENERGY__INTERVAL=30s`)
//!
//! # Example
//! ```no_run
//! use mesura::config::MesuraConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MesuraConfig::load()?;
//! config.validate()?;
//! println!("Writing to {}", config.storage.data_dir.display());
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, MesuraError};
use crate::logging::{parse_log_level, OutputFormat};
use crate::monitor::{energy, evohome, weather};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "mesura.toml";

const ENV_PREFIX: &str = "MESURA_";
const REDACTED: &str = "********";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MesuraConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Where and how readings are stored
    pub storage: StorageConfig,
    /// P1 energy meter
    pub energy: EnergyConfig,
    /// OpenWeatherMap current conditions
    pub weather: WeatherConfig,
    /// evohome heating zones
    pub evohome: EvohomeConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
        }
    }
}

/// How SQLite databases are laid out under the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StorageLayout {
    /// One database file, one table per source.
    #[default]
    Shared,
    /// One database file per source.
    #[value(name = "per_source")]
    PerSource,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for databases and CSV files
    pub data_dir: PathBuf,
    /// Database layout
    pub layout: StorageLayout,
    /// Database file name for the shared layout
    pub database: String,
    /// Whether readings go to SQLite
    pub sqlite: bool,
    /// Whether readings go to CSV files
    pub csv: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            layout: StorageLayout::Shared,
            database: "monitor.db".to_string(),
            sqlite: true,
            csv: true,
        }
    }
}

impl StorageConfig {
    /// Path of the SQLite database receiving `source_name` readings.
    pub fn database_path(&self, source_name: &str) -> PathBuf {
        match self.layout {
            StorageLayout::Shared => self.data_dir.join(&self.database),
            StorageLayout::PerSource => self
                .data_dir
                .join(format!("{}.db", crate::storage::normalize_source_name(source_name))),
        }
    }
}

/// P1 energy meter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// Poll this source
    pub enabled: bool,
    /// Polling interval (e.g. `1m`)
    pub interval: String,
    /// Local meter endpoint
    pub api_url: String,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "1m".to_string(),
            api_url: energy::DEFAULT_API_URL.to_string(),
        }
    }
}

/// Weather configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// Poll this source
    pub enabled: bool,
    /// Polling interval (e.g. `10m`)
    pub interval: String,
    /// One Call endpoint
    pub api_url: String,
    /// Latitude, passed through verbatim
    pub lat: String,
    /// Longitude, passed through verbatim
    pub lon: String,
    /// OpenWeatherMap key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "10m".to_string(),
            api_url: weather::DEFAULT_API_URL.to_string(),
            lat: "50.83172".to_string(),
            lon: "5.76712".to_string(),
            api_key: None,
        }
    }
}

/// evohome configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvohomeConfig {
    /// Poll this source
    pub enabled: bool,
    /// Polling interval (e.g. `5m`)
    pub interval: String,
    /// API host
    pub base_url: String,
    /// Account e-mail address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Account password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for EvohomeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "5m".to_string(),
            base_url: evohome::DEFAULT_BASE_URL.to_string(),
            username: None,
            password: None,
        }
    }
}

impl MesuraConfig {
    /// Load configuration from `mesura.toml` and the environment
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The layered provider chain, exposed for inspection.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::raw().only(&["OPENWEATHER_API_KEY"]).map(|_| "weather.api_key".into()))
            .merge(Env::raw().only(&["EVOHOME_EMAIL"]).map(|_| "evohome.username".into()))
            .merge(Env::raw().only(&["EVOHOME_USERNAME"]).map(|_| "evohome.username".into()))
            .merge(Env::raw().only(&["EVOHOME_PASSWORD"]).map(|_| "evohome.password".into()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate the global settings after loading.
    ///
    /// Per-source settings (interval, credentials) are not checked here; a
    /// source with a bad value is skipped when the scheduler is built.
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level)?;

        if !self.storage.sqlite && !self.storage.csv {
            return Err(MesuraError::Configuration(
                "At least one of storage.sqlite and storage.csv must be enabled".to_string(),
            ));
        }
        if self.storage.layout == StorageLayout::Shared && self.storage.database.trim().is_empty() {
            return Err(MesuraError::Configuration(
                "storage.database must name a file when layout is 'shared'".to_string(),
            ));
        }

        Ok(())
    }

    /// Copy with credentials masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |secret: &mut Option<String>| {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        };
        mask(&mut copy.weather.api_key);
        mask(&mut copy.evohome.password);
        copy
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MesuraError::Configuration(format!("Failed to render configuration: {}", e)))
    }
}
