//! Wiring from configuration to a ready-to-run [`Scheduler`].
use crate::config::{MesuraConfig, StorageLayout};
use crate::controller::PollingController;
use crate::error::{AppResult, ErrorCategory, MesuraError};
use crate::interval::parse_interval;
use crate::monitor::{EnergyMonitor, EvohomeMonitor, Monitor, WeatherMonitor};
use crate::scheduler::Scheduler;
use crate::storage::{Backend, CsvBackend, SqliteBackend};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The built-in data sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// P1 energy meter.
    Energy,
    /// OpenWeatherMap One Call.
    Weather,
    /// evohome heating zones.
    Evohome,
}

impl SourceKind {
    /// Every source, in scheduling order.
    pub const ALL: [SourceKind; 3] = [SourceKind::Energy, SourceKind::Weather, SourceKind::Evohome];

    /// Source name, also the table and CSV file stem.
    pub fn name(self) -> &'static str {
        match self {
            SourceKind::Energy => "energy",
            SourceKind::Weather => "weather",
            SourceKind::Evohome => "evohome",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What would happen to a source when the application starts.
#[derive(Debug)]
pub enum SourcePlan {
    /// Polled at the given interval.
    Scheduled(Duration),
    /// Turned off in the configuration.
    Disabled,
    /// Enabled but misconfigured; the error says why.
    Skipped(MesuraError),
}

fn require(value: &Option<String>, source: SourceKind, hint: &str) -> AppResult<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(MesuraError::MissingCredential {
            source_name: source.name().to_string(),
            hint: hint.to_string(),
        }),
    }
}

fn interval_for(config: &MesuraConfig, source: SourceKind) -> (bool, &str) {
    match source {
        SourceKind::Energy => (config.energy.enabled, config.energy.interval.as_str()),
        SourceKind::Weather => (config.weather.enabled, config.weather.interval.as_str()),
        SourceKind::Evohome => (config.evohome.enabled, config.evohome.interval.as_str()),
    }
}

/// Checks interval and credentials of `source` without touching the network.
pub fn plan_source(config: &MesuraConfig, source: SourceKind) -> SourcePlan {
    let (enabled, interval) = interval_for(config, source);
    if !enabled {
        return SourcePlan::Disabled;
    }
    let checked = parse_interval(interval).and_then(|interval| {
        match source {
            SourceKind::Energy => {}
            SourceKind::Weather => {
                require(&config.weather.api_key, source, "weather.api_key or OPENWEATHER_API_KEY")?;
            }
            SourceKind::Evohome => {
                require(&config.evohome.username, source, "evohome.username or EVOHOME_USERNAME")?;
                require(&config.evohome.password, source, "evohome.password or EVOHOME_PASSWORD")?;
            }
        }
        Ok(interval)
    });
    match checked {
        Ok(interval) => SourcePlan::Scheduled(interval),
        Err(e) => SourcePlan::Skipped(e),
    }
}

/// Builds the monitor for an enabled source.
pub fn build_monitor(config: &MesuraConfig, source: SourceKind) -> AppResult<Box<dyn Monitor>> {
    let name = source.name();
    let monitor: Box<dyn Monitor> = match source {
        SourceKind::Energy => Box::new(EnergyMonitor::new(name, config.energy.api_url.clone())?),
        SourceKind::Weather => {
            let weather = &config.weather;
            let api_key = require(&weather.api_key, source, "weather.api_key or OPENWEATHER_API_KEY")?;
            Box::new(
                WeatherMonitor::new(name, api_key, weather.lat.clone(), weather.lon.clone())?
                    .with_api_url(weather.api_url.clone()),
            )
        }
        SourceKind::Evohome => {
            let evohome = &config.evohome;
            let username = require(&evohome.username, source, "evohome.username or EVOHOME_USERNAME")?;
            let password = require(&evohome.password, source, "evohome.password or EVOHOME_PASSWORD")?;
            Box::new(EvohomeMonitor::new(name, username, password)?.with_base_url(evohome.base_url.clone()))
        }
    };
    Ok(monitor)
}

/// Opens the backends receiving `source` readings, in write order (SQLite, then CSV).
///
/// `shared_sqlite` is reused across sources in the shared layout.
fn backends_for(
    config: &MesuraConfig,
    source: SourceKind,
    shared_sqlite: &Option<Arc<dyn Backend>>,
    csv: &Option<Arc<dyn Backend>>,
) -> AppResult<Vec<Arc<dyn Backend>>> {
    let mut backends = Vec::new();
    if config.storage.sqlite {
        match (config.storage.layout, shared_sqlite) {
            (StorageLayout::Shared, Some(shared)) => backends.push(Arc::clone(shared)),
            _ => {
                let path = config.storage.database_path(source.name());
                backends.push(Arc::new(SqliteBackend::new(path)?) as Arc<dyn Backend>);
            }
        }
    }
    if let Some(csv) = csv {
        backends.push(Arc::clone(csv));
    }
    Ok(backends)
}

/// Builds a scheduler with one controller per usable source.
///
/// Storage setup failures are fatal. A source that is disabled or
/// misconfigured is skipped with a warning, so the remaining sources still run.
pub fn build_scheduler(config: &MesuraConfig) -> AppResult<Scheduler> {
    let storage = &config.storage;
    let shared_sqlite: Option<Arc<dyn Backend>> = match storage.layout {
        StorageLayout::Shared if storage.sqlite => {
            Some(Arc::new(SqliteBackend::new(storage.database_path(""))?) as Arc<dyn Backend>)
        }
        _ => None,
    };
    let csv: Option<Arc<dyn Backend>> = if storage.csv {
        Some(Arc::new(CsvBackend::new(&storage.data_dir)?) as Arc<dyn Backend>)
    } else {
        None
    };

    let mut scheduler = Scheduler::new();
    for source in SourceKind::ALL {
        let interval = match plan_source(config, source) {
            SourcePlan::Scheduled(interval) => interval,
            SourcePlan::Disabled => {
                info!("{} is disabled", source);
                continue;
            }
            SourcePlan::Skipped(e) => {
                warn!("Skipping {}: {}", source, e);
                continue;
            }
        };

        let monitor = match build_monitor(config, source) {
            Ok(monitor) => monitor,
            Err(e) if e.category() == ErrorCategory::Configuration => {
                warn!("Skipping {}: {}", source, e);
                continue;
            }
            Err(e) => return Err(e),
        };
        let backends = backends_for(config, source, &shared_sqlite, &csv)?;
        scheduler.add_controller(PollingController::with_interval(monitor, backends, interval));
    }

    Ok(scheduler)
}
