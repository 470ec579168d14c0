//! Data-source adapters.
//!
//! A [`Monitor`] performs one provider round-trip per [`Monitor::fetch`] and turns
//! the raw JSON into a flat [`Record`] with [`Monitor::process`]. The default
//! processing is [`flatten`] with the monitor's exclusion list; providers with
//! awkward payloads override it.
pub mod energy;
pub mod evohome;
pub mod weather;

use crate::error::AppResult;
use crate::flatten::flatten;
use crate::record::Record;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub use energy::EnergyMonitor;
pub use evohome::EvohomeMonitor;
pub use weather::WeatherMonitor;

/// Timeout applied to every provider request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait for a polled data source.
#[async_trait]
pub trait Monitor: Send {
    /// Logical source name; also the destination table / file stem.
    fn name(&self) -> &str;

    /// Fetches one raw reading from the provider.
    async fn fetch(&mut self) -> AppResult<Value>;

    /// Top-level payload sections dropped by the default [`Monitor::process`].
    fn excluded_keys(&self) -> &[&str] {
        &[]
    }

    /// Turns a raw reading into a flat record.
    fn process(&self, raw: &Value) -> AppResult<Record> {
        Ok(flatten(raw, self.excluded_keys()))
    }

    /// Releases sessions or other provider state. Called once when polling stops.
    async fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// HTTP client shared by the built-in monitors.
pub fn http_client() -> AppResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("mesura/", env!("CARGO_PKG_VERSION")))
        .build()?)
}
