//! HomeWizard-style P1 energy meter.
use super::{http_client, Monitor};
use crate::error::AppResult;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Default local API endpoint of the meter.
pub const DEFAULT_API_URL: &str = "http://p1meter-231dbe.local./api/v1/data";

/// Polls the meter's flat JSON endpoint.
pub struct EnergyMonitor {
    name: String,
    api_url: String,
    client: reqwest::Client,
}

impl EnergyMonitor {
    /// Creates a monitor reading `api_url`.
    pub fn new(name: impl Into<String>, api_url: impl Into<String>) -> AppResult<Self> {
        Ok(Self {
            name: name.into(),
            api_url: api_url.into(),
            client: http_client()?,
        })
    }

    /// The polled endpoint.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl Monitor for EnergyMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&mut self) -> AppResult<Value> {
        debug!("GET {}", self.api_url);
        let response = self.client.get(&self.api_url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// The `external` array repeats readings of attached gas/water meters with
    /// nested ids; it is not stored.
    fn excluded_keys(&self) -> &[&str] {
        &["external"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;
    use serde_json::json;

    #[test]
    fn drops_external_section() {
        let monitor = EnergyMonitor::new("energy", DEFAULT_API_URL).unwrap();
        let raw = json!({
            "wifi_ssid": "home",
            "active_tariff": 1,
            "total_power_import_t1_kwh": 10.5,
            "active_power_w": -123.0,
            "external": [
                {"unique_id": "G001", "type": "gas_meter", "value": 1.2, "unit": "m3"}
            ]
        });

        let record = monitor.process(&raw).unwrap();
        let keys: Vec<_> = record.keys().collect();
        assert_eq!(
            keys,
            ["wifi_ssid", "active_tariff", "total_power_import_t1_kwh", "active_power_w"]
        );
        assert_eq!(record.get("active_tariff"), Some(&FieldValue::Integer(1)));
        assert_eq!(record.get("active_power_w"), Some(&FieldValue::Real(-123.0)));
    }
}
