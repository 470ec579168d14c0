//! OpenWeatherMap "One Call" current conditions.
use super::{http_client, Monitor};
use crate::error::{AppResult, MesuraError};
use crate::record::{utc_timestamp, FieldValue, Record};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// One Call 3.0 endpoint.
pub const DEFAULT_API_URL: &str = "https://api.openweathermap.org/data/3.0/onecall";

const KELVIN_OFFSET: f64 = 273.15;

/// Fields copied verbatim from the `current` block, in column order.
const CURRENT_FIELDS: [&str; 6] = ["pressure", "humidity", "uvi", "clouds", "visibility", "wind_speed"];

/// Weather monitor for one location.
pub struct WeatherMonitor {
    name: String,
    api_url: String,
    api_key: String,
    lat: String,
    lon: String,
    client: reqwest::Client,
}

impl WeatherMonitor {
    /// Creates a monitor for the One Call endpoint at `lat`/`lon`.
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        lat: impl Into<String>,
        lon: impl Into<String>,
    ) -> AppResult<Self> {
        Ok(Self {
            name: name.into(),
            api_url: DEFAULT_API_URL.to_string(),
            api_key: api_key.into(),
            lat: lat.into(),
            lon: lon.into(),
            client: http_client()?,
        })
    }

    /// Overrides the endpoint (e.g. for a proxy).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

#[async_trait]
impl Monitor for WeatherMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&mut self) -> AppResult<Value> {
        debug!("GET {} (lat={}, lon={})", self.api_url, self.lat, self.lon);
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("lat", self.lat.as_str()),
                ("lon", self.lon.as_str()),
                ("exclude", "minutely,hourly,daily,alerts"),
                ("appid", self.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    fn process(&self, raw: &Value) -> AppResult<Record> {
        if !raw.is_object() {
            return Err(MesuraError::fetch(&self.name, "expected a JSON object"));
        }
        Ok(process_current(raw))
    }
}

fn scalar(value: Option<&Value>) -> FieldValue {
    value.map_or(FieldValue::Null, FieldValue::from_json)
}

/// Rounds to two decimals.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn epoch_to_utc(value: &Value) -> Option<String> {
    let secs = value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))?;
    if secs == 0 {
        return None;
    }
    chrono::DateTime::from_timestamp(secs, 0).map(utc_timestamp)
}

/// Selects and converts the fields worth keeping from a One Call payload.
fn process_current(raw: &Value) -> Record {
    let mut record = Record::new();
    record.insert("lat", scalar(raw.get("lat")));
    record.insert("lon", scalar(raw.get("lon")));
    record.insert("timezone", scalar(raw.get("timezone")));

    let current = raw.get("current");
    let field = |name: &str| current.and_then(|c| c.get(name));

    record.insert("dt", scalar(field("dt")));

    for key in ["sunrise", "sunset"] {
        if let Some(iso) = field(key).and_then(epoch_to_utc) {
            record.insert(key, iso);
        }
    }

    if let Some(kelvin) = field("temp").and_then(Value::as_f64) {
        record.insert("temp_c", round2(kelvin - KELVIN_OFFSET));
    }

    for key in CURRENT_FIELDS {
        record.insert(key, scalar(field(key)));
    }

    if let Some(first) = field("weather").and_then(Value::as_array).and_then(|w| w.first()) {
        record.insert("weather_main", scalar(first.get("main")));
        record.insert("weather_description", scalar(first.get("description")));
    }

    record
}
