//! Honeywell / Resideo evohome zone controller (TCC v2 "EMEA" API).
//!
//! The monitor keeps one authenticated session for its whole lifetime:
//!
//! - first `fetch`: password grant → user account → installation info, the
//!   first location is remembered;
//! - later `fetch`es: only `location/{id}/status`, refreshing the access token
//!   with the refresh token once it expires (falling back to a new login);
//! - `shutdown`: the session is dropped.
//!
//! Zones are discovered from every status payload, so the produced column set
//! follows the installation and grows when zones are added.
use super::{http_client, Monitor};
use crate::error::{AppResult, MesuraError};
use crate::record::{FieldValue, Record};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Production endpoint.
pub const DEFAULT_BASE_URL: &str = "https://tccna.resideo.com";

// Public application id of the TCC mobile apps, sent as HTTP basic auth on token requests.
const APP_CREDENTIALS: &str =
    "NGEyMzEwODktZDJiNi00MWJkLWE1ZWItMTZhMGE0MjJiOTk5OjFhMTVjZGI4LTQyZGUtNDA3Yi1hZGQwLTA1OWY5MmM1MzBjYg==";
const TOKEN_SCOPE: &str = "EMEA-V1-Basic EMEA-V1-Anonymous EMEA-V1-Get-Current-User-Account";
const API_PREFIX: &str = "/WebAPI/emea/api/v1";

/// Tokens are renewed this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserAccount {
    user_id: String,
}

#[derive(Debug)]
struct Session {
    access_token: String,
    refresh_token: String,
    expires_at: Instant,
    location_id: String,
}

impl Session {
    fn is_expired(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN >= self.expires_at
    }
}

/// Monitor producing one temperature column per heating zone.
pub struct EvohomeMonitor {
    name: String,
    username: String,
    password: String,
    base_url: String,
    client: reqwest::Client,
    session: Option<Session>,
}

impl EvohomeMonitor {
    /// Creates a monitor against the production API. No request is made until
    /// the first fetch.
    pub fn new(
        name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> AppResult<Self> {
        Ok(Self {
            name: name.into(),
            username: username.into(),
            password: password.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: http_client()?,
            session: None,
        })
    }

    /// Overrides the API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Whether an authenticated session is currently held.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn auth_error(&self, message: impl Into<String>) -> MesuraError {
        MesuraError::Authentication {
            source_name: self.name.clone(),
            message: message.into(),
        }
    }

    async fn request_token(&self, grant: &[(&str, &str)]) -> AppResult<TokenResponse> {
        let response = self
            .client
            .post(format!("{}/Auth/OAuth/Token", self.base_url))
            .header(AUTHORIZATION, format!("Basic {}", APP_CREDENTIALS))
            .header(ACCEPT, "application/json")
            .form(grant)
            .send()
            .await?;

        match response.status() {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                Err(self.auth_error(format!("token request rejected ({})", response.status())))
            }
            _ => Ok(response.error_for_status()?.json().await?),
        }
    }

    async fn get_json(&self, access_token: &str, path: &str) -> AppResult<Value> {
        let response = self
            .client
            .get(format!("{}{}{}", self.base_url, API_PREFIX, path))
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.auth_error("access token rejected"));
        }
        Ok(response.error_for_status()?.json().await?)
    }

    /// Full login: tokens plus location discovery.
    async fn login(&self) -> AppResult<Session> {
        debug!("Logging in to evohome for {}", self.name);
        let token = self
            .request_token(&[
                ("grant_type", "password"),
                ("scope", TOKEN_SCOPE),
                ("Username", self.username.as_str()),
                ("Password", self.password.as_str()),
            ])
            .await?;

        let account: UserAccount =
            serde_json::from_value(self.get_json(&token.access_token, "/userAccount").await?)
                .map_err(|e| MesuraError::fetch(&self.name, format!("unexpected user account payload: {}", e)))?;

        let installation = self
            .get_json(
                &token.access_token,
                &format!(
                    "/location/installationInfo?userId={}&includeTemperatureControlSystems=True",
                    account.user_id
                ),
            )
            .await?;
        let location_id = first_location_id(&installation)
            .ok_or_else(|| MesuraError::fetch(&self.name, "account has no locations"))?;
        debug!("Using evohome location {}", location_id);

        Ok(Session {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
            location_id,
        })
    }

    /// Makes sure a usable session exists, refreshing or logging in as needed.
    async fn ensure_session(&mut self) -> AppResult<()> {
        let refresh = match &self.session {
            None => None,
            Some(session) if session.is_expired() => Some(session.refresh_token.clone()),
            Some(_) => return Ok(()),
        };

        if let Some(refresh_token) = refresh {
            let renewed = self
                .request_token(&[
                    ("grant_type", "refresh_token"),
                    ("scope", TOKEN_SCOPE),
                    ("refresh_token", refresh_token.as_str()),
                ])
                .await;
            match (renewed, self.session.as_mut()) {
                (Ok(token), Some(session)) => {
                    debug!("Refreshed evohome access token");
                    session.access_token = token.access_token;
                    session.refresh_token = token.refresh_token;
                    session.expires_at = Instant::now() + Duration::from_secs(token.expires_in);
                    return Ok(());
                }
                (Err(e), _) => warn!("Token refresh failed, logging in again: {}", e),
                (Ok(_), None) => {}
            }
        }

        self.session = Some(self.login().await?);
        Ok(())
    }
}

/// `locationId` of the first location in an installation-info payload.
fn first_location_id(installation: &Value) -> Option<String> {
    let id = installation
        .as_array()?
        .first()?
        .get("locationInfo")?
        .get("locationId")?;
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Column name for a zone: `_<id>_<name with spaces replaced>`.
pub fn zone_column(zone_id: &str, zone_name: &str) -> String {
    format!("_{}_{}", zone_id, zone_name.replace(' ', "_"))
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Monitor for EvohomeMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&mut self) -> AppResult<Value> {
        self.ensure_session().await?;
        let (token, location_id) = match &self.session {
            Some(s) => (s.access_token.clone(), s.location_id.clone()),
            None => return Err(self.auth_error("no session")),
        };

        let status = self
            .get_json(
                &token,
                &format!("/location/{}/status?includeTemperatureControlSystems=True", location_id),
            )
            .await;
        if let Err(MesuraError::Authentication { .. }) = &status {
            // Force a fresh login on the next cycle.
            self.session = None;
        }
        status
    }

    fn process(&self, raw: &Value) -> AppResult<Record> {
        let system = raw
            .get("gateways")
            .and_then(|g| g.get(0))
            .and_then(|g| g.get("temperatureControlSystems"))
            .and_then(|t| t.get(0))
            .ok_or_else(|| MesuraError::fetch(&self.name, "status has no temperature control system"))?;

        let mut record = Record::new();
        record.insert(
            "system_mode",
            system
                .get("systemModeStatus")
                .and_then(|s| s.get("mode"))
                .map_or(FieldValue::Null, FieldValue::from_json),
        );

        let zones = system.get("zones").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
        for zone in zones {
            let Some(zone_id) = id_string(zone.get("zoneId")) else {
                continue;
            };
            let zone_name = zone.get("name").and_then(Value::as_str).unwrap_or_default();
            let status = zone.get("temperatureStatus");
            let available = status
                .and_then(|s| s.get("isAvailable"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let temperature = status
                .and_then(|s| s.get("temperature"))
                .and_then(Value::as_f64)
                .filter(|_| available);
            record.insert(zone_column(&zone_id, zone_name), temperature);
        }

        Ok(record)
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        if self.session.take().is_some() {
            info!("Closed evohome session for {}", self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn monitor() -> EvohomeMonitor {
        EvohomeMonitor::new("evohome", "user@example.com", "secret").unwrap()
    }

    fn status(zones: Value) -> Value {
        json!({
            "locationId": "1234",
            "gateways": [{
                "gatewayId": "5678",
                "temperatureControlSystems": [{
                    "systemId": "9012",
                    "systemModeStatus": {"mode": "Auto", "isPermanent": true},
                    "zones": zones
                }]
            }]
        })
    }

    #[test]
    fn one_column_per_zone() {
        let raw = status(json!([
            {"zoneId": "111", "name": "Living Room", "temperatureStatus": {"temperature": 20.5, "isAvailable": true}},
            {"zoneId": "222", "name": "Bedroom", "temperatureStatus": {"temperature": 18.0, "isAvailable": true}}
        ]));

        let record = monitor().process(&raw).unwrap();
        let keys: Vec<_> = record.keys().collect();
        assert_eq!(keys, ["system_mode", "_111_Living_Room", "_222_Bedroom"]);
        assert_eq!(record.get("system_mode"), Some(&FieldValue::Text("Auto".into())));
        assert_eq!(record.get("_111_Living_Room"), Some(&FieldValue::Real(20.5)));
    }

    #[test]
    fn unavailable_zone_is_null() {
        let raw = status(json!([
            {"zoneId": "333", "name": "Attic", "temperatureStatus": {"isAvailable": false}}
        ]));
        let record = monitor().process(&raw).unwrap();
        assert_eq!(record.get("_333_Attic"), Some(&FieldValue::Null));
    }

    #[test]
    fn missing_system_is_an_error() {
        assert!(monitor().process(&json!({"gateways": []})).is_err());
    }

    #[test]
    fn finds_first_location() {
        let installation = json!([
            {"locationInfo": {"locationId": "1234", "name": "Home"}, "gateways": []},
            {"locationInfo": {"locationId": "9999"}}
        ]);
        assert_eq!(first_location_id(&installation).as_deref(), Some("1234"));
        assert_eq!(first_location_id(&json!([])), None);
    }

    #[test]
    fn zone_column_replaces_spaces() {
        assert_eq!(zone_column("42", "Guest Bed Room"), "_42_Guest_Bed_Room");
    }

    #[tokio::test]
    async fn shutdown_without_session_is_noop() {
        let mut m = monitor();
        assert!(!m.has_session());
        m.shutdown().await.unwrap();
        assert!(!m.has_session());
    }

    mod session {
        use super::*;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{Arc, Mutex};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        const TOKEN: &str = "/Auth/OAuth/Token";
        const USER_ACCOUNT: &str = "/WebAPI/emea/api/v1/userAccount";
        const INSTALLATION: &str = "/WebAPI/emea/api/v1/location/installationInfo";
        const STATUS: &str = "/WebAPI/emea/api/v1/location/loc1/status";

        /// One request seen by the fake API.
        #[derive(Debug, Clone)]
        struct Seen {
            path: String,
            query: String,
            body: String,
        }

        /// Local stand-in for the TCC API, answering one request per connection.
        #[derive(Clone, Default)]
        struct FakeTcc {
            seen: Arc<Mutex<Vec<Seen>>>,
            reject_status: Arc<AtomicBool>,
            reject_refresh: Arc<AtomicBool>,
        }

        impl FakeTcc {
            async fn start(&self) -> String {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let fake = self.clone();
                tokio::spawn(async move {
                    while let Ok((stream, _)) = listener.accept().await {
                        let fake = fake.clone();
                        tokio::spawn(async move {
                            let _ = fake.serve(stream).await;
                        });
                    }
                });
                format!("http://{}/", addr)
            }

            fn take(&self) -> Vec<Seen> {
                std::mem::take(&mut *self.seen.lock().unwrap())
            }

            async fn serve(&self, mut stream: TcpStream) -> std::io::Result<()> {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let head_end = loop {
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let content_length = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < head_end + content_length {
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let body_end = buf.len().min(head_end + content_length);
                let body = String::from_utf8_lossy(&buf[head_end..body_end]).to_string();

                let target = head.split_whitespace().nth(1).unwrap_or_default();
                let (path, query) = target.split_once('?').unwrap_or((target, ""));
                let request = Seen {
                    path: path.to_string(),
                    query: query.to_string(),
                    body,
                };
                let (status, payload) = self.respond(&request);
                self.seen.lock().unwrap().push(request);

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    payload.len(),
                    payload
                );
                stream.write_all(response.as_bytes()).await?;
                stream.shutdown().await
            }

            fn respond(&self, request: &Seen) -> (&'static str, String) {
                const OK: &str = "200 OK";
                const UNAUTHORIZED: &str = "401 Unauthorized";
                match request.path.as_str() {
                    TOKEN if request.body.contains("grant_type=refresh_token")
                        && self.reject_refresh.load(Ordering::SeqCst) =>
                    {
                        (UNAUTHORIZED, json!({"error": "invalid_grant"}).to_string())
                    }
                    TOKEN => (
                        OK,
                        json!({"access_token": "a1", "refresh_token": "r1", "expires_in": 1800}).to_string(),
                    ),
                    USER_ACCOUNT => (OK, json!({"userId": "u1"}).to_string()),
                    INSTALLATION => (OK, json!([{"locationInfo": {"locationId": "loc1"}}]).to_string()),
                    STATUS if self.reject_status.load(Ordering::SeqCst) => (UNAUTHORIZED, String::new()),
                    STATUS => (
                        OK,
                        status(json!([
                            {"zoneId": "111", "name": "Hall", "temperatureStatus": {"temperature": 19.5, "isAvailable": true}}
                        ]))
                        .to_string(),
                    ),
                    _ => ("404 Not Found", String::new()),
                }
            }
        }

        async fn connected(fake: &FakeTcc) -> EvohomeMonitor {
            let base_url = fake.start().await;
            let mut m = monitor().with_base_url(base_url);
            m.client = reqwest::Client::builder().no_proxy().build().unwrap();
            m
        }

        fn paths(seen: &[Seen]) -> Vec<&str> {
            seen.iter().map(|s| s.path.as_str()).collect()
        }

        #[tokio::test]
        async fn first_fetch_logs_in_and_later_fetches_only_poll_status() {
            let fake = FakeTcc::default();
            let mut m = connected(&fake).await;

            let raw = m.fetch().await.unwrap();
            assert!(m.has_session());
            assert_eq!(m.process(&raw).unwrap().get("_111_Hall"), Some(&FieldValue::Real(19.5)));

            let seen = fake.take();
            assert_eq!(paths(&seen), [TOKEN, USER_ACCOUNT, INSTALLATION, STATUS]);
            assert!(seen[0].body.contains("grant_type=password"));
            assert!(seen[0].body.contains("Username=user%40example.com"));
            assert!(seen[2].query.contains("userId=u1"));

            m.fetch().await.unwrap();
            assert_eq!(paths(&fake.take()), [STATUS]);
        }

        #[tokio::test]
        async fn expired_token_uses_refresh_grant() {
            let fake = FakeTcc::default();
            let mut m = connected(&fake).await;
            m.fetch().await.unwrap();
            fake.take();

            if let Some(session) = m.session.as_mut() {
                session.expires_at = Instant::now();
            }
            m.fetch().await.unwrap();

            let seen = fake.take();
            assert_eq!(paths(&seen), [TOKEN, STATUS]);
            assert!(seen[0].body.contains("grant_type=refresh_token"));
            assert!(seen[0].body.contains("refresh_token=r1"));
            assert!(!seen[0].body.contains("grant_type=password"));
        }

        #[tokio::test]
        async fn rejected_refresh_falls_back_to_login() {
            let fake = FakeTcc::default();
            let mut m = connected(&fake).await;
            m.fetch().await.unwrap();
            fake.take();

            fake.reject_refresh.store(true, Ordering::SeqCst);
            if let Some(session) = m.session.as_mut() {
                session.expires_at = Instant::now();
            }
            m.fetch().await.unwrap();

            let seen = fake.take();
            assert_eq!(paths(&seen), [TOKEN, TOKEN, USER_ACCOUNT, INSTALLATION, STATUS]);
            assert!(seen[0].body.contains("grant_type=refresh_token"));
            assert!(seen[1].body.contains("grant_type=password"));
        }

        #[tokio::test]
        async fn unauthorized_status_forces_login_on_next_fetch() {
            let fake = FakeTcc::default();
            let mut m = connected(&fake).await;
            m.fetch().await.unwrap();
            fake.take();

            fake.reject_status.store(true, Ordering::SeqCst);
            let err = m.fetch().await.unwrap_err();
            assert!(matches!(err, MesuraError::Authentication { .. }), "{err:?}");
            assert!(!m.has_session());
            assert_eq!(paths(&fake.take()), [STATUS]);

            fake.reject_status.store(false, Ordering::SeqCst);
            m.fetch().await.unwrap();
            let seen = fake.take();
            assert_eq!(paths(&seen), [TOKEN, USER_ACCOUNT, INSTALLATION, STATUS]);
            assert!(seen[0].body.contains("grant_type=password"));
        }

        #[tokio::test]
        async fn shutdown_drops_the_session() {
            let fake = FakeTcc::default();
            let mut m = connected(&fake).await;
            m.fetch().await.unwrap();
            assert!(m.has_session());

            m.shutdown().await.unwrap();
            assert!(!m.has_session());
        }
    }
}
