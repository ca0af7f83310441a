//! Application configuration shared by the data and realtime clients.

use secrecy::SecretString;
use uuid::Uuid;

/// Local development endpoint for the data API.
pub const LOCAL_API_HOST: &str = "http://localhost:5000";
/// Local development endpoint for the realtime router.
pub const LOCAL_REALTIME_HOST: &str = "ws://localhost:8080/ws";

/// Identity and endpoints of one backend application.
///
/// Every client built from the same config shares its per-session unique id,
/// which is stamped into outgoing realtime envelopes as `clientId`.
#[derive(Clone, Debug)]
pub struct AppConfig {
    app_id: String,
    token: SecretString,
    api_host: String,
    realtime_host: String,
    unique_id: String,
}

impl AppConfig {
    /// Creates a config pointing at the local development endpoints.
    pub fn new(app_id: impl Into<String>, token: SecretString) -> Self {
        Self {
            app_id: app_id.into(),
            token,
            api_host: LOCAL_API_HOST.to_string(),
            realtime_host: LOCAL_REALTIME_HOST.to_string(),
            unique_id: Uuid::new_v4().to_string(),
        }
    }

    /// Sets the data API base URL. Trailing whitespace and slashes are dropped.
    pub fn with_api_host(mut self, host: impl Into<String>) -> Self {
        self.api_host = normalize_host(host.into());
        self
    }

    /// Sets the realtime router URL.
    pub fn with_realtime_host(mut self, host: impl Into<String>) -> Self {
        self.realtime_host = host.into().trim_end().to_string();
        self
    }

    /// Overrides the generated per-session unique id.
    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn api_host(&self) -> &str {
        &self.api_host
    }

    pub fn realtime_host(&self) -> &str {
        &self.realtime_host
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }
}

fn normalize_host(host: String) -> String {
    host.trim_end().trim_end_matches('/').to_string()
}
