use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::AppConfig;
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataApiDefaults;

impl DataApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct DataApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for DataApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DataApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: DataApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::data_api(),
        }
    }
}

/// HTTP client for key-addressed records of one application.
///
/// Records live at `{apiHost}/{appId}/data/{dataType}/{id}` and are exchanged
/// as raw JSON.
#[derive(Clone, Debug)]
pub struct DataApiClient {
    http: Client,
    config: AppConfig,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl DataApiClient {
    pub fn new(config: AppConfig) -> Result<Self, DataApiError> {
        Self::with_options(config, DataApiClientOptions::default())
    }

    pub fn with_options(
        config: AppConfig,
        options: DataApiClientOptions,
    ) -> Result<Self, DataApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(DataApiError::Transport)?;

        Ok(Self {
            http,
            config,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Fetches one record.
    pub async fn get(&self, data_type: &str, id: &str) -> Result<Value, DataApiError> {
        self.request(Method::GET, data_type, id, None).await
    }

    /// Replaces one record with `record`.
    pub async fn update(
        &self,
        data_type: &str,
        id: &str,
        record: &Value,
    ) -> Result<Value, DataApiError> {
        self.request(Method::PUT, data_type, id, Some(record)).await
    }

    /// Deletes one record.
    pub async fn delete(&self, data_type: &str, id: &str) -> Result<Value, DataApiError> {
        self.request(Method::DELETE, data_type, id, None).await
    }

    pub fn record_url(&self, data_type: &str, id: &str) -> String {
        format!(
            "{}/{}/data/{}/{}",
            self.config.api_host(),
            self.config.app_id(),
            data_type,
            id
        )
    }

    async fn request(
        &self,
        method: Method,
        data_type: &str,
        id: &str,
        body: Option<&Value>,
    ) -> Result<Value, DataApiError> {
        let url = self.record_url(data_type, id);
        debug!(event = "data_api_request", method = %method, url = %url);

        retry_async(
            &self.retry_policy,
            |_| {
                let method = method.clone();
                let url = url.clone();
                async move { self.send_attempt(method, &url, body).await }
            },
            DataApiError::is_retryable,
        )
        .await
    }

    async fn send_attempt(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, DataApiError> {
        let mut builder = self
            .http
            .request(method, url)
            .timeout(self.attempt_timeout)
            .bearer_auth(self.config.token().expose_secret());
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(DataApiError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(DataApiError::Transport)?;

        if !status.is_success() {
            return Err(DataApiError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }

        parse_record(&text)
    }
}

#[derive(Debug, Error)]
pub enum DataApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl DataApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            Self::Parse(_) => None,
        }
    }
}

// Empty bodies (204, bare deletes) read as null.
fn parse_record(body: &str) -> Result<Value, DataApiError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|err| DataApiError::Parse(err.to_string()))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use secrecy::SecretString;
    use serde_json::json;

    use super::{parse_record, summarize_error_body, DataApiClient, DataApiError};
    use crate::config::AppConfig;

    fn client() -> DataApiClient {
        let config = AppConfig::new("app1", SecretString::new("tok".to_string()))
            .with_api_host("https://data.example.com/");
        DataApiClient::new(config).expect("build client")
    }

    #[test]
    fn record_url_is_keyed_by_app_type_and_id() {
        assert_eq!(
            client().record_url("todos", "x1"),
            "https://data.example.com/app1/data/todos/x1"
        );
    }

    #[test]
    fn parses_records_and_empty_bodies() {
        assert_eq!(parse_record(r#"{"id":"x1"}"#).expect("record"), json!({"id": "x1"}));
        assert_eq!(parse_record("  ").expect("empty"), serde_json::Value::Null);
        assert!(matches!(parse_record("<html>"), Err(DataApiError::Parse(_))));
    }

    #[test]
    fn error_body_prefers_structured_message() {
        assert_eq!(summarize_error_body(r#"{"message":"not found"}"#), "not found");
        let long = "x".repeat(500);
        assert_eq!(summarize_error_body(&long).len(), 220);
    }

    #[test]
    fn only_server_side_statuses_are_retryable() {
        let status = |status| DataApiError::HttpStatus {
            status,
            body: String::new(),
        };
        assert!(status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!DataApiError::Parse("bad".to_string()).is_retryable());
        assert_eq!(status(StatusCode::NOT_FOUND).status(), Some(StatusCode::NOT_FOUND));
    }
}
