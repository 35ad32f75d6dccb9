//! Authenticated REST collaborator used to seed cursors, resume after
//! reconnect, and drive polling channels.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::retry::{retry_async, RetryPolicy};
use crate::stream::error::{parse_retry_after, StreamError};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Fetches ordered entity records.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// `GET path?params`, returning the records of a JSON array response.
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Vec<Value>, RestError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestDefaults;

impl RestDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(250);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(2);
    pub const JITTER: Duration = Duration::from_millis(100);
}

#[derive(Clone, Debug)]
pub struct RestClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RestClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RestDefaults::CONNECT_TIMEOUT,
            attempt_timeout: RestDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: RestDefaults::MAX_ATTEMPTS,
                initial_backoff: RestDefaults::BACKOFF,
                max_backoff: RestDefaults::MAX_BACKOFF,
                jitter: RestDefaults::JITTER,
            },
        }
    }
}

/// reqwest-backed [`RestClient`] with bearer-token auth.
#[derive(Clone)]
pub struct HttpRestClient {
    http: Client,
    base_url: String,
    token: Option<SecretString>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl HttpRestClient {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Result<Self, RestError> {
        Self::with_options(base_url, token, RestClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        token: Option<SecretString>,
        options: RestClientOptions,
    ) -> Result<Self, RestError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(RestError::Transport)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end().trim_end_matches('/').to_string(),
            token,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_attempt(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>, RestError> {
        let mut builder = self
            .http
            .get(endpoint)
            .timeout(self.attempt_timeout)
            .query(params);

        if let Some(token) = self.token.as_ref() {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder.send().await.map_err(RestError::Transport)?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.map_err(RestError::Transport)?;

        match status {
            status if status.is_success() => parse_records(&body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RestError::Auth(summarize_error_body(&body)))
            }
            StatusCode::TOO_MANY_REQUESTS => Err(RestError::RateLimited { retry_after }),
            status => Err(RestError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            }),
        }
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Vec<Value>, RestError> {
        let endpoint = self.endpoint(path);
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let endpoint = endpoint.clone();
                async move { self.get_attempt(&endpoint, params).await }
            },
            RestError::is_retryable,
            RestError::retry_after,
        )
        .await
    }
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("authorization rejected: {0}")]
    Auth(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl RestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => status.is_server_error(),
            Self::RateLimited { .. } => true,
            Self::Auth(_) | Self::Parse(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<RestError> for StreamError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::Auth(message) => StreamError::Auth(message),
            RestError::RateLimited { retry_after } => StreamError::RateLimited { retry_after },
            RestError::Parse(message) => StreamError::Protocol(message),
            other => StreamError::Transport(other.to_string()),
        }
    }
}

fn parse_records(body: &str) -> Result<Vec<Value>, RestError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(records)) => Ok(records),
        Ok(_) => Err(RestError::Parse("expected a json array".to_string())),
        Err(err) => Err(RestError::Parse(err.to_string())),
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        error_description: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error_description.or(parsed.error).or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
