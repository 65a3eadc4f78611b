//! PIA authentication token handling
//!
//! Tokens are obtained by exchanging the account credentials against the
//! PIA token API and are cached for 24 hours:
//! 1. `TokenSource::exchange` - POST the credentials, receive a token
//! 2. `TokenCache::get_token` - hand out the cached token until it expires

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Default PIA token endpoint
pub const TOKEN_URL: &str = "https://www.privateinternetaccess.com/api/client/v2/token";

/// How long a freshly issued token is considered valid
pub const TOKEN_VALIDITY_HOURS: i64 = 24;

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Failed to parse token response: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Received empty token")]
    EmptyToken,
}

/// A PIA authentication token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    error: String,
}

/// Performs the credential exchange
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn exchange(&self) -> Result<String, AuthError>;
}

/// Anything that can hand the orchestrator a usable token
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&mut self) -> Result<AuthToken, AuthError>;
}

/// Exchanges username/password for a token over HTTPS
pub struct PiaTokenSource {
    client: Client,
    url: String,
    username: String,
    password: String,
}

impl PiaTokenSource {
    pub fn new(url: String, username: String, password: String) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            url,
            username,
            password,
        })
    }
}

#[async_trait]
impl TokenSource for PiaTokenSource {
    async fn exchange(&self) -> Result<String, AuthError> {
        info!("Requesting PIA token from {}", self.url);

        let params = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];

        let response = self.client.post(&self.url).form(&params).send().await?;
        let body = response.text().await?;

        parse_token_response(&body)
    }
}

fn parse_token_response(body: &str) -> Result<String, AuthError> {
    let response: TokenResponse = serde_json::from_str(body)?;

    if !response.error.is_empty() {
        return Err(AuthError::ApiError(response.error));
    }

    if response.token.is_empty() {
        return Err(AuthError::EmptyToken);
    }

    Ok(response.token)
}

/// Caches the token handed out by a `TokenSource`
pub struct TokenCache<S> {
    source: S,
    cached: Option<AuthToken>,
}

impl<S: TokenSource> TokenCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: None,
        }
    }

    /// Return the cached token if it is still valid at `now`, otherwise
    /// exchange credentials for a new one.
    pub async fn get_token_at(&mut self, now: DateTime<Utc>) -> Result<AuthToken, AuthError> {
        if let Some(token) = &self.cached {
            if token.is_valid_at(now) {
                debug!("Using cached token (expires {})", token.expires_at);
                return Ok(token.clone());
            }
            info!("Cached token expired at {}, refreshing", token.expires_at);
        }

        let value = self.source.exchange().await?;
        let token = AuthToken {
            value,
            expires_at: now + Duration::hours(TOKEN_VALIDITY_HOURS),
        };
        self.cached = Some(token.clone());

        Ok(token)
    }
}

#[async_trait]
impl<S: TokenSource> TokenProvider for TokenCache<S> {
    async fn get_token(&mut self) -> Result<AuthToken, AuthError> {
        self.get_token_at(Utc::now()).await
    }
}
