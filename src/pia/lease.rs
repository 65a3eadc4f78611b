//! PIA port forwarding lease protocol
//!
//! Two calls against the port forwarding API on the tunnel gateway:
//! 1. getSignature - obtain a signed payload describing the port lease
//! 2. bindPort - bind the lease to this connection (repeated to keep it alive)
//!
//! Both connect to `<gateway>:19999` while verifying the certificate and SNI
//! against the server hostname.

use crate::pia::auth::AuthToken;
use crate::pia::tls::{CertificateError, load_pinned_client_config};
use crate::vpn::ConnectionInfo;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Port of the PIA port forwarding API
pub const API_PORT: u16 = 19999;

/// A lease is refreshed when it has less than this many hours left
pub const NEAR_EXPIRY_HOURS: i64 = 24;

const SIGNATURE_ENDPOINT: &str = "getSignature";
const BIND_PORT_ENDPOINT: &str = "bindPort";
const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Failed to parse signature response: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Signature request rejected: status={0}")]
    Rejected(String),

    #[error("Failed to decode payload from base64: {0}")]
    PayloadEncoding(#[from] base64::DecodeError),

    #[error("Failed to parse payload JSON: {0}")]
    PayloadJson(serde_json::Error),

    #[error("Token unavailable: {0}")]
    Token(#[from] crate::pia::auth::AuthError),
}

#[derive(Error, Debug)]
pub enum BindError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Failed to parse bind response: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Failed to bind port: {0}")]
    Rejected(String),
}

/// Errors building a lease client for a tunnel
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Invalid gateway address: {0}")]
    InvalidGateway(String),

    #[error("Failed to build HTTP client: {0}")]
    ClientError(#[from] reqwest::Error),
}

/// A port forwarding grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    pub expires_at: DateTime<Utc>,
    /// Raw base64 payload, passed back unmodified to bindPort
    pub payload: String,
    pub signature: String,
}

impl PortLease {
    pub fn is_near_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now < Duration::hours(NEAR_EXPIRY_HOURS)
    }
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    status: String,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    signature: String,
}

#[derive(Debug, Deserialize)]
struct PayloadData {
    port: u16,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct BindResponse {
    status: String,
    #[serde(default)]
    message: String,
}

/// Port forwarding operations the orchestrator needs
#[async_trait]
pub trait LeaseApi: Send + Sync {
    async fn request_signature(&self, token: &AuthToken) -> Result<PortLease, SignatureError>;
    async fn bind_port(&self, payload: &str, signature: &str) -> Result<(), BindError>;
}

/// Builds a `LeaseApi` for a detected tunnel
pub trait LeaseConnector: Send + Sync {
    type Api: LeaseApi + 'static;

    fn connect(&self, info: &ConnectionInfo) -> Result<Self::Api, ConnectError>;
}

/// HTTPS client for the port forwarding API
pub struct LeaseClient {
    client: Client,
    base_url: String,
}

impl LeaseClient {
    /// Create a client that dials `info.gateway_address` but authenticates
    /// the server as `info.hostname`.
    pub fn new(info: &ConnectionInfo, tls: rustls::ClientConfig) -> Result<Self, ConnectError> {
        Self::with_port(info, tls, API_PORT)
    }

    pub(crate) fn with_port(
        info: &ConnectionInfo,
        tls: rustls::ClientConfig,
        port: u16,
    ) -> Result<Self, ConnectError> {
        let gateway: IpAddr = info
            .gateway_address
            .parse()
            .map_err(|_| ConnectError::InvalidGateway(info.gateway_address.clone()))?;

        let client = Client::builder()
            .use_preconfigured_tls(tls)
            .resolve(&info.hostname, SocketAddr::new(gateway, port))
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        debug!(
            "Port forwarding client: {}:{} (TLS identity {})",
            gateway, port, info.hostname
        );

        Ok(Self {
            client,
            base_url: format!("https://{}:{}", info.hostname, port),
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }
}

#[async_trait]
impl LeaseApi for LeaseClient {
    async fn request_signature(&self, token: &AuthToken) -> Result<PortLease, SignatureError> {
        debug!("Requesting port forwarding signature");

        let response = self
            .client
            .get(self.endpoint(SIGNATURE_ENDPOINT))
            .query(&[("token", token.value.as_str())])
            .send()
            .await?;
        let body = response.text().await?;

        let lease = parse_signature_response(&body)?;
        info!(
            "Obtained port forwarding signature: port={}, expires={}",
            lease.port, lease.expires_at
        );

        Ok(lease)
    }

    async fn bind_port(&self, payload: &str, signature: &str) -> Result<(), BindError> {
        debug!("Binding port forwarding lease");

        let response = self
            .client
            .get(self.endpoint(BIND_PORT_ENDPOINT))
            .query(&[("payload", payload), ("signature", signature)])
            .send()
            .await?;
        let body = response.text().await?;

        parse_bind_response(&body)
    }
}

/// Connector holding the pinned TLS configuration
pub struct PinnedLeaseConnector {
    tls: Arc<rustls::ClientConfig>,
}

impl PinnedLeaseConnector {
    pub fn new(tls: rustls::ClientConfig) -> Self {
        Self { tls: Arc::new(tls) }
    }

    /// Load the CA certificate up front so a bad path fails at startup
    pub fn from_ca_file(path: &Path) -> Result<Self, CertificateError> {
        Ok(Self::new(load_pinned_client_config(path)?))
    }
}

impl LeaseConnector for PinnedLeaseConnector {
    type Api = LeaseClient;

    fn connect(&self, info: &ConnectionInfo) -> Result<LeaseClient, ConnectError> {
        LeaseClient::new(info, (*self.tls).clone())
    }
}

fn parse_signature_response(body: &str) -> Result<PortLease, SignatureError> {
    let response: SignatureResponse = serde_json::from_str(body)?;

    if response.status != "OK" {
        return Err(SignatureError::Rejected(response.status));
    }

    let data = decode_payload(&response.payload)?;

    Ok(PortLease {
        port: data.port,
        expires_at: data.expires_at,
        payload: response.payload,
        signature: response.signature,
    })
}

fn decode_payload(payload: &str) -> Result<PayloadData, SignatureError> {
    let decoded = BASE64.decode(payload)?;
    serde_json::from_slice(&decoded).map_err(SignatureError::PayloadJson)
}

fn parse_bind_response(body: &str) -> Result<(), BindError> {
    let response: BindResponse = serde_json::from_str(body)?;

    if response.status != "OK" {
        return Err(BindError::Rejected(response.message));
    }

    Ok(())
}
