//! Tunnel detection
//!
//! 1. Find a `tun*` interface
//! 2. Read its gateway from the routing table
//! 3. Derive the server hostname from the OpenVPN config, or from the
//!    gateway when the config has no usable `remote` line

use crate::platform::{NetworkProbe, PlatformError};
use crate::vpn::openvpn::{construct_hostname, read_hostname};
use crate::vpn::{ConnectionInfo, TUN_PREFIX};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum VpnDetectionError {
    #[error("No active OpenVPN connection detected (no tun interface)")]
    NoTunnel,

    #[error("VPN gateway not found in routing table for {0}")]
    GatewayNotFound(String),

    #[error("Failed to read routing table: {0}")]
    Platform(#[from] PlatformError),

    #[error("VPN detection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("VPN detection cancelled: {0}")]
    Cancelled(Box<VpnDetectionError>),
}

/// Something that can find the active tunnel
pub trait TunnelDetector: Send + Sync {
    fn detect(&self, config_path: &Path) -> Result<ConnectionInfo, VpnDetectionError>;
}

/// Detects an OpenVPN tunnel using a `NetworkProbe`
pub struct TunnelLocator<P> {
    probe: P,
}

impl<P: NetworkProbe> TunnelLocator<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    /// First interface whose name starts with `tun`. Enumeration errors
    /// count as "no tunnel".
    fn find_tunnel_interface(&self) -> Option<String> {
        match self.probe.interface_names() {
            Ok(names) => names.into_iter().find(|n| n.starts_with(TUN_PREFIX)),
            Err(e) => {
                debug!("Interface enumeration failed: {}", e);
                None
            }
        }
    }
}

impl<P: NetworkProbe> TunnelDetector for TunnelLocator<P> {
    fn detect(&self, config_path: &Path) -> Result<ConnectionInfo, VpnDetectionError> {
        let interface = self
            .find_tunnel_interface()
            .ok_or(VpnDetectionError::NoTunnel)?;
        debug!("Found tunnel interface {}", interface);

        let gateway_address = self
            .probe
            .tunnel_gateway(&interface)?
            .ok_or_else(|| VpnDetectionError::GatewayNotFound(interface.clone()))?;

        let hostname = match read_hostname(config_path) {
            Ok(Some(hostname)) => hostname,
            Ok(None) => {
                debug!(
                    "No remote directive in {}, using gateway address",
                    config_path.display()
                );
                construct_hostname(&gateway_address)
            }
            Err(e) => {
                debug!(
                    "Cannot read {} ({}), using gateway address",
                    config_path.display(),
                    e
                );
                construct_hostname(&gateway_address)
            }
        };

        Ok(ConnectionInfo {
            gateway_address,
            hostname,
        })
    }
}

/// Call `detector` every `interval` until it succeeds or `cancel` fires.
///
/// The interval is fixed; there is no backoff and no attempt limit.
/// Each attempt runs on the blocking pool since routing lookups run commands.
pub async fn detect_with_retry<D>(
    detector: &Arc<D>,
    config_path: &Path,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<ConnectionInfo, VpnDetectionError>
where
    D: TunnelDetector + ?Sized + 'static,
{
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        let detector = Arc::clone(detector);
        let path = config_path.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || detector.detect(&path))
            .await
            .map_err(VpnDetectionError::from)
            .and_then(|result| result);
        let err = match outcome {
            Ok(info) => {
                info!(
                    "Detected OpenVPN connection: gateway={}, hostname={}",
                    info.gateway_address, info.hostname
                );
                return Ok(info);
            }
            Err(e) => e,
        };

        warn!(
            "VPN detection attempt {} failed: {} (retrying in {:?})",
            attempt, err, interval
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(VpnDetectionError::Cancelled(Box::new(err)));
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
