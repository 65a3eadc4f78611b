//! OpenVPN tunnel discovery
//!
//! The tunnel itself is managed elsewhere; this module only observes it to
//! learn where the port forwarding API lives.

pub mod detect;
pub mod openvpn;

pub use detect::{TunnelDetector, TunnelLocator, VpnDetectionError, detect_with_retry};

/// Interface name prefix of OpenVPN tunnel devices
pub const TUN_PREFIX: &str = "tun";

/// Where to reach the port forwarding API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Tunnel gateway address, the TCP target
    pub gateway_address: String,
    /// Server hostname, the TLS identity
    pub hostname: String,
}
