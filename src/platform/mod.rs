//! Platform-specific network inspection

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(target_os = "linux")]
pub mod linux;

use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to enumerate network interfaces: {0}")]
    InterfaceError(String),
    #[error("Failed to read routing table: {0}")]
    RouteError(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Read-only view of the host's network configuration
pub trait NetworkProbe: Send + Sync {
    /// Names of all network interfaces
    fn interface_names(&self) -> Result<Vec<String>, PlatformError>;

    /// Gateway address of the first route that goes through `interface`
    fn tunnel_gateway(&self, interface: &str) -> Result<Option<String>, PlatformError>;
}

/// Probe backed by the running system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }
}

impl NetworkProbe for SystemProbe {
    fn interface_names(&self) -> Result<Vec<String>, PlatformError> {
        #[cfg(unix)]
        {
            let interfaces = nix::net::if_::if_nameindex()
                .map_err(|e| PlatformError::InterfaceError(e.to_string()))?;
            Ok(interfaces
                .iter()
                .map(|iface| iface.name().to_string_lossy().into_owned())
                .collect())
        }

        #[cfg(not(unix))]
        {
            Err(PlatformError::UnsupportedPlatform)
        }
    }

    fn tunnel_gateway(&self, interface: &str) -> Result<Option<String>, PlatformError> {
        #[cfg(target_os = "linux")]
        {
            linux::tunnel_gateway(interface)
        }

        #[cfg(target_os = "macos")]
        {
            mac::tunnel_gateway(interface)
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = interface;
            Err(PlatformError::UnsupportedPlatform)
        }
    }
}

/// True if `field` names a tunnel device (`tun0`, `tun1`, ...)
pub(crate) fn is_tunnel_field(field: &str, interface: &str) -> bool {
    field == interface || field.starts_with(crate::vpn::TUN_PREFIX)
}

pub(crate) fn is_ip_literal(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}
