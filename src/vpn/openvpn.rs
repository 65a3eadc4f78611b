//! OpenVPN client configuration parsing
//!
//! Only the `remote` directive matters here: it names the server whose
//! certificate the port forwarding API presents.
//!
//! | Directive | Hostname |
//! |-----------|----------|
//! | `remote vpn.example.com 1194 udp` | `vpn.example.com` |
//! | `remote 10.1.2.3 1194 udp` | `10.1.2.3.privacy.network` |

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;

/// Domain appended to bare server addresses
pub const HOSTNAME_SUFFIX: &str = "privacy.network";

/// Build a PIA hostname from a server address
pub fn construct_hostname(address: &str) -> String {
    format!("{}.{}", address, HOSTNAME_SUFFIX)
}

/// Hostname for the first `remote` directive in `config`, if any
pub fn hostname_from_config(config: &str) -> Option<String> {
    config.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("remote") {
            return None;
        }

        let address = fields.next()?;
        if address.parse::<IpAddr>().is_ok() {
            Some(construct_hostname(address))
        } else {
            Some(address.to_string())
        }
    })
}

/// Read an OpenVPN config file and derive the server hostname
pub fn read_hostname(path: &Path) -> io::Result<Option<String>> {
    let content = fs::read_to_string(path)?;
    Ok(hostname_from_config(&content))
}
