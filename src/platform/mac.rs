//! macOS-specific route inspection

use super::{PlatformError, is_ip_literal, is_tunnel_field};
use std::process::Command;

/// Find the tunnel gateway from `netstat -rn`
pub fn tunnel_gateway(interface: &str) -> Result<Option<String>, PlatformError> {
    let output = Command::new("netstat")
        .args(["-rn", "-f", "inet"])
        .output()
        .map_err(|e| PlatformError::RouteError(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::RouteError(stderr.to_string()));
    }

    let table = String::from_utf8_lossy(&output.stdout);
    Ok(parse_netstat(&table, interface))
}

/// Parse `netstat -rn` output (`Destination Gateway Flags Netif Expire`)
pub fn parse_netstat(table: &str, interface: &str) -> Option<String> {
    table.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || !fields.iter().any(|f| is_tunnel_field(f, interface)) {
            return None;
        }

        fields
            .get(1)
            .filter(|f| is_ip_literal(f))
            .map(|f| f.to_string())
    })
}
