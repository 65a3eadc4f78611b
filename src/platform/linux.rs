//! Linux-specific route inspection

use super::{PlatformError, is_ip_literal, is_tunnel_field};
use std::process::Command;

/// Find the tunnel gateway from `ip route`
pub fn tunnel_gateway(interface: &str) -> Result<Option<String>, PlatformError> {
    let output = Command::new("ip")
        .arg("route")
        .output()
        .map_err(|e| PlatformError::RouteError(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::RouteError(stderr.to_string()));
    }

    let table = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ip_route(&table, interface))
}

/// Parse `ip route` output.
///
/// Lines look like `0.0.0.0/1 via 10.13.112.1 dev tun0`. The first line
/// mentioning the tunnel wins; its `via` address is the gateway, falling
/// back to the third field when that is an address.
pub fn parse_ip_route(table: &str, interface: &str) -> Option<String> {
    table.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if !fields.iter().any(|f| is_tunnel_field(f, interface)) {
            return None;
        }

        if let Some(pos) = fields.iter().position(|f| *f == "via") {
            if let Some(addr) = fields.get(pos + 1) {
                return Some(addr.to_string());
            }
        }

        fields
            .get(2)
            .filter(|f| is_ip_literal(f))
            .map(|f| f.to_string())
    })
}
