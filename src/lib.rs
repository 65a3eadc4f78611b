//! PIA port forwarding - keeps a forwarded port alive on an OpenVPN tunnel
//!
//! This crate runs alongside an already established Private Internet Access
//! OpenVPN connection. It obtains a port forwarding lease through the tunnel,
//! re-binds it periodically, writes the port to a file and runs a hook
//! program whenever the port changes.
//!
//! # Architecture
//!
//! - `config`: Configuration layering (defaults, TOML, flags/environment)
//! - `credentials`: PIA account credentials file
//! - `pia`: Token, lease and pinned TLS clients for the PIA API
//! - `platform`: Interface enumeration and routing table reads (Linux, macOS)
//! - `vpn`: OpenVPN tunnel detection
//! - `automation`: Port change hook execution
//! - `daemon`: The orchestrating state machine and port output file
//!
//! # Usage
//!
//! ```bash
//! PIA_CREDENTIALS=/etc/pia/credentials \
//!   pia-port-forward --on-port-change /usr/local/bin/update-port /run/pia/port
//! ```

pub mod automation;
pub mod config;
pub mod credentials;
pub mod daemon;
pub mod pia;
pub mod platform;
pub mod vpn;

pub use config::Config;
pub use daemon::{Orchestrator, OrchestratorSettings, run_daemon};
