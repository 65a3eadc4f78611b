//! Configuration handling for the port forwarding daemon
//!
//! Values come from three layers, later ones winning:
//! 1. built-in defaults
//! 2. an optional TOML file (`--config`)
//! 3. command-line flags and `PIA_*` environment variables
//!
//! Durations use humantime syntax (`15m`, `90s`, `1h 30m`).

use crate::automation::AutomationSpec;
use crate::pia::auth::TOKEN_URL;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_OPENVPN_CONFIG: &str = "/etc/openvpn/client/pia.ovpn";
pub const DEFAULT_CA_CERT: &str = "ca.rsa.4096.crt";
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_VPN_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("credentials file path is required (set PIA_CREDENTIALS or --credentials)")]
    MissingCredentials,
    #[error("credentials file does not exist: {0}")]
    CredentialsNotFound(PathBuf),
    #[error("output file path is required (provide as first argument)")]
    MissingOutputFile,
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Two-line file holding the PIA username and password
    pub credentials_file: Option<PathBuf>,
    /// Where the forwarded port is written
    pub output_file: Option<PathBuf>,
    pub openvpn_config: PathBuf,
    pub ca_cert: PathBuf,
    pub token_url: String,
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub vpn_retry_interval: Duration,
    /// Program run as `<program> <port> <output-file>` when the port changes
    pub on_port_change: Option<PathBuf>,
    /// Wait for the program to finish instead of detaching it
    pub sync_script: bool,
    #[serde(with = "humantime_serde")]
    pub script_timeout: Duration,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials_file: None,
            output_file: None,
            openvpn_config: PathBuf::from(DEFAULT_OPENVPN_CONFIG),
            ca_cert: PathBuf::from(DEFAULT_CA_CERT),
            token_url: TOKEN_URL.to_string(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            vpn_retry_interval: DEFAULT_VPN_RETRY_INTERVAL,
            on_port_change: None,
            sync_script: false,
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
            debug: false,
        }
    }
}

/// Values given on the command line or in the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub credentials_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub openvpn_config: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub token_url: Option<String>,
    pub refresh_interval: Option<Duration>,
    pub vpn_retry_interval: Option<Duration>,
    pub on_port_change: Option<PathBuf>,
    pub sync_script: bool,
    pub script_timeout: Option<Duration>,
    pub debug: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply command-line and environment values on top of this config.
    /// Switches can only be turned on.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(path) = overrides.credentials_file {
            self.credentials_file = Some(path);
        }
        if let Some(path) = overrides.output_file {
            self.output_file = Some(path);
        }
        if let Some(path) = overrides.openvpn_config {
            self.openvpn_config = path;
        }
        if let Some(path) = overrides.ca_cert {
            self.ca_cert = path;
        }
        if let Some(url) = overrides.token_url {
            self.token_url = url;
        }
        if let Some(interval) = overrides.refresh_interval {
            self.refresh_interval = interval;
        }
        if let Some(interval) = overrides.vpn_retry_interval {
            self.vpn_retry_interval = interval;
        }
        if let Some(path) = overrides.on_port_change {
            self.on_port_change = Some(path);
        }
        if let Some(timeout) = overrides.script_timeout {
            self.script_timeout = timeout;
        }
        self.sync_script |= overrides.sync_script;
        self.debug |= overrides.debug;
    }

    /// Check required settings and create the output directory if needed.
    ///
    /// Returns the credentials and output paths, which are guaranteed set.
    pub fn validate(&self) -> Result<(PathBuf, PathBuf), ConfigError> {
        let credentials = self
            .credentials_file
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::MissingCredentials)?;
        let output = self
            .output_file
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::MissingOutputFile)?;

        if !credentials.exists() {
            return Err(ConfigError::CredentialsNotFound(credentials));
        }

        for (name, interval) in [
            ("refresh interval", self.refresh_interval),
            ("VPN retry interval", self.vpn_retry_interval),
            ("script timeout", self.script_timeout),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        if let Some(dir) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|source| ConfigError::OutputDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }

        Ok((credentials, output))
    }

    /// Automation settings, if a port change program is configured
    pub fn automation_spec(&self) -> Option<AutomationSpec> {
        self.on_port_change
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|path| AutomationSpec {
                command_path: path.clone(),
                synchronous: self.sync_script,
                timeout: self.script_timeout,
            })
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
