//! PIA account credentials file
//!
//! Plain text, username on the first line and password on the second.
//! Windows line endings are accepted.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Failed to read credentials file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid credentials file format: expected username and password on the first two lines")]
    InvalidFormat,
}

/// Account username and password
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// Keep the password out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn split_lines(content: &str) -> Vec<String> {
    content
        .split('\n')
        .map(|line| line.replace('\r', ""))
        .collect()
}

/// Parse credentials file content
pub fn parse_credentials(content: &str) -> Result<Credentials, CredentialsError> {
    let mut lines = split_lines(content).into_iter();
    let username = lines.next().unwrap_or_default();
    let password = lines.next().unwrap_or_default();

    if username.is_empty() || password.is_empty() {
        return Err(CredentialsError::InvalidFormat);
    }

    Ok(Credentials { username, password })
}

/// Load credentials from `path`
pub fn load_credentials(path: &Path) -> Result<Credentials, CredentialsError> {
    let content = fs::read_to_string(path).map_err(|source| CredentialsError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;

    let credentials = parse_credentials(&content)?;
    debug!(
        "Loaded credentials for {} from {}",
        credentials.username,
        path.display()
    );
    Ok(credentials)
}
