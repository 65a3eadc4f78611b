//! Private Internet Access API clients
//!
//! - `auth`: credential exchange and token caching
//! - `lease`: port forwarding signature and bind calls
//! - `tls`: trust configuration pinned to the PIA CA

pub mod auth;
pub mod lease;
pub mod tls;

pub use auth::{AuthError, AuthToken, PiaTokenSource, TokenCache, TokenProvider, TokenSource};
pub use lease::{
    BindError, ConnectError, LeaseApi, LeaseClient, LeaseConnector, PinnedLeaseConnector,
    PortLease, SignatureError,
};
pub use tls::{CertificateError, resolve_ca_cert_path};
