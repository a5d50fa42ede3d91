//! Configuration management
//!
//! Everything the relay needs is gathered once at startup into an
//! immutable [`RelayConfig`], which is then handed to the listener manager.

use crate::limit::RateLimiter;
use crate::proxy::Dialer;
use crate::tee::TeeSinks;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Default local bind address
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid port mapping {0:?}, expected [LOCAL_PORT:]REMOTE_PORT")]
    InvalidMapping(String),

    #[error("invalid size: {0:?}")]
    InvalidSize(String),

    #[error("invalid rate limit: {0}")]
    InvalidRate(String),

    #[error("invalid proxy URL {url:?}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    #[error("unsupported proxy scheme: {0}")]
    UnsupportedProxyScheme(String),

    #[error("proxy URL has no host: {0}")]
    MissingProxyHost(String),
}

/// A local listen address paired with the remote address it forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Local `host:port` to bind
    pub listen: String,
    /// Remote `host:port` to dial for every accepted connection
    pub remote: String,
}

impl PortMapping {
    /// Create a mapping from already-joined addresses
    pub fn new(listen: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            remote: remote.into(),
        }
    }

    /// Parse a `[LOCAL_PORT:]REMOTE_PORT` specification
    ///
    /// Without a local port the remote port is reused locally.
    pub fn parse(bind_address: &str, remote_host: &str, spec: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidMapping(spec.to_string());

        let parts: Vec<&str> = spec.split(':').collect();
        let (local_port, remote_port) = match parts.as_slice() {
            [port] => (*port, *port),
            [local, remote] => (*local, *remote),
            _ => return Err(invalid()),
        };

        let local_port: u16 = local_port.parse().map_err(|_| invalid())?;
        let remote_port: u16 = remote_port.parse().map_err(|_| invalid())?;

        Ok(Self {
            listen: join_host_port(bind_address, local_port),
            remote: join_host_port(remote_host, remote_port),
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen, self.remote)
    }
}

/// Join a host and port, bracketing bare IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Complete relay configuration
pub struct RelayConfig {
    /// Port mappings, one listener each
    pub mappings: Vec<PortMapping>,
    /// Strategy used to reach every remote address
    pub dialer: Dialer,
    /// Shared limiter applied to both directions of every session
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Optional copies of the sent and received streams
    pub tee: TeeSinks,
    /// Log byte counts as raw integers instead of human-readable sizes
    pub raw_bytes: bool,
}

impl RelayConfig {
    /// Direct dialing, no limiter, no tee
    pub fn new(mappings: Vec<PortMapping>) -> Self {
        Self {
            mappings,
            dialer: Dialer::direct(),
            rate_limiter: None,
            tee: TeeSinks::none(),
            raw_bytes: false,
        }
    }

    /// Use the given dialer
    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = dialer;
        self
    }

    /// Enable the shared rate limiter
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(Arc::new(limiter));
        self
    }

    /// Use the given tee sinks
    pub fn with_tee(mut self, tee: TeeSinks) -> Self {
        self.tee = tee;
        self
    }

    /// Toggle raw byte counts in the completion log line
    pub fn with_raw_bytes(mut self, raw_bytes: bool) -> Self {
        self.raw_bytes = raw_bytes;
        self
    }
}
