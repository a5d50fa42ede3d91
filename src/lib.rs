//! # tcp-proxy
//!
//! A TCP port forwarder that relays local listeners to a remote host,
//! optionally through an upstream forward proxy.
//!
//! ## Features
//!
//! - **Multiple port mappings** served concurrently from one process
//! - **Upstream proxies**: SOCKS5 and HTTP CONNECT, explicit or from `ALL_PROXY`
//!   with `NO_PROXY` bypass
//! - **Global rate limiting** with a shared token bucket
//! - **Traffic tapping** of either direction to a file or stdout
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Listener Manager                    │
//! │          (one accept loop per port mapping)          │
//! ├──────────────────────────────────────────────────────┤
//! │                 Forwarding Session                   │
//! │     (dial, two copy tasks, completion accounting)    │
//! ├──────────────────────────────────────────────────────┤
//! │                    Byte Pipeline                     │
//! │           (rate limiter -> tee -> counting)          │
//! ├──────────────────────────────────────────────────────┤
//! │                       Dialer                         │
//! │           (direct, SOCKS5, HTTP CONNECT)             │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod limit;
pub mod proxy;
pub mod relay;
pub mod tee;
pub mod units;
pub mod version;

pub use config::{PortMapping, RelayConfig};
pub use proxy::Dialer;
pub use relay::{Relay, Session, Transfer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Dial error: {0}")]
    Dial(#[from] proxy::DialError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),
}
