//! Connection forwarding
//!
//! Provides:
//! - The byte pipeline (rate limiting, tapping, byte counting)
//! - Forwarding sessions, one per accepted connection
//! - The listener manager running every port mapping

mod listener;
mod pipe;
mod session;

pub use listener::{listen, serve, Accept, Relay, ACCEPT_ERROR_DELAY};
pub use pipe::{compose, copy, ByteSource, RateLimited, Raw, Teed, COPY_BUFFER_SIZE};
pub use session::{Session, SessionState};

use crate::limit::RateLimiter;
use crate::proxy::{DialError, Dialer};
use crate::tee::{TeeSink, TeeSinks};
use crate::units::human_size;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("listener task failed: {0}")]
    Task(String),
}

/// Direction of a copy within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound client to remote
    Sent,
    /// Remote to inbound client
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => f.write_str("sent"),
            Direction::Received => f.write_str("received"),
        }
    }
}

/// Byte totals of a finished session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub sent: u64,
    pub received: u64,
}

/// Settings shared read-only by every session
#[derive(Debug)]
pub struct RelayContext {
    pub dialer: Dialer,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub tee: TeeSinks,
    pub raw_bytes: bool,
}

impl RelayContext {
    /// Direct dialing, nothing else
    pub fn new(dialer: Dialer) -> Self {
        Self {
            dialer,
            rate_limiter: None,
            tee: TeeSinks::none(),
            raw_bytes: false,
        }
    }

    /// Tee sink for one direction
    pub fn tee_for(&self, direction: Direction) -> Option<Arc<TeeSink>> {
        match direction {
            Direction::Sent => self.tee.sent.clone(),
            Direction::Received => self.tee.received.clone(),
        }
    }

    /// Render a byte count for the completion log line
    pub fn format_bytes(&self, n: u64) -> String {
        if self.raw_bytes {
            n.to_string()
        } else {
            human_size(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        let mut ctx = RelayContext::new(Dialer::direct());
        assert_eq!(ctx.format_bytes(2048), "2KB");

        ctx.raw_bytes = true;
        assert_eq!(ctx.format_bytes(2048), "2048");
    }
}
