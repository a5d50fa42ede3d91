//! SOCKS5 tunnel client (RFC 1928)
//!
//! The wire protocol is handled by `tokio-socks`; this module only adapts it
//! to the [`Dial`] contract and chains it behind a forward dialer.

use super::{Credentials, Dial, DialError, Dialer, Network};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

/// Dialer tunnelling through a SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    forward: Box<Dialer>,
    proxy_addr: String,
    credentials: Option<Credentials>,
}

impl Socks5Dialer {
    /// Proxy at `proxy_addr`, reached through `forward`
    pub fn new(proxy_addr: impl Into<String>, forward: Dialer, credentials: Option<Credentials>) -> Self {
        Self {
            forward: Box::new(forward),
            proxy_addr: proxy_addr.into(),
            credentials,
        }
    }

    /// Proxy `host:port`
    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }
}

#[async_trait]
impl Dial for Socks5Dialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<TcpStream, DialError> {
        if network != Network::Tcp {
            return Err(DialError::UnsupportedNetwork(network));
        }

        let socket = self.forward.dial(Network::Tcp, &self.proxy_addr).await?;

        // Host names are resolved by the proxy
        let stream = match &self.credentials {
            Some(creds) => {
                Socks5Stream::connect_with_password_and_socket(
                    socket,
                    addr,
                    &creds.username,
                    &creds.password,
                )
                .await?
            }
            None => Socks5Stream::connect_with_socket(socket, addr).await?,
        };

        debug!("SOCKS5 proxy {} connected to {}", self.proxy_addr, addr);
        Ok(stream.into_inner())
    }
}
