//! HTTP CONNECT tunnel client

use super::{Dial, DialError, Dialer, Network};
use crate::version::default_user_agent;
use async_trait::async_trait;
use base64::Engine;
use percent_encoding::percent_decode_str;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// Handshake timeout used when none is configured
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the proxy response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Basic authentication credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Percent-decoded user info of a URL, if it has any
    pub fn from_url(url: &Url) -> Option<Self> {
        if url.username().is_empty() && url.password().is_none() {
            return None;
        }
        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
        Some(Self {
            username: decode(url.username()),
            password: url.password().map(decode).unwrap_or_default(),
        })
    }

    /// `Proxy-Authorization` header value
    pub fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Options for the CONNECT handshake
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// User-Agent header, defaults to `tcp-proxy/<version>`
    pub user_agent: Option<String>,
    /// Proxy credentials sent as Basic auth
    pub credentials: Option<Credentials>,
    /// Handshake timeout, zero means [`DEFAULT_CONNECT_TIMEOUT`]
    pub timeout: Duration,
}

impl ConnectOptions {
    fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            self.timeout
        }
    }
}

/// Dialer tunnelling through an HTTP proxy with `CONNECT`
#[derive(Debug, Clone)]
pub struct HttpConnectDialer {
    forward: Box<Dialer>,
    proxy_addr: String,
    options: ConnectOptions,
}

impl HttpConnectDialer {
    /// Proxy at `proxy_addr`, reached through `forward`
    pub fn new(proxy_addr: impl Into<String>, forward: Dialer, options: ConnectOptions) -> Self {
        Self {
            forward: Box::new(forward),
            proxy_addr: proxy_addr.into(),
            options,
        }
    }

    /// Proxy `host:port`
    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Serialize the CONNECT request for `target`
    fn request(&self, target: &str) -> String {
        let user_agent = self
            .options
            .user_agent
            .clone()
            .unwrap_or_else(default_user_agent);

        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\n\
             Host: {target}\r\n\
             User-Agent: {user_agent}\r\n\
             Proxy-Connection: keep-alive\r\n"
        );
        if let Some(credentials) = &self.options.credentials {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", credentials.basic_auth()));
        }
        request.push_str("\r\n");
        request
    }

    /// Send CONNECT and wait for the proxy's answer
    async fn handshake(&self, conn: &mut TcpStream, target: &str) -> Result<(), DialError> {
        conn.write_all(self.request(target).as_bytes()).await?;
        conn.flush().await?;

        let head = read_response_head(conn).await?;
        let (code, status) = parse_status_line(&head)?;
        debug!("Proxy {} answered CONNECT {}: {}", self.proxy_addr, target, status);

        if code != 200 {
            return Err(DialError::Protocol {
                proxy: self.proxy_addr.clone(),
                target: target.to_string(),
                code,
                status,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Dial for HttpConnectDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<TcpStream, DialError> {
        if network != Network::Tcp {
            return Err(DialError::UnsupportedNetwork(network));
        }

        let mut conn = self.forward.dial(Network::Tcp, &self.proxy_addr).await?;

        // The timeout only covers the handshake, the tunnel itself is unbounded
        let timeout = self.options.timeout();
        match tokio::time::timeout(timeout, self.handshake(&mut conn, addr)).await {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DialError::Timeout(timeout)),
        }
    }
}

/// Read up to and including the blank line ending the response head
///
/// Reads byte by byte so nothing belonging to the tunnel is consumed. Bare
/// LF line endings are accepted as well as CRLF.
async fn read_response_head(conn: &mut TcpStream) -> Result<String, DialError> {
    let mut head = Vec::with_capacity(128);

    while !(head.ends_with(b"\n\n") || head.ends_with(b"\n\r\n")) {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(DialError::MalformedResponse(format!(
                "response head exceeds {} bytes",
                MAX_RESPONSE_HEAD
            )));
        }
        match conn.read_u8().await {
            Ok(byte) => head.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(DialError::MalformedResponse(
                    "proxy closed the connection before answering".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Split `HTTP/1.1 200 Connection established` into code and status text
fn parse_status_line(head: &str) -> Result<(u16, String), DialError> {
    let line = head.lines().next().unwrap_or_default().trim();
    let malformed = || DialError::MalformedResponse(line.to_string());

    let (version, rest) = line.split_once(' ').ok_or_else(malformed)?;
    if !version.starts_with("HTTP/1.") {
        return Err(malformed());
    }

    let rest = rest.trim_start();
    let code_str = rest.split(' ').next().unwrap_or_default();
    if code_str.len() != 3 {
        return Err(malformed());
    }
    let code: u16 = code_str.parse().map_err(|_| malformed())?;

    Ok((code, rest.to_string()))
}
