//! Listener manager

use super::{RelayContext, RelayError, Session};
use crate::config::{PortMapping, RelayConfig};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Pause after a failed accept, e.g. when out of file descriptors
pub const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(50);

/// Source of inbound connections
#[async_trait]
pub trait Accept: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Runs every configured port mapping
pub struct Relay {
    mappings: Vec<PortMapping>,
    ctx: Arc<RelayContext>,
}

impl Relay {
    /// Build the relay from its configuration
    pub fn new(config: RelayConfig) -> Self {
        let RelayConfig {
            mappings,
            dialer,
            rate_limiter,
            tee,
            raw_bytes,
        } = config;

        Self {
            mappings,
            ctx: Arc::new(RelayContext {
                dialer,
                rate_limiter,
                tee,
                raw_bytes,
            }),
        }
    }

    /// Shared session settings
    pub fn context(&self) -> Arc<RelayContext> {
        Arc::clone(&self.ctx)
    }

    pub fn mappings(&self) -> &[PortMapping] {
        &self.mappings
    }

    /// Serve all mappings concurrently
    ///
    /// Returns once every listen loop has exited, with the failures that
    /// ended them.
    pub async fn run(self) -> Vec<RelayError> {
        let mut loops = JoinSet::new();
        for mapping in self.mappings {
            loops.spawn(listen(mapping, Arc::clone(&self.ctx)));
        }

        let mut failures = Vec::new();
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(e) => {
                    error!("Listener task failed: {}", e);
                    failures.push(RelayError::Task(e.to_string()));
                }
            }
        }
        failures
    }
}

/// Bind one mapping and serve it
pub async fn listen(mapping: PortMapping, ctx: Arc<RelayContext>) -> Result<(), RelayError> {
    let listener = match TcpListener::bind(&mapping.listen).await {
        Ok(listener) => listener,
        Err(source) => {
            error!("Error listening on {}: {}", mapping.listen, source);
            return Err(RelayError::Bind {
                addr: mapping.listen,
                source,
            });
        }
    };

    info!("Forwarding from {} -> {}", mapping.listen, mapping.remote);
    serve(listener, mapping.remote, ctx).await
}

/// Accept connections forever, one session task each
pub async fn serve<L: Accept>(
    mut listener: L,
    remote: String,
    ctx: Arc<RelayContext>,
) -> Result<(), RelayError> {
    let remote: Arc<str> = remote.into();
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("New connection from {} on {}", peer, local);
                stream.set_nodelay(true).ok();

                let session = Session::new(stream, peer, Arc::clone(&remote), Arc::clone(&ctx));
                tokio::spawn(async move {
                    // Failures are logged by the session itself
                    let _ = session.run().await;
                });
            }
            Err(e) => {
                error!("Error accepting connection on {}: {}", local, e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Dialer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Listener whose first `failures` accepts fail
    struct FlakyListener {
        inner: TcpListener,
        failures: usize,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Accept for FlakyListener {
        async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(io::Error::new(io::ErrorKind::Other, "too many open files"));
            }
            Accept::accept(&mut self.inner).await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    #[tokio::test]
    async fn test_accept_error_is_retried() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = inner.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let listener = FlakyListener {
            inner,
            failures: 1,
            attempts: Arc::clone(&attempts),
        };

        let start = Instant::now();
        let ctx = Arc::new(RelayContext::new(Dialer::direct()));
        let server = tokio::spawn(serve(listener, remote, ctx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert!(start.elapsed() >= ACCEPT_ERROR_DELAY);
        assert!(!server.is_finished(), "accept loop must keep running");
        server.abort();
    }

    #[tokio::test]
    async fn test_bind_failure_ends_only_that_mapping() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_addr = taken.local_addr().unwrap().to_string();

        let relay = Relay::new(RelayConfig::new(vec![
            PortMapping::new(taken_addr.clone(), "127.0.0.1:9"),
            // Documentation range, never assigned to a local interface
            PortMapping::new("192.0.2.1:0", "127.0.0.1:9"),
        ]));
        assert_eq!(relay.mappings().len(), 2);

        let failures = relay.run().await;
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|f| matches!(f, RelayError::Bind { .. })));
        assert!(failures
            .iter()
            .any(|f| matches!(f, RelayError::Bind { addr, .. } if *addr == taken_addr)));
    }

    #[tokio::test]
    async fn test_context_carries_config() {
        let relay = Relay::new(
            RelayConfig::new(Vec::new())
                .with_dialer(Dialer::direct())
                .with_raw_bytes(true),
        );
        let ctx = relay.context();
        assert!(ctx.raw_bytes);
        assert!(ctx.rate_limiter.is_none());
        assert!(ctx.tee.is_empty());

        // No mappings means nothing to wait for
        assert!(relay.run().await.is_empty());
    }
}
