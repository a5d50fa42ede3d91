//! Forwarding session
//!
//! A session owns one accepted connection, dials the remote for it and runs
//! one copy task per direction. The first task to finish cancels the other;
//! the byte totals are logged once both have reported back.

use super::pipe::{compose, copy};
use super::{Direction, RelayContext, RelayError, Transfer};
use crate::proxy::{Dial, Network};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Dialing,
    Relaying,
    Completing,
    Closed,
}

/// Report sent by a copy task when it stops
#[derive(Debug)]
struct Completion {
    direction: Direction,
    bytes: u64,
    error: Option<io::Error>,
}

/// One accepted connection and its outbound counterpart
pub struct Session {
    inbound: TcpStream,
    peer: SocketAddr,
    remote: Arc<str>,
    ctx: Arc<RelayContext>,
}

impl Session {
    /// Wrap a freshly accepted connection
    pub fn new(inbound: TcpStream, peer: SocketAddr, remote: Arc<str>, ctx: Arc<RelayContext>) -> Self {
        Self {
            inbound,
            peer,
            remote,
            ctx,
        }
    }

    /// Dial the remote and relay until both directions are done
    ///
    /// On dial failure the inbound connection is closed and nothing is
    /// relayed or logged beyond the error.
    pub async fn run(self) -> Result<Transfer, RelayError> {
        let Session {
            inbound,
            peer,
            remote,
            ctx,
        } = self;
        let mut state = SessionState::Accepted;
        advance(peer, &mut state, SessionState::Dialing);

        let outbound = match ctx.dialer.dial(Network::Tcp, &remote).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Error dialing {} via {} for {}: {}", remote, ctx.dialer, peer, e);
                drop(inbound);
                advance(peer, &mut state, SessionState::Closed);
                return Err(e.into());
            }
        };
        debug!("Connected {} to {}", peer, remote);
        advance(peer, &mut state, SessionState::Relaying);

        let (inbound_read, inbound_write) = inbound.into_split();
        let (outbound_read, outbound_write) = outbound.into_split();

        let cancel = CancellationToken::new();
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(2);

        tokio::spawn(pump(
            Direction::Sent,
            inbound_read,
            outbound_write,
            Arc::clone(&ctx),
            cancel.clone(),
            done_tx.clone(),
        ));
        tokio::spawn(pump(
            Direction::Received,
            outbound_read,
            inbound_write,
            Arc::clone(&ctx),
            cancel.clone(),
            done_tx,
        ));

        let mut transfer = Transfer::default();

        // First report tears down the surviving direction
        if let Some(done) = done_rx.recv().await {
            record(&mut transfer, done, peer);
        }
        advance(peer, &mut state, SessionState::Completing);
        cancel.cancel();

        if let Some(done) = done_rx.recv().await {
            record(&mut transfer, done, peer);
        }
        advance(peer, &mut state, SessionState::Closed);

        info!(
            "Connection complete {} -> {}: sent {}, received {}",
            peer,
            remote,
            ctx.format_bytes(transfer.sent),
            ctx.format_bytes(transfer.received)
        );

        Ok(transfer)
    }
}

fn advance(peer: SocketAddr, state: &mut SessionState, next: SessionState) {
    trace!("Session {} {:?} -> {:?}", peer, state, next);
    *state = next;
}

fn record(transfer: &mut Transfer, done: Completion, peer: SocketAddr) {
    if let Some(e) = &done.error {
        debug!("Copy error ({}) for {}: {}", done.direction, peer, e);
    }
    match done.direction {
        Direction::Sent => transfer.sent = done.bytes,
        Direction::Received => transfer.received = done.bytes,
    }
}

/// Copy one direction until end of stream, error or cancellation
///
/// Both halves are dropped before the completion is reported, so the
/// session only logs once its sockets are released.
async fn pump<R>(
    direction: Direction,
    src: R,
    mut dst: OwnedWriteHalf,
    ctx: Arc<RelayContext>,
    cancel: CancellationToken,
    done: mpsc::Sender<Completion>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut source = compose(src, ctx.rate_limiter.clone(), ctx.tee_for(direction), direction);
    let mut bytes = 0u64;

    let error = tokio::select! {
        result = copy(source.as_mut(), &mut dst, &mut bytes) => result.err(),
        _ = cancel.cancelled() => None,
    };

    drop(source);
    drop(dst);

    let _ = done
        .send(Completion {
            direction,
            bytes,
            error,
        })
        .await;
}
