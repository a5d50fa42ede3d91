//! Byte pipeline
//!
//! A copy reads from a [`ByteSource`] built in a fixed order around the raw
//! socket half: rate limiting first, then tapping. The counting copy then
//! writes each chunk to the destination.

use super::Direction;
use crate::limit::RateLimiter;
use crate::tee::TeeSink;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Copy buffer size
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// A readable stage of the pipeline
#[async_trait]
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes, 0 at end of stream
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// The unwrapped reader
pub struct Raw<R>(pub R);

#[async_trait]
impl<R> ByteSource for Raw<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }
}

/// Charges every byte read against the shared bucket
pub struct RateLimited<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> RateLimited<S> {
    pub fn new(inner: S, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<S: ByteSource> ByteSource for RateLimited<S> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = buf.len().min(self.limiter.max_chunk());
        let n = self.inner.read_chunk(&mut buf[..max]).await?;
        self.limiter.acquire(n).await;
        Ok(n)
    }
}

/// Copies every byte read to a sink, best effort
pub struct Teed<S> {
    inner: S,
    sink: Arc<TeeSink>,
    direction: Direction,
    warned: bool,
}

impl<S> Teed<S> {
    pub fn new(inner: S, sink: Arc<TeeSink>, direction: Direction) -> Self {
        Self {
            inner,
            sink,
            direction,
            warned: false,
        }
    }
}

#[async_trait]
impl<S: ByteSource> ByteSource for Teed<S> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read_chunk(buf).await?;
        if n > 0 {
            if let Err(e) = self.sink.write(&buf[..n]).await {
                if !self.warned {
                    warn!("Tee write to {} failed ({}): {}", self.sink.name(), self.direction, e);
                    self.warned = true;
                }
            }
        }
        Ok(n)
    }
}

/// Wrap `reader` with the stages configured for this direction
pub fn compose<R>(
    reader: R,
    limiter: Option<Arc<RateLimiter>>,
    tee: Option<Arc<TeeSink>>,
    direction: Direction,
) -> Box<dyn ByteSource>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    match (limiter, tee) {
        (None, None) => Box::new(Raw(reader)),
        (Some(limiter), None) => Box::new(RateLimited::new(Raw(reader), limiter)),
        (None, Some(sink)) => Box::new(Teed::new(Raw(reader), sink, direction)),
        (Some(limiter), Some(sink)) => Box::new(Teed::new(
            RateLimited::new(Raw(reader), limiter),
            sink,
            direction,
        )),
    }
}

/// Copy until end of stream or error
///
/// `transferred` is bumped after every successful write, so it stays exact
/// even if this future is dropped mid-stream.
pub async fn copy<S, W>(src: &mut S, dst: &mut W, transferred: &mut u64) -> io::Result<()>
where
    S: ByteSource + ?Sized,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = src.read_chunk(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        let mut written = 0;
        while written < n {
            let m = dst.write(&buf[written..n]).await?;
            if m == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += m;
            *transferred += m as u64;
        }
    }
}
