//! Traffic tapping
//!
//! Provides:
//! - Sinks receiving a raw copy of one relay direction
//! - Stdout (`-`) or file destinations
//! - Shared sinks when both directions name the same path

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Path denoting standard output
pub const STDOUT_PATH: &str = "-";

/// Writer behind a sink
pub type SinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens file-backed sinks
///
/// Abstracted so tests can observe how many times a path gets opened.
pub trait SinkOpener {
    /// Open `path` for writing
    fn open(&self, path: &Path) -> io::Result<SinkWriter>;
}

/// Opens real files, creating them if needed and appending otherwise
#[derive(Debug, Default, Clone, Copy)]
pub struct FileOpener;

impl SinkOpener for FileOpener {
    fn open(&self, path: &Path) -> io::Result<SinkWriter> {
        // Existing files keep their permission bits
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

/// Where a sink writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Stdout,
    File,
}

/// A destination receiving copies of relayed bytes
///
/// Writes from concurrent sessions are serialized per chunk.
pub struct TeeSink {
    name: String,
    kind: SinkKind,
    writer: Mutex<SinkWriter>,
}

impl TeeSink {
    /// Wrap an arbitrary writer
    pub fn new(name: impl Into<String>, kind: SinkKind, writer: SinkWriter) -> Self {
        Self {
            name: name.into(),
            kind,
            writer: Mutex::new(writer),
        }
    }

    /// Sink writing to standard output
    pub fn stdout() -> Self {
        Self::new(STDOUT_PATH, SinkKind::Stdout, Box::new(tokio::io::stdout()))
    }

    /// Path or `-` this sink was opened from
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    /// Append a chunk
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await
    }

    /// Flush, and close unless this is stdout
    pub async fn shutdown(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        match self.kind {
            SinkKind::Stdout => writer.flush().await,
            SinkKind::File => writer.shutdown().await,
        }
    }
}

impl fmt::Debug for TeeSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeSink")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Open a sink: empty means none, `-` means stdout, anything else is a file
pub fn open_sink(path: &str, opener: &dyn SinkOpener) -> io::Result<Option<Arc<TeeSink>>> {
    match path {
        "" => Ok(None),
        STDOUT_PATH => Ok(Some(Arc::new(TeeSink::stdout()))),
        _ => {
            let writer = opener.open(Path::new(path))?;
            info!("Tee output opened: {}", path);
            Ok(Some(Arc::new(TeeSink::new(path, SinkKind::File, writer))))
        }
    }
}

/// Tee sinks for the sent (client to remote) and received (remote to client)
/// directions
#[derive(Debug, Clone, Default)]
pub struct TeeSinks {
    pub sent: Option<Arc<TeeSink>>,
    pub received: Option<Arc<TeeSink>>,
}

impl TeeSinks {
    /// No tapping
    pub fn none() -> Self {
        Self::default()
    }

    /// Open both sinks from real files
    pub fn open(sent_path: &str, received_path: &str) -> io::Result<Self> {
        Self::open_with(sent_path, received_path, &FileOpener)
    }

    /// Open both sinks through `opener`
    ///
    /// Identical paths share one sink. If the received sink fails to open,
    /// the sent sink is closed before the error is returned.
    pub fn open_with(
        sent_path: &str,
        received_path: &str,
        opener: &dyn SinkOpener,
    ) -> io::Result<Self> {
        let sent = open_sink(sent_path, opener)?;

        let received = if !received_path.is_empty() && received_path == sent_path {
            sent.clone()
        } else {
            match open_sink(received_path, opener) {
                Ok(sink) => sink,
                Err(e) => {
                    if let Some(sink) = sent {
                        debug!("Closing tee output {} after failure", sink.name());
                        drop(sink);
                    }
                    return Err(e);
                }
            }
        };

        Ok(Self { sent, received })
    }

    /// True if neither direction is tapped
    pub fn is_empty(&self) -> bool {
        self.sent.is_none() && self.received.is_none()
    }

    /// Uniquely held sinks, shared paths listed once
    fn distinct(&self) -> Vec<&Arc<TeeSink>> {
        let mut sinks: Vec<&Arc<TeeSink>> = Vec::with_capacity(2);
        for sink in [&self.sent, &self.received].into_iter().flatten() {
            if !sinks.iter().any(|s| Arc::ptr_eq(s, sink)) {
                sinks.push(sink);
            }
        }
        sinks
    }

    /// Flush and close every sink once
    pub async fn shutdown(&self) -> io::Result<()> {
        for sink in self.distinct() {
            sink.shutdown().await?;
            debug!("Tee output closed: {}", sink.name());
        }
        Ok(())
    }
}
