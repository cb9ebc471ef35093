//! Sources of proxy log lines

use crate::config::IngestSource;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// A stream of log lines; `None` means the stream ended
#[async_trait]
pub trait LineSource: Send {
    async fn next_line(&mut self) -> Result<Option<String>>;
}

/// Lines from any buffered reader, ending at EOF
pub struct ReaderSource<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> LineSource for ReaderSource<R> {
    async fn next_line(&mut self) -> Result<Option<String>> {
        // partial bytes from a cancelled read stay in `buf`
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

/// Accept a single connection on `listener` and read lines from it.
///
/// The listener is dropped once the proxy has connected.
pub async fn accept_tcp_source(listener: TcpListener) -> Result<ReaderSource<BufReader<TcpStream>>> {
    info!(address = %listener.local_addr()?, "waiting for proxy log connection");
    let (stream, peer) = listener.accept().await?;
    info!(%peer, "proxy log connection accepted");
    Ok(ReaderSource::new(BufReader::new(stream)))
}

/// Follows a growing file like `tail -f`.
///
/// At end of file it sleeps for the poll interval and tries again. When the
/// file is truncated or replaced (log rotation) it reopens the path and
/// continues from the beginning of the new file.
pub struct FileFollower {
    path: PathBuf,
    reader: BufReader<File>,
    position: u64,
    identity: Option<u64>,
    poll_interval: Duration,
    buf: Vec<u8>,
}

impl FileFollower {
    /// Open `path`; unless `from_start`, existing content is skipped
    pub async fn open(path: impl AsRef<Path>, from_start: bool, poll_interval: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).await?;
        let metadata = file.metadata().await?;
        let position = if from_start {
            0
        } else {
            file.seek(SeekFrom::End(0)).await?
        };
        info!(path = %path.display(), position, "following log file");

        Ok(Self {
            path,
            reader: BufReader::new(file),
            position,
            identity: file_identity(&metadata),
            poll_interval,
            buf: Vec::new(),
        })
    }

    /// Byte offset of the next unread byte in the current file
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reopen the path if it was rotated away or truncated under us
    async fn check_rotation(&mut self) -> Result<()> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // mid-rotation; keep draining the old handle
                debug!(path = %self.path.display(), "log file missing, waiting");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let replaced = file_identity(&metadata) != self.identity;
        let truncated = metadata.len() < self.position;
        if replaced || truncated {
            warn!(
                path = %self.path.display(),
                replaced,
                truncated,
                "log file rotated, reopening"
            );
            let file = File::open(&self.path).await?;
            self.identity = file_identity(&file.metadata().await?);
            self.reader = BufReader::new(file);
            self.position = 0;
            self.buf.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl LineSource for FileFollower {
    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            self.position += n as u64;

            if self.buf.ends_with(b"\n") {
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                return Ok(Some(line));
            }

            if n == 0 {
                // at EOF, possibly holding a partial line until the writer finishes it
                self.check_rotation().await?;
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Open the configured log source
pub async fn open_source(source: &IngestSource) -> Result<Box<dyn LineSource>> {
    match source {
        IngestSource::File {
            path,
            from_start,
            poll_interval_ms,
        } => {
            let follower =
                FileFollower::open(path, *from_start, Duration::from_millis(*poll_interval_ms))
                    .await
                    .map_err(|e| {
                        EngineError::ingest(format!("cannot open {}: {}", path.display(), e))
                    })?;
            Ok(Box::new(follower))
        }
        IngestSource::Tcp { bind_address } => {
            let listener = TcpListener::bind(bind_address).await?;
            Ok(Box::new(accept_tcp_source(listener).await?))
        }
    }
}
