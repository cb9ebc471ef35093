//! Attributes logged byte counts to tracked users

use crate::error::{EngineError, Result};
use crate::metrics::UsageMetrics;
use crate::parser::parse_line;
use crate::registry::UserRegistry;
use crate::source::LineSource;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pause before reopening a log source after a recoverable error
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// How a single log line was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Bytes were added to a tracked user
    Accounted { username: String, total_usage: u64 },
    /// No usage entry on the line
    NoMatch,
    /// Entry markers present but the count did not parse
    Malformed,
    /// Entry for a user the registry does not track
    UnknownUser { username: String },
}

impl LineOutcome {
    fn label(&self) -> &'static str {
        match self {
            LineOutcome::Accounted { .. } => "matched",
            LineOutcome::NoMatch => "skipped",
            LineOutcome::Malformed => "malformed",
            LineOutcome::UnknownUser { .. } => "unknown_user",
        }
    }
}

pub struct IngestLoop {
    registry: Arc<UserRegistry>,
    metrics: UsageMetrics,
}

impl IngestLoop {
    pub fn new(registry: Arc<UserRegistry>, metrics: UsageMetrics) -> Self {
        Self { registry, metrics }
    }

    /// Parse one line and credit its bytes. Never creates users.
    pub fn process_line(&self, line: &str) -> LineOutcome {
        let outcome = match parse_line(line) {
            Ok(None) => LineOutcome::NoMatch,
            Err(e) => {
                warn!(error = %e, line = line.trim_end(), "skipping malformed log line");
                LineOutcome::Malformed
            }
            Ok(Some(entry)) => match self.registry.add_usage(&entry.username, entry.bytes) {
                Ok(total_usage) => {
                    self.metrics.record_bytes(entry.bytes);
                    trace!(user = %entry.username, bytes = entry.bytes, total_usage, "accounted usage");
                    LineOutcome::Accounted {
                        username: entry.username,
                        total_usage,
                    }
                }
                Err(_) => {
                    debug!(user = %entry.username, "usage for untracked user ignored");
                    LineOutcome::UnknownUser {
                        username: entry.username,
                    }
                }
            },
        };
        self.metrics.record_line(outcome.label());
        outcome
    }

    /// Consume `source` until cancelled.
    ///
    /// The end of the stream is an error: the service cannot account usage
    /// without it.
    pub async fn run<S: LineSource + ?Sized>(
        &self,
        source: &mut S,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("usage ingestion started");
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("usage ingestion stopped");
                    return Ok(());
                }
                line = source.next_line() => line?,
            };

            match line {
                Some(line) => {
                    self.process_line(&line);
                }
                None => return Err(EngineError::ingest("log stream closed")),
            }
        }
    }

    /// Like [`IngestLoop::run`], reopening the source through `open` after
    /// an error that is not fatal (an I/O error on the file, a failed bind).
    ///
    /// A closed stream or a source that cannot be opened at all is returned.
    pub async fn run_reopening<F, Fut>(&self, mut open: F, shutdown: CancellationToken) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Box<dyn LineSource>>>,
    {
        loop {
            let attempt = async {
                let mut source = open().await?;
                self.run(&mut *source, shutdown.clone()).await
            };
            let result = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = attempt => result,
            };

            match result {
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, "log source failed, reopening");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(REOPEN_DELAY) => {}
                    }
                }
                other => return other,
            }
        }
    }
}
