//! # Bridge log correlation
//!
//! ## Responsibility
//! Buffers bridge log lines per meeting so the poll loop can attach them to
//! the matching stats session.
//!
//! The bridge log only carries a truncated `meeting_id`, so buckets are keyed
//! by that prefix and [`LogCorrelator::take`] matches a full meeting id by
//! `starts_with`. A prefix collision hands one meeting's logs to another;
//! with UUID-derived ids that is accepted.
//!
//! ## Line grammar
//! - A line starting with [`RECORD_MARKER`] opens a record. Its meeting id is
//!   the first `meeting_id=<token>` attribute after `[` and `]` are stripped.
//!   A record line without one clears the current meeting and is dropped.
//! - Any other line continues the previous record and inherits its meeting.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::error::{PushError, Result};

/// Prefix of a line that starts a new log record.
pub const RECORD_MARKER: &str = "JVB ";

/// Buckets idle longer than this are dropped.
pub const RETENTION: Duration = Duration::from_secs(60);

const MEETING_ID_ATTR: &str = "meeting_id=";

/// Correlator shared between the tailer task and the poll loop.
pub type SharedCorrelator = Arc<Mutex<LogCorrelator>>;

#[derive(Debug)]
struct LogBucket {
    lines: Vec<String>,
    last_access: Instant,
}

/// Per-meeting buffer of recent log lines.
#[derive(Debug)]
pub struct LogCorrelator {
    current_meeting: Option<String>,
    buckets: HashMap<String, LogBucket>,
    retention: Duration,
}

impl Default for LogCorrelator {
    fn default() -> Self {
        Self::new(RETENTION)
    }
}

impl LogCorrelator {
    pub fn new(retention: Duration) -> Self {
        Self {
            current_meeting: None,
            buckets: HashMap::new(),
            retention,
        }
    }

    /// Wrap a default correlator for sharing across tasks.
    pub fn shared() -> SharedCorrelator {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Buffer one line, then evict buckets idle past the retention window.
    pub fn append(&mut self, line: &str, now: Instant) {
        if let Some(meeting_id) = self.resolve_meeting(line) {
            let bucket = self
                .buckets
                .entry(meeting_id)
                .or_insert_with(|| LogBucket {
                    lines: Vec::new(),
                    last_access: now,
                });
            bucket.lines.push(line.to_string());
            bucket.last_access = now;
        }
        self.evict(now);
    }

    /// Drain the lines of the bucket whose key prefixes `full_meeting_id`.
    ///
    /// Returns an empty vector when no bucket matches. If several keys match,
    /// the first one found wins.
    pub fn take(&mut self, full_meeting_id: &str) -> Vec<String> {
        self.buckets
            .iter_mut()
            .find(|(key, _)| full_meeting_id.starts_with(key.as_str()))
            .map(|(_, bucket)| std::mem::take(&mut bucket.lines))
            .unwrap_or_default()
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn resolve_meeting(&mut self, line: &str) -> Option<String> {
        if line.starts_with(RECORD_MARKER) {
            self.current_meeting = parse_meeting_id(line);
        }
        self.current_meeting.clone()
    }

    fn evict(&mut self, now: Instant) {
        let retention = self.retention;
        self.buckets.retain(|meeting_id, bucket| {
            let keep = now.saturating_duration_since(bucket.last_access) <= retention;
            if !keep {
                debug!(meeting_id = %meeting_id, "removing stale log bucket");
            }
            keep
        });
    }
}

/// Extract the `meeting_id` attribute from a record line.
///
/// An empty value counts as absent, since an empty key would prefix-match
/// every meeting.
pub fn parse_meeting_id(line: &str) -> Option<String> {
    line.replace(['[', ']'], "")
        .split(' ')
        .find_map(|attr| attr.strip_prefix(MEETING_ID_ATTR))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Follows a log file and feeds complete lines into a [`LogCorrelator`].
pub struct LogTailer {
    path: PathBuf,
    correlator: SharedCorrelator,
    poll_interval: Duration,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, correlator: SharedCorrelator) -> Self {
        Self {
            path: path.into(),
            correlator,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Override how often the file is checked for new data (default 250 ms).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Tail the file until an I/O error occurs.
    ///
    /// Starts at the current end of the file. If the file shrinks it is
    /// treated as truncated and read again from the start. If the path now
    /// names a different file (rotation), the rest of the old file is read
    /// and the new one is followed from its start.
    ///
    /// # Errors
    /// Returns `PushError::LogTail` on the first open/read failure, when the
    /// path disappears, or when the correlator lock is poisoned. Tailing is
    /// not retried.
    pub async fn run(self) -> Result<()> {
        let path = self.path.display().to_string();
        let io_err = |e: std::io::Error| PushError::LogTail {
            path: path.clone(),
            detail: e.to_string(),
        };

        let mut file = tokio::fs::File::open(&self.path).await.map_err(io_err)?;
        let mut identity = file_identity(&file.metadata().await.map_err(io_err)?);
        let mut offset = file.seek(SeekFrom::End(0)).await.map_err(io_err)?;
        info!(path = %path, offset, "tailing bridge log");

        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; 8192];
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let current = tokio::fs::metadata(&self.path).await.map_err(|e| {
                warn!(path = %path, error = %e, "log file is gone");
                io_err(e)
            })?;
            let current_identity = file_identity(&current);
            if current_identity != identity {
                read_available(&mut file, &mut chunk, &mut pending)
                    .await
                    .map_err(io_err)?;
                self.drain_lines(&mut pending, &path)?;
                pending.clear();

                warn!(path = %path, "log file rotated, following the new file from the start");
                file = tokio::fs::File::open(&self.path).await.map_err(io_err)?;
                identity = current_identity;
                offset = 0;
            }

            let len = file.metadata().await.map_err(io_err)?.len();
            if len < offset {
                warn!(path = %path, "log file truncated, reading from start");
                offset = file.seek(SeekFrom::Start(0)).await.map_err(io_err)?;
                pending.clear();
            }

            offset += read_available(&mut file, &mut chunk, &mut pending)
                .await
                .map_err(io_err)?;
            self.drain_lines(&mut pending, &path)?;
        }
    }

    fn drain_lines(&self, pending: &mut Vec<u8>, path: &str) -> Result<()> {
        let Some(last_newline) = pending.iter().rposition(|b| *b == b'\n') else {
            return Ok(());
        };
        let complete: Vec<u8> = pending.drain(..=last_newline).collect();
        let text = String::from_utf8_lossy(&complete);
        let now = Instant::now();

        let Ok(mut correlator) = self.correlator.lock() else {
            warn!(path = %path, "log correlator lock poisoned, stopping log tail");
            return Err(PushError::LogTail {
                path: path.to_string(),
                detail: "log correlator lock poisoned".to_string(),
            });
        };
        for line in text.lines() {
            correlator.append(line, now);
        }
        Ok(())
    }
}

/// Read everything currently available into `pending`, returning the byte count.
async fn read_available(
    file: &mut tokio::fs::File,
    chunk: &mut [u8],
    pending: &mut Vec<u8>,
) -> std::io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = file.read(chunk).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        pending.extend_from_slice(&chunk[..n]);
    }
}

/// Device and inode of a file, used to notice rotation.
#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}
