//! Execution trace capture.
//!
//! A [`TraceSink`] is plugged into the tracing subscriber as the writer of a
//! JSON layer at process start. Its [`TraceSink::capture_filter`] keeps that
//! layer disabled until a [`TraceCapture`] attaches an output file, and
//! disables it again once the capture is stopped.

use chrono::Utc;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Level, Metadata};
use tracing_subscriber::filter::{FilterFn, LevelFilter};
use tracing_subscriber::fmt::MakeWriter;

/// Fixed name of the trace output file.
pub const TRACE_FILE_NAME: &str = "trace.out";

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to create trace file {}: {source}", path.display())]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write trace file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("a trace capture is already active")]
    AlreadyActive,
    #[error("trace capture is not active")]
    NotActive,
}

#[derive(Default)]
struct SinkState {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    bytes_written: u64,
}

/// Shared destination for trace records.
#[derive(Clone, Default)]
pub struct TraceSink {
    inner: Arc<Mutex<SinkState>>,
    // Mirrors `writer.is_some()` so the layer filter never takes the lock.
    active: Arc<AtomicBool>,
}

/// Snapshot served by the diagnostic listener.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TraceStatus {
    pub active: bool,
    pub path: Option<PathBuf>,
    pub bytes_written: u64,
}

impl TraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Per-layer filter for the JSON trace layer: DEBUG and above, and only
    /// while a capture is running, so idle events are never formatted.
    pub fn capture_filter(&self) -> FilterFn<impl Fn(&Metadata<'_>) -> bool> {
        let active = Arc::clone(&self.active);
        tracing_subscriber::filter::filter_fn(move |meta| {
            *meta.level() <= Level::DEBUG && active.load(Ordering::Acquire)
        })
        .with_max_level_hint(LevelFilter::DEBUG)
    }

    pub fn status(&self) -> TraceStatus {
        let state = self.lock();
        TraceStatus {
            active: state.writer.is_some(),
            path: state.path.clone(),
            bytes_written: state.bytes_written,
        }
    }

    /// Create `dir/trace.out` and start routing trace records into it.
    pub fn start(&self, dir: &Path) -> Result<TraceCapture, TraceError> {
        let path = dir.join(TRACE_FILE_NAME);
        let mut state = self.lock();
        if state.writer.is_some() {
            return Err(TraceError::AlreadyActive);
        }

        let file = File::create(&path).map_err(|source| TraceError::Create {
            path: path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);

        let header = serde_json::json!({
            "record": "trace_start",
            "pid": std::process::id(),
            "started_at": Utc::now().to_rfc3339(),
        });
        let line = format!("{header}\n");
        writer
            .write_all(line.as_bytes())
            .map_err(|source| TraceError::Write {
                path: path.clone(),
                source,
            })?;

        state.writer = Some(writer);
        state.path = Some(path.clone());
        state.bytes_written = line.len() as u64;
        self.active.store(true, Ordering::Release);

        Ok(TraceCapture {
            sink: self.clone(),
            path,
        })
    }

    /// Detach the open file, if any. Records written after this are dropped.
    fn detach(&self) -> Option<(BufWriter<File>, u64)> {
        let mut state = self.lock();
        let writer = state.writer.take()?;
        self.active.store(false, Ordering::Release);
        Some((writer, state.bytes_written))
    }
}

impl<'a> MakeWriter<'a> for TraceSink {
    type Writer = TraceWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TraceWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Per-record writer handed out by [`TraceSink`].
pub struct TraceWriter {
    inner: Arc<Mutex<SinkState>>,
}

impl Write for TraceWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(writer) = state.writer.as_mut() {
            writer.write_all(buf)?;
            state.bytes_written += buf.len() as u64;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match state.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// Handle on a running capture. Stopping it detaches the file from the sink,
/// flushes it and closes it. Clones share the capture; only one stop wins.
#[derive(Clone)]
pub struct TraceCapture {
    sink: TraceSink,
    path: PathBuf,
}

/// What a stopped capture wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSummary {
    pub path: PathBuf,
    pub bytes_written: u64,
}

impl TraceCapture {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop capturing, then close the file on the blocking pool.
    ///
    /// Calling this on an already stopped capture returns
    /// [`TraceError::NotActive`] and touches nothing.
    pub async fn stop(&self) -> Result<TraceSummary, TraceError> {
        let (writer, bytes_written) = self.sink.detach().ok_or(TraceError::NotActive)?;

        let path = self.path.clone();
        let bytes_written = tokio::task::spawn_blocking(move || close(writer, bytes_written, &path))
            .await
            .map_err(|e| TraceError::Write {
                path: self.path.clone(),
                source: std::io::Error::other(e),
            })??;

        self.sink.lock().bytes_written = bytes_written;
        tracing::info!(
            path = %self.path.display(),
            bytes_written,
            "trace capture stopped"
        );

        Ok(TraceSummary {
            path: self.path.clone(),
            bytes_written,
        })
    }
}

/// Write the footer record, flush and fsync. Returns the final byte count.
fn close(mut writer: BufWriter<File>, bytes_written: u64, path: &Path) -> Result<u64, TraceError> {
    let write_err = |source| TraceError::Write {
        path: path.to_path_buf(),
        source,
    };

    let footer = serde_json::json!({
        "record": "trace_stop",
        "stopped_at": Utc::now().to_rfc3339(),
    });
    let line = format!("{footer}\n");
    writer.write_all(line.as_bytes()).map_err(write_err)?;

    let file = writer
        .into_inner()
        .map_err(|e| write_err(e.into_error()))?;
    file.sync_all().map_err(write_err)?;

    Ok(bytes_written + line.len() as u64)
}
