//! Rotating log-file exporter
//!
//! Each record's payload is written as one line. Files live under
//! `{path}/{time bucket}/{prefix}_{source}.log`, where the source is the
//! record's source id in per-source mode and `all` otherwise.
//!
//! Writes are handed to a per-file writer task through a bounded queue. When
//! the time bucket changes, a new file and writer are swapped in atomically;
//! the old writer drains what it already queued and exits.
//!
//! Files idle for `idle_close_secs` are closed by a sweep that runs from the
//! write path at most once a minute; the next write to that source reopens it.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Local};
use conduit_protocol::Record;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::common::{Result, SinkError};
use crate::exporter::{Exporter, ExporterBase};
use crate::settings::{FileRotation, FileSettings};

const SHARED_SOURCE: &str = "all";

/// Minimum time between idle sweeps
const IDLE_SWEEP_MS: u64 = 60_000;

/// Directory bucket for a wall-clock time
pub fn time_bucket(rotation: FileRotation, now_ms: u64) -> String {
    let now: DateTime<Local> = DateTime::from_timestamp_millis(now_ms as i64)
        .unwrap_or_default()
        .with_timezone(&Local);
    let format = match rotation {
        FileRotation::Hourly => "%Y-%m-%d/%H",
        FileRotation::Daily => "%Y-%m-%d",
    };
    now.format(format).to_string()
}

/// Keep file names to a safe character set
fn sanitize(source: &str) -> String {
    let cleaned: String = source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        SHARED_SOURCE.to_string()
    } else {
        cleaned
    }
}

/// One open file and the queue feeding its writer task
struct FileChain {
    bucket: String,
    tx: mpsc::Sender<BytesMut>,
}

struct SourceFile {
    source: String,
    active: ArcSwap<FileChain>,
    last_write_ms: AtomicU64,
}

pub struct FileExporter {
    base: ExporterBase,
    settings: FileSettings,
    files: DashMap<String, Arc<SourceFile>>,
    tracker: TaskTracker,
    running: AtomicBool,
    last_sweep_ms: AtomicU64,
}

impl FileExporter {
    pub fn new(base: ExporterBase, settings: FileSettings) -> Self {
        Self {
            base,
            settings,
            files: DashMap::new(),
            tracker: TaskTracker::new(),
            running: AtomicBool::new(false),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Path a record from `source` written at `now_ms` goes to
    pub fn file_path(&self, source: &str, now_ms: u64) -> PathBuf {
        self.settings
            .path
            .join(time_bucket(self.settings.rotation, now_ms))
            .join(format!("{}_{}.log", self.settings.prefix, sanitize(source)))
    }

    /// Number of files currently open
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    fn open_chain(&self, source: &str, now_ms: u64) -> Result<FileChain> {
        let bucket = time_bucket(self.settings.rotation, now_ms);
        let path = self.file_path(source, now_ms);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = File::options().create(true).append(true).open(&path)?;
        tracing::debug!(exporter = %self.base.name(), path = %path.display(), "opened log file");

        let (tx, rx) = mpsc::channel(self.settings.queue_size.max(1));
        let flush_interval = Duration::from_millis(self.settings.flush_interval_ms.max(1));
        self.tracker
            .spawn(run_writer(path, rx, BufWriter::new(file), flush_interval));
        Ok(FileChain { bucket, tx })
    }

    fn source_file(&self, source: &str, now_ms: u64) -> Result<Arc<SourceFile>> {
        if let Some(existing) = self.files.get(source) {
            return Ok(Arc::clone(existing.value()));
        }
        let entry = self.files.entry(source.to_string()).or_try_insert_with(|| {
            self.open_chain(source, now_ms).map(|chain| {
                Arc::new(SourceFile {
                    source: source.to_string(),
                    active: ArcSwap::from_pointee(chain),
                    last_write_ms: AtomicU64::new(now_ms),
                })
            })
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Close files with no write for `idle_close_secs` before `now_ms`
    ///
    /// Dropping an entry closes its queue; the writer drains and exits.
    pub fn close_idle_at(&self, now_ms: u64) -> usize {
        let idle_ms = self.settings.idle_close_secs.max(1) * 1000;
        let before = self.files.len();
        self.files.retain(|_, file| {
            now_ms.saturating_sub(file.last_write_ms.load(Ordering::Relaxed)) < idle_ms
        });
        let closed = before.saturating_sub(self.files.len());
        if closed > 0 {
            tracing::debug!(exporter = %self.base.name(), closed, "idle log files closed");
        }
        closed
    }

    fn sweep_if_due(&self, now_ms: u64) {
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) >= IDLE_SWEEP_MS
            && self
                .last_sweep_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.close_idle_at(now_ms);
        }
    }

    /// Swap in a new file when the time bucket has moved on
    fn rotate_if_needed(&self, file: &SourceFile, now_ms: u64) -> Result<()> {
        let bucket = time_bucket(self.settings.rotation, now_ms);
        if file.active.load().bucket == bucket {
            return Ok(());
        }
        let chain = self.open_chain(&file.source, now_ms)?;
        let old = file.active.swap(Arc::new(chain));
        tracing::info!(
            exporter = %self.base.name(),
            source = %file.source,
            old_bucket = %old.bucket,
            new_bucket = %bucket,
            "log file rotated"
        );
        Ok(())
    }
}

async fn run_writer(
    path: PathBuf,
    mut rx: mpsc::Receiver<BytesMut>,
    mut writer: BufWriter<File>,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    if let Err(e) = writer.write_all(&line) {
                        tracing::error!(path = %path.display(), error = %e, "log write failed");
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = writer.flush() {
                    tracing::error!(path = %path.display(), error = %e, "log flush failed");
                }
            }
        }
    }

    if let Err(e) = writer.flush() {
        tracing::error!(path = %path.display(), error = %e, "final log flush failed");
    }
    tracing::debug!(path = %path.display(), "log writer finished");
}

#[async_trait]
impl Exporter for FileExporter {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    async fn start(&self) -> Result<()> {
        fs::create_dir_all(&self.settings.path)
            .map_err(|e| SinkError::start(self.base.name(), e.to_string()))?;
        self.tracker.reopen();
        self.last_sweep_ms.store(self.base.now_ms(), Ordering::Relaxed);
        self.running.store(true, Ordering::Release);
        tracing::info!(
            exporter = %self.base.name(),
            path = %self.settings.path.display(),
            rotation = ?self.settings.rotation,
            "file exporter started"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.files.clear();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(exporter = %self.base.name(), "file exporter stopped");
    }

    async fn write(&self, record: &mut Record) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SinkError::NotRunning(self.base.name().to_string()));
        }
        let now_ms = self.base.now_ms();
        let source = match (&record.fields.source_id, self.settings.per_source) {
            (Some(id), true) => sanitize(id),
            _ => SHARED_SOURCE.to_string(),
        };

        self.sweep_if_due(now_ms);
        let file = self.source_file(&source, now_ms)?;
        self.rotate_if_needed(&file, now_ms)?;

        let mut line = BytesMut::with_capacity(record.len() + 1);
        line.put_slice(record.payload());
        line.put_u8(b'\n');

        let chain = file.active.load();
        match chain.tx.try_send(line) {
            Ok(()) => {
                file.last_write_ms.store(now_ms, Ordering::Relaxed);
                let path = self.file_path(&source, now_ms);
                record.set_output("file", path.display().to_string(), format!("file|{source}"));
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(SinkError::QueueFull(self.base.name().to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SinkError::NotRunning(self.base.name().to_string()))
            }
        }
    }
}

#[cfg(test)]
#[path = "file_test.rs"]
mod file_test;
