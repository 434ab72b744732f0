//! Tests for the rotating file exporter

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use conduit_protocol::{Clock, Record};
use tempfile::TempDir;

use super::{FileExporter, time_bucket};
use crate::common::SinkError;
use crate::exporter::{Exporter, ExporterBase, ExporterContext, ExporterKind};
use crate::settings::{FileRotation, FileSettings};

const HOUR_MS: u64 = 3_600_000;
// 2023-11-14 22:13:20 UTC
const START_MS: u64 = 1_700_000_000_000;

#[derive(Debug)]
struct ManualClock(AtomicU64);

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

fn exporter(dir: &TempDir, per_source: bool) -> (FileExporter, Arc<ManualClock>) {
    exporter_with(
        dir,
        FileSettings {
            per_source,
            ..Default::default()
        },
    )
}

fn exporter_with(dir: &TempDir, settings: FileSettings) -> (FileExporter, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock(AtomicU64::new(START_MS)));
    let ctx = ExporterContext::default().with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
    let settings = FileSettings {
        path: dir.path().to_path_buf(),
        prefix: "records".into(),
        ..settings
    };
    (
        FileExporter::new(ExporterBase::new(0, "file_all", ExporterKind::File, ctx), settings),
        clock,
    )
}

fn read(path: std::path::PathBuf) -> String {
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
}

#[test]
fn test_time_bucket_formats() {
    let hourly = time_bucket(FileRotation::Hourly, START_MS);
    let daily = time_bucket(FileRotation::Daily, START_MS);
    assert!(hourly.starts_with(&daily));
    assert_eq!(hourly.len(), "2023-11-14/22".len());
    assert_ne!(hourly, time_bucket(FileRotation::Hourly, START_MS + HOUR_MS));
}

#[tokio::test]
async fn test_writes_lines() {
    let dir = TempDir::new().unwrap();
    let (file, _) = exporter(&dir, false);
    file.start().await.unwrap();

    let mut first = Record::from_slice(b"alpha");
    file.write(&mut first).await.unwrap();
    file.write(&mut Record::from_slice(b"beta")).await.unwrap();
    assert_eq!(first.output.tag, "file|all");

    let path = file.file_path("all", START_MS);
    file.stop().await;
    assert_eq!(read(path), "alpha\nbeta\n");
}

#[tokio::test]
async fn test_per_source_files() {
    let dir = TempDir::new().unwrap();
    let (file, _) = exporter(&dir, true);
    file.start().await.unwrap();

    for (source, payload) in [("src-1", "a"), ("src-2", "b"), ("src-1", "c")] {
        let mut record = Record::from_slice(payload.as_bytes());
        record.fields.source_id = Some(source.into());
        file.write(&mut record).await.unwrap();
    }
    file.write(&mut Record::from_slice(b"none")).await.unwrap();
    assert_eq!(file.open_files(), 3);

    file.stop().await;
    assert_eq!(read(file.file_path("src-1", START_MS)), "a\nc\n");
    assert_eq!(read(file.file_path("src-2", START_MS)), "b\n");
    assert_eq!(read(file.file_path("all", START_MS)), "none\n");
}

#[tokio::test]
async fn test_rotates_on_new_bucket() {
    let dir = TempDir::new().unwrap();
    let (file, clock) = exporter(&dir, false);
    file.start().await.unwrap();

    file.write(&mut Record::from_slice(b"before")).await.unwrap();
    clock.0.store(START_MS + HOUR_MS, Ordering::Relaxed);
    file.write(&mut Record::from_slice(b"after")).await.unwrap();

    file.stop().await;
    assert_eq!(read(file.file_path("all", START_MS)), "before\n");
    assert_eq!(read(file.file_path("all", START_MS + HOUR_MS)), "after\n");
}

#[tokio::test]
async fn test_idle_source_files_are_closed() {
    let dir = TempDir::new().unwrap();
    let (file, clock) = exporter_with(
        &dir,
        FileSettings {
            per_source: true,
            idle_close_secs: 60,
            ..Default::default()
        },
    );
    file.start().await.unwrap();

    let sourced = |source: &str, payload: &str| {
        let mut record = Record::from_slice(payload.as_bytes());
        record.fields.source_id = Some(source.into());
        record
    };
    file.write(&mut sourced("src-1", "a")).await.unwrap();
    clock.0.store(START_MS + 50_000, Ordering::Relaxed);
    file.write(&mut sourced("src-2", "b")).await.unwrap();
    assert_eq!(file.open_files(), 2);

    // First write past the sweep interval closes src-1 only
    clock.0.store(START_MS + 90_000, Ordering::Relaxed);
    file.write(&mut sourced("src-2", "c")).await.unwrap();
    assert_eq!(file.open_files(), 1);

    // A later write reopens and appends
    file.write(&mut sourced("src-1", "d")).await.unwrap();
    assert_eq!(file.open_files(), 2);

    file.stop().await;
    assert_eq!(read(file.file_path("src-1", START_MS)), "a\nd\n");
    assert_eq!(read(file.file_path("src-2", START_MS)), "b\nc\n");
}

#[test]
fn test_source_id_sanitized() {
    let dir = TempDir::new().unwrap();
    let (file, _) = exporter(&dir, true);
    let path = file.file_path("../etc/passwd", START_MS);
    assert!(path.starts_with(dir.path()));
    assert_eq!(path.file_name().unwrap(), "records____etc_passwd.log");
}

#[tokio::test]
async fn test_write_requires_start() {
    let dir = TempDir::new().unwrap();
    let (file, _) = exporter(&dir, false);
    assert!(matches!(
        file.write(&mut Record::from_slice(b"x")).await,
        Err(SinkError::NotRunning(_))
    ));
}
