//! In-memory exporter and factory for unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use conduit_protocol::Record;
use parking_lot::Mutex;

use crate::common::{Result, SinkError};
use crate::exporter::{Exporter, ExporterBase, ExporterContext, ExporterKind};
use crate::registry::ExporterFactory;
use crate::settings::ExporterSettings;

/// Captures `(payload, table_names)` of every write
pub struct CaptureExporter {
    base: ExporterBase,
    pub writes: Mutex<Vec<(Vec<u8>, Vec<String>)>>,
    pub fail_writes: AtomicBool,
    pub fail_start: bool,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
}

impl CaptureExporter {
    pub fn new(name: &str, ctx: ExporterContext) -> Self {
        Self::with_base(ExporterBase::new(0, name, ExporterKind::File, ctx))
    }

    pub fn with_base(base: ExporterBase) -> Self {
        Self {
            base,
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_start: false,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn failing(name: &str, ctx: ExporterContext) -> Self {
        let exporter = Self::new(name, ctx);
        exporter.fail_writes.store(true, Ordering::Relaxed);
        exporter
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }
}

#[async_trait]
impl Exporter for CaptureExporter {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    async fn start(&self) -> Result<()> {
        if self.fail_start {
            return Err(SinkError::start(self.base.name(), "refused"));
        }
        self.started.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    async fn write(&self, record: &mut Record) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(SinkError::write("sink down"));
        }
        self.writes
            .lock()
            .push((record.payload().to_vec(), record.table_names.clone()));
        record.set_output("capture", self.base.name(), format!("capture|{}", self.base.name()));
        Ok(())
    }
}

/// Factory producing [`CaptureExporter`]s and remembering them
#[derive(Default)]
pub struct CaptureFactory {
    pub created: Mutex<Vec<Arc<CaptureExporter>>>,
    /// Names whose exporters refuse to start
    pub refuse: Mutex<Vec<String>>,
    pub creations: AtomicUsize,
}

impl ExporterFactory for CaptureFactory {
    fn create(&self, settings: &ExporterSettings) -> Result<Arc<dyn Exporter>> {
        self.creations.fetch_add(1, Ordering::Relaxed);
        let base = ExporterBase::new(
            settings.id,
            settings.name.clone(),
            settings.kind(),
            ExporterContext::default(),
        );
        let mut exporter = CaptureExporter::with_base(base);
        exporter.fail_start = self.refuse.lock().contains(&settings.name);
        let exporter = Arc::new(exporter);
        self.created.lock().push(Arc::clone(&exporter));
        Ok(exporter)
    }
}
