//! Capturing exporters and helpers shared by pipeline tests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use conduit_protocol::Record;
use conduit_sinks::{
    Exporter, ExporterBase, ExporterContext, ExporterFactory, ExporterRegistry, ExporterSettings,
    Result as SinkResult, SinkError,
};
use parking_lot::Mutex;

/// Records `(payload, table_names)` of every write
pub(crate) struct CaptureExporter {
    base: ExporterBase,
    pub writes: Mutex<Vec<(Vec<u8>, Vec<String>)>>,
    pub fail_writes: AtomicBool,
    pub refuse_start: bool,
    pub stopped: AtomicBool,
}

impl CaptureExporter {
    pub fn new(settings: &ExporterSettings, ctx: ExporterContext) -> Self {
        let name = settings.name.as_str();
        Self {
            base: ExporterBase::new(settings.id, name, conduit_sinks::ExporterKind::File, ctx)
                .with_conf(settings.initial_conf()),
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            refuse_start: name.starts_with("refuse"),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn tables(&self) -> Vec<Vec<String>> {
        self.writes.lock().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Exporter for CaptureExporter {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    async fn start(&self) -> SinkResult<()> {
        if self.refuse_start {
            return Err(SinkError::start(self.base.name(), "refused"));
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    async fn write(&self, record: &mut Record) -> SinkResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) || self.base.name().starts_with("down") {
            return Err(SinkError::write("sink down"));
        }
        self.writes
            .lock()
            .push((record.payload().to_vec(), record.table_names.clone()));
        Ok(())
    }
}

/// Factory handing out capture exporters, remembered by name
///
/// Names starting with `refuse` fail to start; names starting with `down`
/// fail every write.
#[derive(Default)]
pub(crate) struct CaptureFactory {
    pub ctx: ExporterContext,
    pub created: Mutex<HashMap<String, Arc<CaptureExporter>>>,
    pub creations: AtomicUsize,
}

impl CaptureFactory {
    pub fn with_context(ctx: ExporterContext) -> Self {
        Self {
            ctx,
            ..Default::default()
        }
    }

    pub fn get(&self, name: &str) -> Arc<CaptureExporter> {
        match self.created.lock().get(name) {
            Some(exporter) => Arc::clone(exporter),
            None => panic!("exporter {name} was never created"),
        }
    }
}

impl ExporterFactory for CaptureFactory {
    fn create(&self, settings: &ExporterSettings) -> SinkResult<Arc<dyn Exporter>> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        let exporter = Arc::new(CaptureExporter::new(settings, self.ctx.clone()));
        self.created
            .lock()
            .insert(settings.name.clone(), Arc::clone(&exporter));
        Ok(exporter)
    }
}

/// File-typed settings; the capture factory ignores the kind
pub(crate) fn settings(id: u32, name: &str) -> ExporterSettings {
    ExporterSettings::parse(&format!(r#"{{"id":{id},"name":"{name}","type":"file"}}"#))
        .expect("valid settings")
}

/// Registry backed by `factory` with the given exporters installed
pub(crate) async fn registry_with(
    factory: &Arc<CaptureFactory>,
    exporters: &[(u32, &str)],
) -> Arc<ExporterRegistry> {
    let registry = Arc::new(ExporterRegistry::new(
        Arc::clone(factory) as Arc<dyn ExporterFactory>
    ));
    for (id, name) in exporters {
        registry.upsert(&settings(*id, name)).await.expect("upsert");
    }
    registry
}
