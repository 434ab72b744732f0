//! Id → exporter registry fed by configuration events
//!
//! Replacing or deleting an exporter never stops it in place: the old
//! instance is soft-stopped, parked in a retired list and stopped by
//! [`ExporterRegistry::sweep`] once its grace window has passed. Writers
//! holding an `Arc` to it keep a working exporter until then.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_routing::{ConfigEvent, EventKind, EventTarget};
use parking_lot::{Mutex, RwLock};

use crate::common::{Result, SinkError};
use crate::exporter::Exporter;
use crate::settings::ExporterSettings;

/// Interval of the retired-exporter sweep
pub const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Builds (but does not start) exporters from settings
pub trait ExporterFactory: Send + Sync {
    fn create(&self, settings: &ExporterSettings) -> Result<Arc<dyn Exporter>>;
}

pub struct ExporterRegistry {
    factory: Arc<dyn ExporterFactory>,
    slots: RwLock<HashMap<u32, Arc<dyn Exporter>>>,
    retired: Mutex<Vec<Arc<dyn Exporter>>>,
}

impl ExporterRegistry {
    pub fn new(factory: Arc<dyn ExporterFactory>) -> Self {
        Self {
            factory,
            slots: RwLock::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<Arc<dyn Exporter>> {
        self.slots.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.slots.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Create, start and install an exporter under `settings.id`
    ///
    /// If creation or start fails the previous exporter stays installed.
    pub async fn upsert(&self, settings: &ExporterSettings) -> Result<()> {
        settings.validate()?;
        let exporter = self.factory.create(settings)?;
        exporter.start().await?;

        let previous = self.slots.write().insert(settings.id, exporter);
        match previous {
            Some(old) => {
                tracing::info!(id = settings.id, exporter = %settings.name, "exporter replaced");
                self.retire(old);
            }
            None => tracing::info!(id = settings.id, exporter = %settings.name, "exporter added"),
        }
        Ok(())
    }

    /// Soft-stop and remove the exporter under `id`
    pub fn remove(&self, id: u32) -> bool {
        let removed = self.slots.write().remove(&id);
        match removed {
            Some(old) => {
                tracing::info!(id, exporter = %old.name(), "exporter removed");
                self.retire(old);
                true
            }
            None => false,
        }
    }

    fn retire(&self, exporter: Arc<dyn Exporter>) {
        exporter.base().set_need_stop();
        self.retired.lock().push(exporter);
    }

    /// Apply one exporter event
    ///
    /// `List` replaces the whole registry: listed ids are upserted, others removed.
    pub async fn apply(&self, event: &ConfigEvent) -> Result<()> {
        if event.target != EventTarget::Exporter {
            return Err(SinkError::config("not an exporter event"));
        }
        match event.kind {
            EventKind::Delete => {
                self.remove(event.key);
                Ok(())
            }
            EventKind::Create | EventKind::Change => {
                let mut settings = ExporterSettings::parse(&event.payload)?;
                if event.key != 0 {
                    settings.id = event.key;
                }
                self.upsert(&settings).await
            }
            EventKind::List => {
                let list = ExporterSettings::parse_list(&event.payload)?;
                let keep: HashSet<u32> = list.iter().map(|s| s.id).collect();
                let mut first_error = None;
                for settings in &list {
                    if let Err(e) = self.upsert(settings).await {
                        tracing::warn!(id = settings.id, exporter = %settings.name, error = %e, "exporter update skipped");
                        first_error.get_or_insert(e);
                    }
                }
                let stale: Vec<u32> = self
                    .ids()
                    .into_iter()
                    .filter(|id| !keep.contains(id))
                    .collect();
                for id in stale {
                    self.remove(id);
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Stop and release retired exporters whose grace window has passed
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> usize {
        let due: Vec<Arc<dyn Exporter>> = {
            let mut retired = self.retired.lock();
            let (due, keep) = retired
                .drain(..)
                .partition(|e| e.base().is_need_stop_at(now));
            *retired = keep;
            due
        };
        for exporter in &due {
            exporter.stop().await;
            tracing::debug!(exporter = %exporter.name(), "retired exporter stopped");
        }
        due.len()
    }

    /// Stop every live and retired exporter
    pub async fn stop_all(&self) {
        let live: Vec<Arc<dyn Exporter>> = self.slots.write().drain().map(|(_, e)| e).collect();
        let retired: Vec<Arc<dyn Exporter>> = std::mem::take(&mut *self.retired.lock());
        for exporter in live.iter().chain(retired.iter()) {
            exporter.stop().await;
        }
    }
}

impl std::fmt::Debug for ExporterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterRegistry")
            .field("ids", &self.ids())
            .field("retired", &self.retired_count())
            .finish()
    }
}
