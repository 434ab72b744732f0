//! Ordered fan-out over exporters
//!
//! A chain is an owned list of exporters. Writing a record walks every link:
//! each link's configuration decides whether it takes the record, and a
//! failing link never stops the walk.

use std::sync::Arc;

use conduit_protocol::Record;
use crate::exporter::{ChannelFilter, Exporter};

/// Owned, ordered list of exporters
#[derive(Default, Clone)]
pub struct ExporterChain {
    links: Vec<Arc<dyn Exporter>>,
}

impl ExporterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a link at the end of the chain
    pub fn push(&mut self, exporter: Arc<dyn Exporter>) {
        self.links.push(exporter);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Exporter>> {
        self.links.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.links.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Exporter>> {
        self.links.iter().find(|e| e.name() == name)
    }

    /// Write `record` through every link that accepts it
    ///
    /// Returns the number of links that accepted and delivered the record.
    pub async fn write_to(&self, record: &mut Record) -> usize {
        let mut written = 0;
        for link in &self.links {
            let base = link.base();
            let Some(tables) = base.select(record) else {
                base.metrics().record_filtered();
                continue;
            };
            if !tables.is_empty() {
                record.table_names = tables;
            }
            if link.deliver(record).await {
                written += 1;
            }
        }
        written
    }

    /// Attach `filter` to the link named `name`, if there is one
    ///
    /// Returns true when the link exists; the caller then reuses its
    /// connection instead of creating another exporter for the same sink.
    pub fn is_exists_and_update_filter(&self, name: &str, filter: ChannelFilter) -> bool {
        match self.find(name) {
            Some(link) => {
                link.base().add_filter(filter);
                true
            }
            None => false,
        }
    }

    /// Start every link, dropping the ones that fail
    pub async fn start_all(&mut self) -> usize {
        let mut started = Vec::with_capacity(self.links.len());
        for link in self.links.drain(..) {
            match link.start().await {
                Ok(()) => started.push(link),
                Err(e) => {
                    tracing::warn!(exporter = %link.name(), error = %e, "exporter failed to start, skipping");
                }
            }
        }
        self.links = started;
        self.links.len()
    }

    pub async fn stop_all(&self) {
        for link in &self.links {
            link.stop().await;
        }
    }
}

impl FromIterator<Arc<dyn Exporter>> for ExporterChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Exporter>>>(iter: I) -> Self {
        Self {
            links: iter.into_iter().collect(),
        }
    }
}

impl std::fmt::Debug for ExporterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.links.iter().map(|e| e.name())).finish()
    }
}
