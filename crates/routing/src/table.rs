//! Hot-swappable routing table
//!
//! Maps a routing key to an `Arc`-held chain of bindings. Lookups take the
//! read lock just long enough to clone the `Arc`; updates build the new chain
//! before taking the write lock, then swap it in.
//!
//! Replaced and deleted chains are not dropped at once. They are parked in a
//! pending list with the time they were retired and released by
//! [`RoutingTable::sweep_expired`] once the grace window has passed. A reader
//! that cloned the old `Arc` keeps a valid chain either way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_protocol::ChannelId;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

/// Time a retired chain stays parked before release
pub const DEFAULT_GRACE: Duration = Duration::from_secs(60);

/// Period of the release sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(20);

/// How a record's channel id becomes a table key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKeyMode {
    /// Full 32-bit channel id
    #[default]
    ChannelId,
    /// Platform number (top 12 bits) only
    Platform,
}

impl RouteKeyMode {
    #[inline]
    pub fn key(self, id: ChannelId) -> u32 {
        match self {
            Self::ChannelId => id.get(),
            Self::Platform => id.platform(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelId => "channel_id",
            Self::Platform => "platform",
        }
    }
}

struct Retired<C> {
    key: u32,
    retired_at: Instant,
    chain: Arc<C>,
}

/// Routing key → chain map with deferred release
pub struct RoutingTable<C> {
    mode: RouteKeyMode,
    grace: Duration,
    routes: RwLock<HashMap<u32, Arc<C>>>,
    retired: Mutex<Vec<Retired<C>>>,
}

impl<C> RoutingTable<C> {
    pub fn new(mode: RouteKeyMode) -> Self {
        Self::with_grace(mode, DEFAULT_GRACE)
    }

    pub fn with_grace(mode: RouteKeyMode, grace: Duration) -> Self {
        Self {
            mode,
            grace,
            routes: RwLock::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn mode(&self) -> RouteKeyMode {
        self.mode
    }

    #[inline]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Chain for a record's channel id, honoring the key mode
    #[inline]
    pub fn lookup(&self, id: ChannelId) -> Option<Arc<C>> {
        self.get(self.mode.key(id))
    }

    /// Chain stored under a raw key
    #[inline]
    pub fn get(&self, key: u32) -> Option<Arc<C>> {
        self.routes.read().get(&key).cloned()
    }

    /// Install `chain` under `key`, retiring any previous chain
    ///
    /// Returns true when an existing chain was replaced.
    pub fn update(&self, key: u32, chain: C) -> bool {
        self.update_at(key, chain, Instant::now())
    }

    pub fn update_at(&self, key: u32, chain: C, now: Instant) -> bool {
        let chain = Arc::new(chain);
        let mut routes = self.routes.write();
        let previous = routes.insert(key, chain);
        if let Some(old) = previous {
            self.retire(key, old, now);
            tracing::debug!(key, "route chain replaced");
            true
        } else {
            tracing::debug!(key, "route chain added");
            false
        }
    }

    /// Remove the chain under `key`, retiring it
    pub fn delete(&self, key: u32) -> bool {
        self.delete_at(key, Instant::now())
    }

    pub fn delete_at(&self, key: u32, now: Instant) -> bool {
        let mut routes = self.routes.write();
        match routes.remove(&key) {
            Some(old) => {
                self.retire(key, old, now);
                tracing::debug!(key, "route chain deleted");
                true
            }
            None => false,
        }
    }

    /// Replace the whole table with `entries`
    ///
    /// Every previous chain is retired, including those whose key reappears.
    pub fn replace_all(&self, entries: Vec<(u32, C)>) {
        self.replace_all_at(entries, Instant::now());
    }

    pub fn replace_all_at(&self, entries: Vec<(u32, C)>, now: Instant) {
        let fresh: HashMap<u32, Arc<C>> = entries
            .into_iter()
            .map(|(key, chain)| (key, Arc::new(chain)))
            .collect();
        let mut routes = self.routes.write();
        let previous = std::mem::replace(&mut *routes, fresh);
        for (key, old) in previous {
            self.retire(key, old, now);
        }
    }

    /// Caller holds the routes write lock
    fn retire(&self, key: u32, chain: Arc<C>, now: Instant) {
        self.retired.lock().push(Retired {
            key,
            retired_at: now,
            chain,
        });
    }

    /// Release retired chains older than the grace window
    ///
    /// Returns the number of chains released.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<Retired<C>> = {
            let mut retired = self.retired.lock();
            let (expired, kept) = retired
                .drain(..)
                .partition(|r| now.saturating_duration_since(r.retired_at) >= self.grace);
            *retired = kept;
            expired
        };
        for r in &expired {
            tracing::trace!(
                key = r.key,
                refs = Arc::strong_count(&r.chain),
                "releasing retired chain"
            );
        }
        expired.len()
    }

    /// Number of chains waiting for release
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    pub fn contains(&self, key: u32) -> bool {
        self.routes.read().contains_key(&key)
    }

    /// Sorted snapshot of the installed keys
    pub fn keys(&self) -> Vec<u32> {
        let mut keys: Vec<u32> = self.routes.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

impl<C> std::fmt::Debug for RoutingTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("mode", &self.mode)
            .field("routes", &self.len())
            .field("retired", &self.retired_count())
            .finish()
    }
}
