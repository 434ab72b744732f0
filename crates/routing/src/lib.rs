//! Conduit Routing - filters, routing table and route feed
//!
//! Maps a record's routing key to an ordered chain of bindings, each one
//! saying "if the record matches this filter, send it to exporter N under
//! table T".
//!
//! # Design
//!
//! - Chains are immutable once built and held by `Arc`; a hot update swaps
//!   the `Arc` under a short write lock
//! - Lookups clone the `Arc` and release the lock before any filter runs
//! - Retired chains wait out a grace window before release
//!
//! # Example
//!
//! ```
//! use conduit_protocol::{ChannelId, Record};
//! use conduit_routing::{FieldPredicate, Filter, RouteKeyMode, RoutingTable};
//!
//! let table: RoutingTable<Vec<Filter>> = RoutingTable::new(RouteKeyMode::ChannelId);
//! table.update(1001, vec![Filter::new(vec![FieldPredicate::protocol("eu", "region=eu")], vec![])]);
//!
//! let mut record = Record::from_slice(b"hello");
//! record.channel_id = ChannelId::new(1001);
//! record.extensions = vec!["region=eu".into()];
//!
//! let chain = table.lookup(record.channel_id).unwrap();
//! assert!(chain[0].matches(&record));
//! ```

mod error;
mod filter;
mod table;
mod update;

#[cfg(test)]
mod update_test;

pub use error::{Result, RoutingError};
pub use filter::{FieldIn, FieldPredicate, Filter};
pub use table::{DEFAULT_GRACE, RouteKeyMode, RoutingTable, SWEEP_INTERVAL};
pub use update::{
    ConfigEvent, EventKind, EventTarget, KafkaTarget, PulsarTarget, RedisTarget, RouteBinding,
    RouteChain, RouteConfig, RouteEntry, RouteMetadata, StreamFilterSpec, StreamTo,
    name_or_default,
};
