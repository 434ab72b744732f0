//! Global configuration settings
//!
//! Settings shared by every channel and the router.

use std::time::Duration;

use serde::Deserialize;

/// Global configuration that applies to all components
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Worker threads of the async runtime
    /// Default: number of CPU cores
    pub num_processors: usize,

    /// Upper bound for the whole shutdown sequence
    /// Default: 10
    pub shutdown_timeout_secs: u64,

    /// Address of this host, used in Kafka message keys
    /// Default: empty (keys carry no host part)
    pub host_ip: String,

    /// Capacity of each router's config event queue
    /// Default: 1024
    pub event_queue_size: usize,

    /// Grace window before replaced routes and exporters are released
    /// Default: 60
    pub release_grace_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            num_processors: num_cpus(),
            shutdown_timeout_secs: 10,
            host_ip: String::new(),
            event_queue_size: 1024,
            release_grace_secs: 60,
        }
    }
}

impl GlobalConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_secs(self.release_grace_secs)
    }
}

/// Get the number of available CPUs, defaulting to 4 if detection fails
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
