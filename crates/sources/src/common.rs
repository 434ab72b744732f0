//! Receiver configuration and metrics shared by all transports

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SourceError};

/// Largest UDP datagram we accept
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;

/// Default per-connection read buffer (1MB reduces syscall frequency)
const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default OS socket buffer
const DEFAULT_SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Transport a receiver listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverProtocol {
    #[default]
    Udp,
    Tcp,
}

impl ReceiverProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for ReceiverProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiverProtocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            other => Err(format!("unknown receiver protocol '{other}'")),
        }
    }
}

/// Listening endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub protocol: ReceiverProtocol,

    /// Bind address (e.g., "0.0.0.0")
    pub address: String,

    /// Listen port, 0 picks an ephemeral port
    pub port: u16,

    /// UDP sockets bound with SO_REUSEPORT; ignored for TCP
    pub workers: usize,

    /// Read buffer per connection (TCP)
    pub buffer_size: usize,

    /// OS-level receive buffer, 0 keeps the system default
    pub socket_buffer_size: usize,

    /// TCP keepalive on accepted connections
    pub keepalive: bool,

    /// TCP_NODELAY on accepted connections
    pub nodelay: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            protocol: ReceiverProtocol::Udp,
            address: "0.0.0.0".into(),
            port: 58625,
            workers: 1,
            buffer_size: DEFAULT_BUFFER_SIZE,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            keepalive: true,
            nodelay: true,
        }
    }
}

impl ReceiverConfig {
    pub fn udp(address: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: ReceiverProtocol::Udp,
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: ReceiverProtocol::Tcp,
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    /// Human-readable bind address for logs
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Parsed socket address to bind
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.address.parse().map_err(|_| {
            SourceError::bind(
                self.bind_address(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid bind address"),
            )
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Counters kept by every receiver
#[derive(Debug, Default)]
pub struct ReceiverMetrics {
    /// Currently open TCP connections
    pub connections_active: AtomicU64,

    /// Total TCP connections accepted
    pub connections_total: AtomicU64,

    /// Frames handed to the sink
    pub messages_received: AtomicU64,

    /// Bytes handed to the sink
    pub bytes_received: AtomicU64,

    /// Frames whose boundary could not be determined
    pub messages_malformed: AtomicU64,

    /// Socket errors
    pub errors: AtomicU64,
}

impl ReceiverMetrics {
    pub const fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_malformed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn message_received(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn message_malformed(&self) {
        self.messages_malformed.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReceiverMetricsSnapshot {
        ReceiverMetricsSnapshot {
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_malformed: self.messages_malformed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of receiver metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverMetricsSnapshot {
    pub connections_active: u64,
    pub connections_total: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_malformed: u64,
    pub errors: u64,
}

impl ReceiverMetricsSnapshot {
    /// Counter deltas since `previous`; the active gauge is kept as is
    pub fn diff(&self, previous: &Self) -> Self {
        Self {
            connections_active: self.connections_active,
            connections_total: self.connections_total.saturating_sub(previous.connections_total),
            messages_received: self.messages_received.saturating_sub(previous.messages_received),
            bytes_received: self.bytes_received.saturating_sub(previous.bytes_received),
            messages_malformed: self
                .messages_malformed
                .saturating_sub(previous.messages_malformed),
            errors: self.errors.saturating_sub(previous.errors),
        }
    }
}

/// Cloneable view of a receiver's metrics for the reporter
#[derive(Debug, Clone)]
pub struct ReceiverMetricsHandle {
    name: String,
    protocol: ReceiverProtocol,
    metrics: Arc<ReceiverMetrics>,
}

impl ReceiverMetricsHandle {
    pub(crate) fn new(name: String, protocol: ReceiverProtocol, metrics: Arc<ReceiverMetrics>) -> Self {
        Self {
            name,
            protocol,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> ReceiverProtocol {
        self.protocol
    }

    pub fn snapshot(&self) -> ReceiverMetricsSnapshot {
        self.metrics.snapshot()
    }
}
