//! Proxy relay exporter
//!
//! Re-frames each record and relays it to another collector tier:
//!
//! - `v2`: dynamic-extension frame. Extensions are a per-exporter message
//!   counter, the record's creation time, then the configured extensions.
//! - `v1`: legacy dynamic-meta report carrying the record's labels.
//!
//! Frames go out over a TCP connection pool, UDP, or HTTP POST through a
//! bounded queue drained by worker tasks.

mod http;
mod tcp;
mod udp;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::BytesMut;
use conduit_protocol::Record;
use conduit_protocol::codec::{ExtensionHeader, encode_extension_frame, encode_legacy_dynamic};

use crate::common::{Result, SinkError};
use crate::exporter::{Exporter, ExporterBase};
use crate::settings::{ProxyProtocol, ProxySettings, ProxyVersion};

pub use http::HttpRelay;
pub use tcp::{TcpPool, connect_stream};
pub use udp::UdpRelay;

/// Delay before a failed TCP connection is dialed again
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

enum Transport {
    Tcp(TcpPool),
    Udp(UdpRelay),
    Http(HttpRelay),
}

impl Transport {
    /// Send one frame; returns the address it went to
    async fn send(&self, frame: BytesMut) -> Result<String> {
        match self {
            Self::Tcp(pool) => pool.send(&frame).await,
            Self::Udp(relay) => relay.send(&frame).await,
            Self::Http(relay) => relay.enqueue(frame.freeze()),
        }
    }

    async fn shutdown(&self) {
        match self {
            Self::Tcp(pool) => pool.close().await,
            Self::Udp(_) => {}
            Self::Http(relay) => relay.shutdown().await,
        }
    }
}

/// `proxy|tcp|10.0.0.1|58625`
pub fn output_tag(protocol: ProxyProtocol, address: &str) -> String {
    let (host, port) = address
        .rsplit_once(':')
        .filter(|_| protocol != ProxyProtocol::Http)
        .unwrap_or((address, ""));
    format!("proxy|{}|{host}|{port}", protocol.as_str())
}

pub struct ProxyExporter {
    base: ExporterBase,
    settings: ProxySettings,
    counter: AtomicU64,
    transport: ArcSwapOption<Transport>,
}

impl ProxyExporter {
    pub fn new(base: ExporterBase, settings: ProxySettings) -> Self {
        Self {
            base,
            settings,
            counter: AtomicU64::new(0),
            transport: ArcSwapOption::empty(),
        }
    }

    /// Build the relayed frame for `record`
    pub fn build_frame(&self, record: &Record) -> Result<BytesMut> {
        let channel_id = if self.settings.fill_channel_id {
            record.channel_id.get()
        } else {
            0
        };
        let arrived_secs = (record.arrived_at_ms / 1000) as u32;
        let mut out = BytesMut::with_capacity(record.len() + 128);

        match self.settings.version {
            ProxyVersion::V2 => {
                let counter = self.counter.fetch_add(1, Ordering::Relaxed);
                let mut extensions = vec![counter.to_string(), record.created_at.to_string()];
                extensions.extend(
                    self.settings
                        .extensions
                        .iter()
                        .filter(|e| !e.is_empty())
                        .cloned(),
                );
                let header = ExtensionHeader {
                    channel_id,
                    timestamp: arrived_secs,
                    ..Default::default()
                };
                encode_extension_frame(&mut out, header, &extensions, record.payload())?;
            }
            ProxyVersion::V1 => {
                let mut meta = record.labels.clone();
                meta.extend(
                    self.settings
                        .extensions
                        .iter()
                        .filter(|e| !e.is_empty())
                        .map(|e| match e.split_once('=') {
                            Some((k, v)) if !k.is_empty() => (k.to_string(), v.to_string()),
                            _ => ("ext".to_string(), e.clone()),
                        }),
                );
                encode_legacy_dynamic(&mut out, channel_id, arrived_secs, &meta, record.payload())?;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Exporter for ProxyExporter {
    fn base(&self) -> &ExporterBase {
        &self.base
    }

    async fn start(&self) -> Result<()> {
        let s = &self.settings;
        let transport = match s.protocol {
            ProxyProtocol::Tcp => {
                let pool = TcpPool::new(
                    &s.addresses,
                    s.connections.max(1),
                    Duration::from_millis(s.connect_timeout_ms.max(1)),
                    Duration::from_secs(s.keepalive_secs),
                );
                pool.connect_all().await;
                Transport::Tcp(pool)
            }
            ProxyProtocol::Udp => Transport::Udp(UdpRelay::bind(&s.addresses).await?),
            ProxyProtocol::Http => Transport::Http(HttpRelay::start(
                self.base.name(),
                s.addresses.clone(),
                s.http_queue.max(1),
                s.http_workers.max(1),
                Duration::from_millis(s.http_timeout_ms.max(1)),
            )?),
        };
        self.transport.store(Some(Arc::new(transport)));
        tracing::info!(
            exporter = %self.base.name(),
            protocol = s.protocol.as_str(),
            version = ?s.version,
            addresses = ?s.addresses,
            "proxy exporter started"
        );
        Ok(())
    }

    async fn stop(&self) {
        if let Some(transport) = self.transport.swap(None) {
            transport.shutdown().await;
        }
        tracing::info!(exporter = %self.base.name(), "proxy exporter stopped");
    }

    async fn write(&self, record: &mut Record) -> Result<()> {
        let transport = self
            .transport
            .load_full()
            .ok_or_else(|| SinkError::NotRunning(self.base.name().to_string()))?;
        let frame = self.build_frame(record)?;
        let address = transport.send(frame).await?;
        let tag = output_tag(self.settings.protocol, &address);
        record.set_output("proxy", address, tag);
        Ok(())
    }
}
