//! Conduit Sources - network receivers
//!
//! A receiver owns a listening socket and hands every framed inbound message
//! to a [`RecordSink`] as a [`Record`]. Decoding happens later on a worker;
//! receivers only find frame boundaries.
//!
//! | Receiver | Framing |
//! |----------|---------|
//! | [`UdpReceiver`] | one record per datagram |
//! | [`TcpReceiver`] | stream split with [`Codec::frame_length`] |
//!
//! # Example
//!
//! ```ignore
//! use conduit_sources::{ReceiverConfig, build_receiver};
//!
//! let receiver = build_receiver(ReceiverConfig::udp("0.0.0.0", 58625), "ingest");
//! receiver.start(sink, codec).await?;
//! ```

mod common;
mod error;
mod tcp;
mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_protocol::{Codec, Record};

pub use common::{
    ReceiverConfig, ReceiverMetrics, ReceiverMetricsHandle, ReceiverMetricsSnapshot,
    ReceiverProtocol,
};
pub use error::{Result, SourceError};
pub use tcp::TcpReceiver;
pub use udp::UdpReceiver;

/// Callback invoked once per framed inbound message
///
/// Implementations must not block; the receiver loop calls this inline.
pub trait RecordSink: Send + Sync {
    fn on_record(&self, record: Record);
}

impl<F> RecordSink for F
where
    F: Fn(Record) + Send + Sync,
{
    fn on_record(&self, record: Record) {
        self(record)
    }
}

/// A listening endpoint owned by a channel
#[async_trait]
pub trait Receiver: Send + Sync {
    fn protocol(&self) -> ReceiverProtocol;

    /// Bind and start delivering records to `sink`
    ///
    /// Returns once the socket is bound. The codec supplies frame boundaries
    /// for stream transports and is ignored for datagrams.
    async fn start(&self, sink: Arc<dyn RecordSink>, codec: Arc<dyn Codec>) -> Result<()>;

    /// Stop accepting and wait for the receive tasks to finish
    async fn stop(&self);

    /// Bound address while running
    fn local_addr(&self) -> Option<SocketAddr>;

    fn metrics_handle(&self) -> ReceiverMetricsHandle;
}

/// Build the receiver described by `config`
pub fn build_receiver(config: ReceiverConfig, name: &str) -> Arc<dyn Receiver> {
    match config.protocol {
        ReceiverProtocol::Udp => Arc::new(UdpReceiver::new(name, config)),
        ReceiverProtocol::Tcp => Arc::new(TcpReceiver::new(name, config)),
    }
}

#[cfg(test)]
mod testutil;
