//! UDP receiver
//!
//! Every datagram becomes one record. With `workers > 1` several sockets are
//! bound to the same port with SO_REUSEPORT so the kernel spreads datagrams
//! across receive tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use conduit_protocol::{Codec, Record, SourceEndpoint, Transport};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::common::{
    MAX_DATAGRAM, ReceiverConfig, ReceiverMetrics, ReceiverMetricsHandle, ReceiverProtocol,
};
use crate::error::{Result, SourceError};
use crate::{Receiver, RecordSink};

/// Live state between `start` and `stop`
pub(crate) struct Running {
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) local_addr: SocketAddr,
}

impl Running {
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

pub struct UdpReceiver {
    name: String,
    config: ReceiverConfig,
    metrics: Arc<ReceiverMetrics>,
    state: Mutex<Option<Running>>,
}

impl UdpReceiver {
    pub fn new(name: impl Into<String>, config: ReceiverConfig) -> Self {
        Self {
            name: name.into(),
            config,
            metrics: Arc::new(ReceiverMetrics::new()),
            state: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &ReceiverMetrics {
        &self.metrics
    }

    fn bind_socket(&self, addr: SocketAddr) -> std::io::Result<UdpSocket> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        if self.config.socket_buffer_size > 0 {
            if let Err(e) = socket.set_recv_buffer_size(self.config.socket_buffer_size) {
                tracing::warn!(
                    receiver = %self.name,
                    error = %e,
                    requested_size = self.config.socket_buffer_size,
                    "failed to set UDP SO_RCVBUF"
                );
            }
        }

        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
    }
}

#[async_trait]
impl Receiver for UdpReceiver {
    fn protocol(&self) -> ReceiverProtocol {
        ReceiverProtocol::Udp
    }

    async fn start(&self, sink: Arc<dyn RecordSink>, _codec: Arc<dyn Codec>) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(SourceError::AlreadyRunning(self.name.clone()));
        }

        let requested = self.config.socket_addr()?;
        let first = self
            .bind_socket(requested)
            .map_err(|e| SourceError::bind(self.config.bind_address(), e))?;
        // An ephemeral port is resolved once so every worker shares it
        let local_addr = first.local_addr()?;

        let mut sockets = vec![first];
        for _ in 1..self.config.workers.max(1) {
            let socket = self
                .bind_socket(local_addr)
                .map_err(|e| SourceError::bind(local_addr.to_string(), e))?;
            sockets.push(socket);
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        for (worker_id, socket) in sockets.into_iter().enumerate() {
            tracker.spawn(recv_loop(
                worker_id,
                socket,
                Arc::clone(&sink),
                Arc::clone(&self.metrics),
                cancel.clone(),
            ));
        }

        tracing::info!(
            receiver = %self.name,
            address = %local_addr,
            workers = self.config.workers.max(1),
            "UDP receiver listening"
        );

        *state = Some(Running {
            cancel,
            tracker,
            local_addr,
        });
        Ok(())
    }

    async fn stop(&self) {
        let running = self.state.lock().take();
        if let Some(running) = running {
            running.shutdown().await;
            tracing::info!(receiver = %self.name, "UDP receiver stopped");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|r| r.local_addr)
    }

    fn metrics_handle(&self) -> ReceiverMetricsHandle {
        ReceiverMetricsHandle::new(
            self.name.clone(),
            ReceiverProtocol::Udp,
            Arc::clone(&self.metrics),
        )
    }
}

async fn recv_loop(
    worker_id: usize,
    socket: UdpSocket,
    sink: Arc<dyn RecordSink>,
    metrics: Arc<ReceiverMetrics>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker_id, "UDP receive task started");
    let mut buf = BytesMut::with_capacity(MAX_DATAGRAM);

    loop {
        buf.reserve(MAX_DATAGRAM);
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_buf_from(&mut buf) => r,
        };

        match received {
            Ok((0, _)) => buf.clear(),
            Ok((len, peer)) => {
                let frame = buf.split();
                metrics.message_received(len as u64);
                sink.on_record(Record::new(frame, udp_endpoint(peer)));
            }
            Err(e) => {
                metrics.error();
                buf.clear();
                tracing::debug!(worker_id, error = %e, "UDP receive error");
            }
        }
    }

    tracing::debug!(worker_id, "UDP receive task stopped");
}

fn udp_endpoint(peer: SocketAddr) -> SourceEndpoint {
    SourceEndpoint {
        ip: peer.ip(),
        port: peer.port(),
        transport: Transport::Udp,
    }
}

#[cfg(test)]
#[path = "udp_test.rs"]
mod udp_test;
