//! TCP receiver
//!
//! Accepts connections and splits each byte stream into frames using the
//! channel's codec. A frame is cut off the read buffer with `split_to`, so
//! the record owns exactly its frame without copying.
//!
//! A frame whose header cannot be parsed loses stream alignment; the
//! connection is closed and the peer is expected to reconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use conduit_protocol::{Codec, Record, SourceEndpoint, Transport};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::common::{ReceiverConfig, ReceiverMetrics, ReceiverMetricsHandle, ReceiverProtocol};
use crate::error::{Result, SourceError};
use crate::udp::Running;
use crate::{Receiver, RecordSink};

const LISTEN_BACKLOG: i32 = 1024;

/// Smallest spare capacity kept before a read
const MIN_READ_SPARE: usize = 4096;

pub struct TcpReceiver {
    name: String,
    config: ReceiverConfig,
    metrics: Arc<ReceiverMetrics>,
    state: Mutex<Option<Running>>,
}

impl TcpReceiver {
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

    fn bind_listener(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if self.config.socket_buffer_size > 0 {
            if let Err(e) = socket.set_recv_buffer_size(self.config.socket_buffer_size) {
                tracing::debug!(error = %e, "failed to set SO_RCVBUF");
            }
        }
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let std_listener: std::net::TcpListener = socket.into();
        TcpListener::from_std(std_listener)
    }
}

#[async_trait]
impl Receiver for TcpReceiver {
    fn protocol(&self) -> ReceiverProtocol {
        ReceiverProtocol::Tcp
    }

    async fn start(&self, sink: Arc<dyn RecordSink>, codec: Arc<dyn Codec>) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(SourceError::AlreadyRunning(self.name.clone()));
        }

        let addr = self.config.socket_addr()?;
        let listener = self
            .bind_listener(addr)
            .map_err(|e| SourceError::bind(self.config.bind_address(), e))?;
        let local_addr = listener.local_addr()?;

        let decode = codec.decode_type();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let acceptor = Acceptor {
            name: self.name.clone(),
            config: self.config.clone(),
            sink,
            codec,
            metrics: Arc::clone(&self.metrics),
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        };
        tracker.spawn(acceptor.run(listener));

        tracing::info!(
            receiver = %self.name,
            address = %local_addr,
            decode = %decode,
            "TCP receiver listening"
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
            tracing::info!(receiver = %self.name, "TCP receiver stopped");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|r| r.local_addr)
    }

    fn metrics_handle(&self) -> ReceiverMetricsHandle {
        ReceiverMetricsHandle::new(
            self.name.clone(),
            ReceiverProtocol::Tcp,
            Arc::clone(&self.metrics),
        )
    }
}

/// Accept loop plus everything a connection task needs
struct Acceptor {
    name: String,
    config: ReceiverConfig,
    sink: Arc<dyn RecordSink>,
    codec: Arc<dyn Codec>,
    metrics: Arc<ReceiverMetrics>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        let acceptor = Arc::new(self);
        loop {
            let accepted = tokio::select! {
                _ = acceptor.cancel.cancelled() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((stream, peer)) => {
                    acceptor.metrics.connection_opened();
                    let conn = Arc::clone(&acceptor);
                    acceptor.tracker.spawn(async move {
                        conn.serve(stream, peer).await;
                        conn.metrics.connection_closed();
                    });
                }
                Err(e) => {
                    // Transient accept errors (EMFILE etc.) - keep listening
                    tracing::warn!(receiver = %acceptor.name, error = %e, "accept error");
                    acceptor.metrics.error();
                }
            }
        }
    }

    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr) {
        self.configure(&stream);
        let source = SourceEndpoint {
            ip: peer.ip(),
            port: peer.port(),
            transport: Transport::Tcp,
        };
        let mut buf = BytesMut::with_capacity(self.config.buffer_size);

        loop {
            if buf.capacity() - buf.len() < MIN_READ_SPARE {
                buf.reserve(self.config.buffer_size.max(MIN_READ_SPARE));
            }
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = stream.read_buf(&mut buf) => r,
            };
            match read {
                Ok(0) => {
                    if !buf.is_empty() {
                        tracing::debug!(peer = %peer, pending = buf.len(), "connection closed mid-frame");
                    }
                    return;
                }
                Ok(_) => {
                    if let Err(e) = split_frames(
                        &mut buf,
                        self.codec.as_ref(),
                        source,
                        self.sink.as_ref(),
                        &self.metrics,
                    ) {
                        self.metrics.message_malformed();
                        tracing::debug!(peer = %peer, error = %e, "unframeable input, closing connection");
                        return;
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        self.metrics.error();
                        tracing::debug!(peer = %peer, error = %e, "connection error");
                    }
                    return;
                }
            }
        }
    }

    /// Socket options not exposed by `tokio::net::TcpStream`
    fn configure(&self, stream: &TcpStream) {
        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "failed to set TCP_NODELAY");
            }
        }
        if self.config.keepalive {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(60))
                .with_interval(Duration::from_secs(10));
            if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                tracing::debug!(error = %e, "failed to set TCP keepalive");
            }
        }
    }
}

/// Move every complete frame at the front of `buf` into a record
///
/// Returns the number of frames delivered. Partial frames stay in `buf`
/// with enough capacity reserved for the rest.
pub(crate) fn split_frames(
    buf: &mut BytesMut,
    codec: &dyn Codec,
    source: SourceEndpoint,
    sink: &dyn RecordSink,
    metrics: &ReceiverMetrics,
) -> Result<usize> {
    let mut delivered = 0;
    while let Some(len) = codec.frame_length(buf)? {
        if len == 0 {
            return Err(conduit_protocol::ProtocolError::too_short(1, 0).into());
        }
        if buf.len() < len {
            buf.reserve(len - buf.len());
            break;
        }
        let frame = buf.split_to(len);
        metrics.message_received(len as u64);
        sink.on_record(Record::new(frame, source));
        delivered += 1;
    }
    Ok(delivered)
}

#[cfg(test)]
#[path = "tcp_test.rs"]
mod tcp_test;
