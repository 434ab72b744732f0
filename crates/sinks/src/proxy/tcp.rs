//! TCP connection pool for the relay

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::RECONNECT_BACKOFF;
use crate::common::{Result, SinkError};

/// Dial `addr` with a timeout, then set nodelay and keep-alive
pub async fn connect_stream(
    addr: &str,
    connect_timeout: Duration,
    keepalive: Duration,
) -> Result<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(SinkError::connection(addr, e)),
        Err(_) => return Err(SinkError::connection(addr, "connection timed out")),
    };

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(target_addr = %addr, error = %e, "failed to set TCP_NODELAY");
    }

    if !keepalive.is_zero() {
        let sock_ref = SockRef::from(&stream);
        let params = TcpKeepalive::new().with_time(keepalive);

        #[cfg(target_os = "linux")]
        let params = params.with_interval(keepalive);

        if let Err(e) = sock_ref.set_tcp_keepalive(&params) {
            tracing::debug!(target_addr = %addr, error = %e, "failed to set TCP keep-alive");
        }
    }
    Ok(stream)
}

struct Slot {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
    last_dial: parking_lot::Mutex<Option<Instant>>,
}

impl Slot {
    /// Whether a dial is allowed now; records the attempt when it is
    fn may_dial(&self, now: Instant) -> bool {
        let mut last = self.last_dial.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < RECONNECT_BACKOFF => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// `connections` streams per address, used round-robin
pub struct TcpPool {
    slots: Vec<Slot>,
    next: AtomicUsize,
    connect_timeout: Duration,
    keepalive: Duration,
}

impl TcpPool {
    pub fn new(
        addresses: &[String],
        connections: usize,
        connect_timeout: Duration,
        keepalive: Duration,
    ) -> Self {
        let slots = addresses
            .iter()
            .flat_map(|addr| std::iter::repeat_n(addr, connections))
            .map(|addr| Slot {
                addr: addr.clone(),
                stream: Mutex::new(None),
                last_dial: parking_lot::Mutex::new(None),
            })
            .collect();
        Self {
            slots,
            next: AtomicUsize::new(0),
            connect_timeout,
            keepalive,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Dial every slot once; failures are left for the write path to retry
    pub async fn connect_all(&self) -> usize {
        let mut connected = 0;
        for slot in &self.slots {
            let mut guard = slot.stream.lock().await;
            if guard.is_some() || !slot.may_dial(Instant::now()) {
                continue;
            }
            match connect_stream(&slot.addr, self.connect_timeout, self.keepalive).await {
                Ok(stream) => {
                    *guard = Some(stream);
                    connected += 1;
                }
                Err(e) => tracing::warn!(target_addr = %slot.addr, error = %e, "relay connection failed"),
            }
        }
        connected
    }

    async fn send_on(&self, slot: &Slot, frame: &[u8]) -> Result<()> {
        let mut guard = slot.stream.lock().await;
        if guard.is_none() {
            if !slot.may_dial(Instant::now()) {
                return Err(SinkError::connection(&slot.addr, "waiting to reconnect"));
            }
            *guard = Some(connect_stream(&slot.addr, self.connect_timeout, self.keepalive).await?);
            tracing::debug!(target_addr = %slot.addr, "relay connection established");
        }
        let Some(stream) = guard.as_mut() else {
            return Err(SinkError::connection(&slot.addr, "not connected"));
        };
        if let Err(e) = stream.write_all(frame).await {
            *guard = None;
            return Err(SinkError::connection(&slot.addr, e));
        }
        Ok(())
    }

    /// Write `frame` on the next connection, moving on to the following
    /// ones if it fails, at most once around the pool
    pub async fn send(&self, frame: &[u8]) -> Result<String> {
        if self.slots.is_empty() {
            return Err(SinkError::config("no relay addresses"));
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;
        for i in 0..self.slots.len() {
            let slot = &self.slots[(start + i) % self.slots.len()];
            match self.send_on(slot, frame).await {
                Ok(()) => return Ok(slot.addr.clone()),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| SinkError::write("relay pool exhausted")))
    }

    pub async fn close(&self) {
        for slot in &self.slots {
            if let Some(mut stream) = slot.stream.lock().await.take() {
                let _ = stream.shutdown().await;
            }
        }
    }
}
