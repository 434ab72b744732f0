//! UDP relay

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::{UdpSocket, lookup_host};

use crate::common::{Result, SinkError};

pub struct UdpRelay {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    next: AtomicUsize,
}

impl UdpRelay {
    /// Resolve the targets and bind an ephemeral local socket
    pub async fn bind(addresses: &[String]) -> Result<Self> {
        let mut targets = Vec::with_capacity(addresses.len());
        for addr in addresses {
            let resolved = lookup_host(addr.as_str())
                .await
                .map_err(|e| SinkError::connection(addr, e))?
                .next()
                .ok_or_else(|| SinkError::connection(addr, "no address resolved"))?;
            targets.push(resolved);
        }
        if targets.is_empty() {
            return Err(SinkError::config("no relay addresses"));
        }
        let local: SocketAddr = if targets[0].is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self {
            socket,
            targets,
            next: AtomicUsize::new(0),
        })
    }

    pub async fn send(&self, frame: &[u8]) -> Result<String> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;
        for i in 0..self.targets.len() {
            let target = self.targets[(start + i) % self.targets.len()];
            match self.socket.send_to(frame, target).await {
                Ok(_) => return Ok(target.to_string()),
                Err(e) => last_error = Some(SinkError::connection(target.to_string(), e)),
            }
        }
        Err(last_error.unwrap_or_else(|| SinkError::write("no relay targets")))
    }
}
