//! HTTP relay: bounded queue drained by POSTing workers

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use crossfire::{MAsyncTx, TrySendError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::{Result, SinkError};

pub struct HttpRelay {
    name: String,
    urls: Arc<Vec<String>>,
    next: AtomicUsize,
    tx: Mutex<Option<MAsyncTx<(usize, Bytes)>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    failures: Arc<AtomicU64>,
}

impl HttpRelay {
    /// Create the queue and spawn `workers` posting tasks
    pub fn start(
        name: &str,
        urls: Vec<String>,
        queue: usize,
        workers: usize,
        request_timeout: Duration,
    ) -> Result<Self> {
        if urls.is_empty() {
            return Err(SinkError::config("no relay urls"));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SinkError::start(name, e.to_string()))?;

        let (tx, rx) = crossfire::mpmc::bounded_async::<(usize, Bytes)>(queue);
        let urls = Arc::new(urls);
        let cancel = CancellationToken::new();
        let failures = Arc::new(AtomicU64::new(0));

        let handles = (0..workers)
            .map(|worker| {
                let rx = rx.clone();
                let client = client.clone();
                let urls = Arc::clone(&urls);
                let cancel = cancel.clone();
                let failures = Arc::clone(&failures);
                let name = name.to_string();
                tokio::spawn(async move {
                    loop {
                        let item = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            item = rx.recv() => item,
                        };
                        let Ok((idx, body)) = item else {
                            break;
                        };
                        let url = &urls[idx];
                        let result = client
                            .post(url.as_str())
                            .body(body)
                            .send()
                            .await
                            .and_then(|r| r.error_for_status());
                        if let Err(e) = result {
                            let n = failures.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::debug!(exporter = %name, url = %url, error = %e, failures = n, "relay post failed");
                        }
                    }
                    tracing::debug!(exporter = %name, worker, "relay worker stopped");
                })
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            urls,
            next: AtomicUsize::new(0),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            cancel,
            failures,
        })
    }

    /// Queue one body; fails immediately when the queue is full
    pub fn enqueue(&self, body: Bytes) -> Result<String> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.urls.len();
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| SinkError::NotRunning(self.name.clone()))?;
        match tx.try_send((idx, body)) {
            Ok(()) => Ok(self.urls[idx].clone()),
            Err(TrySendError::Full(_)) => Err(SinkError::QueueFull(self.name.clone())),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::NotRunning(self.name.clone())),
        }
    }

    /// POSTs that failed after being queued
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Close the queue, let workers drain it, then stop them
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let handles = std::mem::take(&mut *self.workers.lock());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            self.cancel.cancel();
        }
    }
}
