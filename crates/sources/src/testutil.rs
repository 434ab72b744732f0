//! Shared helpers for receiver tests

use std::sync::Arc;
use std::time::Duration;

use conduit_protocol::Record;
use tokio::sync::mpsc;

use crate::RecordSink;

/// Sink that forwards every record into a channel
pub(crate) fn channel_sink() -> (Arc<dyn RecordSink>, mpsc::UnboundedReceiver<Record>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = move |record: Record| {
        let _ = tx.send(record);
    };
    (Arc::new(sink), rx)
}

/// Next record or panic after two seconds
pub(crate) async fn next_record(rx: &mut mpsc::UnboundedReceiver<Record>) -> Record {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for record")
        .expect("sink dropped")
}
