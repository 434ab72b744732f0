//! Tests for the TCP receiver and stream framing

use std::time::Duration;

use bytes::BytesMut;
use conduit_protocol::codec::{ExtensionCodec, ExtensionHeader, encode_extension_frame};
use conduit_protocol::{DecodeType, SourceEndpoint, Transport};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::split_frames;
use crate::common::ReceiverMetrics;
use crate::testutil::{channel_sink, next_record};
use crate::{Receiver, ReceiverConfig, TcpReceiver};

fn ext_frame(channel_id: u32, payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::new();
    let header = ExtensionHeader {
        channel_id,
        timestamp: 1_700_000_000,
        ..Default::default()
    };
    encode_extension_frame::<&str>(&mut out, header, &[], payload).unwrap();
    out
}

// =============================================================================
// Framing
// =============================================================================

#[test]
fn test_split_frames_keeps_partial_tail() {
    let codec = ExtensionCodec::new();
    let metrics = ReceiverMetrics::new();
    let (sink, mut rx) = channel_sink();

    let first = ext_frame(1, b"one");
    let second = ext_frame(2, b"two-two");
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&first);
    buf.extend_from_slice(&second[..10]);

    let n = split_frames(&mut buf, &codec, SourceEndpoint::default(), sink.as_ref(), &metrics)
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(buf.len(), 10);
    assert_eq!(rx.try_recv().unwrap().payload(), &first[..]);

    buf.extend_from_slice(&second[10..]);
    let n = split_frames(&mut buf, &codec, SourceEndpoint::default(), sink.as_ref(), &metrics)
        .unwrap();
    assert_eq!(n, 1);
    assert!(buf.is_empty());
    assert_eq!(rx.try_recv().unwrap().payload(), &second[..]);
    assert_eq!(metrics.snapshot().messages_received, 2);
}

#[test]
fn test_split_frames_rejects_bad_header() {
    let codec = ExtensionCodec::new();
    let metrics = ReceiverMetrics::new();
    let (sink, mut rx) = channel_sink();
    let mut buf = BytesMut::from(&[0xAAu8; 32][..]);

    assert!(split_frames(&mut buf, &codec, SourceEndpoint::default(), sink.as_ref(), &metrics).is_err());
    assert!(rx.try_recv().is_err());
}

// =============================================================================
// Connections
// =============================================================================

#[tokio::test]
async fn test_frames_split_across_writes() {
    let receiver = TcpReceiver::new("tcp_test", ReceiverConfig::tcp("127.0.0.1", 0));
    let (sink, mut rx) = channel_sink();
    receiver.start(sink, DecodeType::Extension.codec()).await.unwrap();
    let addr = receiver.local_addr().unwrap();

    let a = ext_frame(1001, b"hello");
    let b = ext_frame(1002, b"world!");
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&a);
    wire.extend_from_slice(&b);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let cut = a.len() + 7;
    stream.write_all(&wire[..cut]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(&wire[cut..]).await.unwrap();

    let first = next_record(&mut rx).await;
    let second = next_record(&mut rx).await;
    assert_eq!(first.payload(), &a[..]);
    assert_eq!(second.payload(), &b[..]);
    assert_eq!(first.source.transport, Transport::Tcp);
    assert!(first.source.ip.is_loopback());

    let snap = receiver.metrics().snapshot();
    assert_eq!(snap.messages_received, 2);
    assert_eq!(snap.connections_total, 1);

    drop(stream);
    receiver.stop().await;
}

#[tokio::test]
async fn test_malformed_stream_closes_connection() {
    let receiver = TcpReceiver::new("tcp_bad", ReceiverConfig::tcp("127.0.0.1", 0));
    let (sink, mut rx) = channel_sink();
    receiver.start(sink, DecodeType::Extension.codec()).await.unwrap();
    let addr = receiver.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&[0x55u8; 64]).await.unwrap();

    let mut closed = false;
    for _ in 0..100 {
        if receiver.metrics().snapshot().messages_malformed == 1
            && receiver.metrics().snapshot().connections_active == 0
        {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed);
    assert!(rx.try_recv().is_err());

    receiver.stop().await;
}

#[tokio::test]
async fn test_stop_closes_open_connections() {
    let receiver = TcpReceiver::new("tcp_stop", ReceiverConfig::tcp("127.0.0.1", 0));
    let (sink, _rx) = channel_sink();
    receiver.start(sink, DecodeType::Legacy.codec()).await.unwrap();
    let addr = receiver.local_addr().unwrap();

    let _stream = TcpStream::connect(addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), receiver.stop())
        .await
        .expect("stop waits for connection tasks");
    assert!(receiver.local_addr().is_none());
}
