//! Tests for the UDP receiver

use std::sync::Arc;
use std::time::Duration;

use conduit_protocol::{DecodeType, Transport};
use tokio::net::UdpSocket;

use crate::testutil::{channel_sink, next_record};
use crate::{Receiver, ReceiverConfig, ReceiverProtocol, SourceError, UdpReceiver};

fn loopback() -> ReceiverConfig {
    ReceiverConfig::udp("127.0.0.1", 0)
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn test_one_record_per_datagram() {
    let receiver = UdpReceiver::new("udp_test", loopback());
    let (sink, mut rx) = channel_sink();
    receiver.start(sink, DecodeType::Extension.codec()).await.unwrap();
    let addr = receiver.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_port = client.local_addr().unwrap().port();
    client.send_to(b"first", addr).await.unwrap();
    client.send_to(b"second datagram", addr).await.unwrap();

    let a = next_record(&mut rx).await;
    let b = next_record(&mut rx).await;
    assert_eq!(a.payload(), b"first");
    assert_eq!(b.payload(), b"second datagram");
    assert_eq!(a.source.transport, Transport::Udp);
    assert_eq!(a.source.port, client_port);
    assert!(a.source.ip.is_loopback());

    let snap = receiver.metrics().snapshot();
    assert_eq!(snap.messages_received, 2);
    assert_eq!(snap.bytes_received, 20);

    receiver.stop().await;
    assert!(receiver.local_addr().is_none());
}

#[tokio::test]
async fn test_reuseport_workers_share_port() {
    let config = ReceiverConfig {
        workers: 3,
        ..loopback()
    };
    let receiver = UdpReceiver::new("udp_multi", config);
    let (sink, mut rx) = channel_sink();
    receiver.start(sink, DecodeType::Tlv.codec()).await.unwrap();
    let addr = receiver.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for i in 0..10u8 {
        client.send_to(&[i; 8], addr).await.unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.push(next_record(&mut rx).await.payload()[0]);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..10u8).collect::<Vec<_>>());

    receiver.stop().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let receiver = UdpReceiver::new("udp_twice", loopback());
    let (sink, _rx) = channel_sink();
    receiver
        .start(Arc::clone(&sink), DecodeType::Extension.codec())
        .await
        .unwrap();

    let err = receiver
        .start(sink, DecodeType::Extension.codec())
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::AlreadyRunning(name) if name == "udp_twice"));
    receiver.stop().await;
}

#[tokio::test]
async fn test_stop_ends_delivery_and_can_restart() {
    let receiver = UdpReceiver::new("udp_restart", loopback());
    let (sink, mut rx) = channel_sink();
    receiver
        .start(Arc::clone(&sink), DecodeType::Extension.codec())
        .await
        .unwrap();
    let addr = receiver.local_addr().unwrap();
    receiver.stop().await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let _ = client.send_to(b"late", addr).await;
    let late = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(late.is_err());

    receiver.start(sink, DecodeType::Extension.codec()).await.unwrap();
    assert!(receiver.local_addr().is_some());
    receiver.stop().await;
}

#[tokio::test]
async fn test_invalid_bind_address() {
    let receiver = UdpReceiver::new("udp_bad", ReceiverConfig::udp("nowhere", 0));
    let (sink, _rx) = channel_sink();
    let err = receiver
        .start(sink, DecodeType::Extension.codec())
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Bind { .. }));
    assert_eq!(receiver.metrics_handle().protocol(), ReceiverProtocol::Udp);
}
