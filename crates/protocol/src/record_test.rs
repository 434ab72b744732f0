//! Tests for Record and ops accounting

use std::net::{IpAddr, Ipv4Addr};

use bytes::BytesMut;

use crate::{
    ChannelId, CountingOpsReporter, ErrorCode, OpsReporter, OpsState, Record, SourceEndpoint,
    Transport,
};

fn udp_source() -> SourceEndpoint {
    SourceEndpoint {
        ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
        port: 40000,
        transport: Transport::Udp,
    }
}

// =============================================================================
// Record basics
// =============================================================================

#[test]
fn test_new_record_defaults() {
    let record = Record::new(BytesMut::from(&b"hello"[..]), udp_source());
    assert_eq!(record.payload(), b"hello");
    assert_eq!(record.len(), 5);
    assert!(record.channel_id.is_none());
    assert!(record.error.is_none());
    assert!(record.arrived_at_ms > 0);
    assert_eq!(record.source.transport, Transport::Udp);
}

#[test]
fn test_length_tracks_payload() {
    let mut record = Record::from_slice(b"abc");
    record.payload_mut().extend_from_slice(b"def");
    assert_eq!(record.len(), 6);

    record.set_payload(BytesMut::new());
    assert!(record.is_empty());
}

#[test]
fn test_extension_string() {
    let mut record = Record::from_slice(b"");
    assert_eq!(record.extension_string(), "");

    record.extensions = vec!["a".into(), "bc".into()];
    assert_eq!(record.extension_string(), "[a][bc]");
}

#[test]
fn test_error_set_and_clear() {
    let mut record = Record::from_slice(b"x");
    record.set_error(ErrorCode::Decode, "bad magic");
    assert_eq!(record.error_code(), Some(ErrorCode::Decode));
    assert_eq!(record.error.as_ref().map(|e| e.message.as_str()), Some("bad magic"));

    record.set_error(ErrorCode::Skip, "heartbeat");
    assert_eq!(record.error_code(), Some(ErrorCode::Skip));

    record.clear_error();
    assert!(record.error_code().is_none());
}

#[test]
fn test_set_output() {
    let mut record = Record::from_slice(b"x");
    record.set_output("proxy", "10.0.0.1:58625", "proxy|tcp|10.0.0.1|58625".into());
    assert_eq!(record.output.kind, "proxy");
    assert_eq!(record.output.tag, "proxy|tcp|10.0.0.1|58625");
}

// =============================================================================
// Ops accounting
// =============================================================================

#[test]
fn test_ops_snapshot_copies_metadata() {
    let mut record = Record::new(BytesMut::from(&b"payload"[..]), udp_source());
    record.channel_id = ChannelId::new(1001);
    record.output_at_ms = 42;

    let snap = record.ops_snapshot(OpsState::Output);
    assert_eq!(snap.state, OpsState::Output);
    assert_eq!(snap.channel_id, ChannelId::new(1001));
    assert_eq!(snap.bytes, 7);
    assert_eq!(snap.source_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
    assert_eq!(snap.output_at_ms, 42);
}

#[test]
fn test_counting_reporter() {
    let reporter = CountingOpsReporter::new();
    let record = Record::from_slice(b"1234");

    reporter.put_ops(record.ops_snapshot(OpsState::Dealing));
    reporter.put_ops(record.ops_snapshot(OpsState::Output));
    reporter.put_ops(record.ops_snapshot(OpsState::Output));
    reporter.put_ops(record.ops_snapshot(OpsState::Lost));
    reporter.put_ops(record.ops_snapshot(OpsState::Dropped));

    let counts = reporter.snapshot();
    assert_eq!(counts.dealing, 1);
    assert_eq!(counts.output, 2);
    assert_eq!(counts.bytes_output, 8);
    assert_eq!(counts.lost, 1);
    assert_eq!(counts.dropped, 1);

    let later = reporter.snapshot();
    assert_eq!(later.diff(&counts), Default::default());
}
