//! Tests for the legacy report framing

use bytes::{BufMut, BytesMut};

use crate::codec::{
    Codec, LEGACY_DYNAMIC_TYPE, LEGACY_HEAD_LEN, LEGACY_TRANSFER_TYPE, LegacyCodec,
    encode_legacy_dynamic, encode_legacy_plain,
};
use crate::{ChannelId, ErrorCode, ProtocolError, Record};

fn head(msg_type: u32, data_id: u32, body_len: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32(msg_type);
    buf.put_u32(data_id);
    buf.put_u32(1_600_000_000);
    buf.put_u32(body_len);
    buf.put_u64(0);
    buf
}

/// Dynamic body with a raw meta region and a reserved size
fn dynamic_frame(meta: &[u8], meta_max_len: usize, count: u32, payload: &[u8]) -> BytesMut {
    let body_len = 24 + meta_max_len + payload.len();
    let mut buf = head(LEGACY_DYNAMIC_TYPE, 42, body_len as u32);
    buf.put_u64(0);
    buf.put_u32(1);
    buf.put_u32(meta.len() as u32);
    buf.put_u32(meta_max_len as u32);
    buf.put_u32(count);
    buf.put_slice(meta);
    buf.put_bytes(0, meta_max_len - meta.len());
    buf.put_slice(payload);
    buf
}

fn meta_entry(key: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.put_u32(key.len() as u32);
    out.put_u32(value.len() as u32);
    out.put_slice(key.as_bytes());
    out.put_slice(value.as_bytes());
    out
}

// =============================================================================
// Decode
// =============================================================================

#[test]
fn test_decode_plain() {
    let mut out = BytesMut::new();
    encode_legacy_plain(&mut out, 1001, 1_700_000_000, b"hello").unwrap();
    let codec = LegacyCodec::new();
    let mut record = Record::new(out, Default::default());

    codec.decode(&mut record).unwrap();

    assert_eq!(record.channel_id, ChannelId::new(1001));
    assert_eq!(record.created_at, 1_700_000_000);
    assert_eq!(record.payload(), b"hello");
    assert!(record.labels.is_empty());
}

#[test]
fn test_decode_dynamic_labels() {
    let mut meta = meta_entry("source", "svc-a");
    meta.extend(meta_entry("event", "login"));
    let buf = dynamic_frame(&meta, meta.len() + 16, 2, b"body");
    let codec = LegacyCodec::new();
    let mut record = Record::new(buf, Default::default());

    codec.decode(&mut record).unwrap();

    assert_eq!(record.channel_id, ChannelId::new(42));
    assert_eq!(
        record.labels,
        vec![
            ("source".to_string(), "svc-a".to_string()),
            ("event".to_string(), "login".to_string())
        ]
    );
    assert_eq!(record.extension_string(), "[svc-a][login]");
    // payload starts after the reserved region, not after the used part
    assert_eq!(record.payload(), b"body");
}

#[test]
fn test_transfer_keeps_whole_frame() {
    let mut buf = head(LEGACY_TRANSFER_TYPE, 3, 4);
    buf.put_slice(b"data");
    let wire_len = buf.len();
    let codec = LegacyCodec::new();
    let mut record = Record::new(buf, Default::default());

    codec.decode(&mut record).unwrap();

    assert_eq!(record.error_code(), Some(ErrorCode::Transfer));
    assert_eq!(record.len(), wire_len);
    assert_eq!(&record.payload()[LEGACY_HEAD_LEN..], b"data");
    assert_eq!(codec.metrics().snapshot().transferred, 1);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_empty_meta_key_is_malformed() {
    let meta = meta_entry("", "v");
    let buf = dynamic_frame(&meta, meta.len(), 1, b"");
    let codec = LegacyCodec::new();
    let mut record = Record::new(buf, Default::default());

    assert!(matches!(
        codec.decode(&mut record),
        Err(ProtocolError::MalformedExtension(_))
    ));
    assert_eq!(record.error_code(), Some(ErrorCode::Decode));
}

#[test]
fn test_meta_entry_overruns_region() {
    let mut meta = meta_entry("key", "value");
    meta.truncate(meta.len() - 2);
    let buf = dynamic_frame(&meta, meta.len(), 1, b"");
    let codec = LegacyCodec::new();
    let mut record = Record::new(buf, Default::default());

    assert!(matches!(
        codec.decode(&mut record),
        Err(ProtocolError::MalformedExtension(_))
    ));
}

#[test]
fn test_meta_max_len_beyond_body() {
    let mut buf = head(LEGACY_DYNAMIC_TYPE, 1, 24);
    buf.put_u64(0);
    buf.put_u32(1);
    buf.put_u32(0);
    buf.put_u32(500);
    buf.put_u32(0);
    let codec = LegacyCodec::new();
    let mut record = Record::new(buf, Default::default());

    assert!(matches!(
        codec.decode(&mut record),
        Err(ProtocolError::MalformedExtension(_))
    ));
}

#[test]
fn test_unsupported_type() {
    let buf = head(0x777, 1, 0);
    let codec = LegacyCodec::new();
    let mut record = Record::new(buf, Default::default());

    assert!(matches!(
        codec.decode(&mut record),
        Err(ProtocolError::UnsupportedMessageType(0x777))
    ));
    assert_eq!(codec.metrics().snapshot().type_errors, 1);
}

#[test]
fn test_body_beyond_buffer() {
    let mut buf = head(LEGACY_DYNAMIC_TYPE, 1, 64);
    buf.put_slice(&[0u8; 10]);
    let codec = LegacyCodec::new();
    let mut record = Record::new(buf, Default::default());

    assert!(matches!(
        codec.decode(&mut record),
        Err(ProtocolError::BodyLength { .. })
    ));
}

// =============================================================================
// Encode
// =============================================================================

#[test]
fn test_dynamic_round_trip_through_codec_encode() {
    let codec = LegacyCodec::new();
    let mut original = Record::from_slice(b"xyz");
    original.channel_id = ChannelId::new(8);
    original.labels = vec![("k".into(), "v".into())];

    let mut wire = BytesMut::new();
    codec.encode(&original, &mut wire).unwrap();
    assert_eq!(codec.frame_length(&wire).unwrap(), Some(wire.len()));

    let mut decoded = Record::new(wire, Default::default());
    codec.decode(&mut decoded).unwrap();

    assert_eq!(decoded.msg_type, LEGACY_DYNAMIC_TYPE);
    assert_eq!(decoded.labels, original.labels);
    assert_eq!(decoded.payload(), b"xyz");
}

#[test]
fn test_encode_rejects_empty_meta_key() {
    let mut out = BytesMut::new();
    let err = encode_legacy_dynamic(&mut out, 1, 0, &[("", "v")], b"").unwrap_err();
    assert!(matches!(err, ProtocolError::Encode(_)));
    assert!(out.is_empty());
}
