//! Legacy report framing
//!
//! ```text
//! head (24)       msg_type:u32 data_id:u32 utc_time:u32 body_len:u32 resv:[u32; 2]
//! dynamic meta:   ext head (24)  ext_index:u64 ext_type:u32 meta_len:u32 meta_max_len:u32 meta_count:u32
//!                 meta region (meta_max_len)  [key_len:u32 value_len:u32 key value]...
//!                 payload (body_len - 24 - meta_max_len)
//! ```
//!
//! Transfer messages are not unpacked: the whole frame is kept as payload so
//! it can be relayed untouched.

use bytes::{Buf, BufMut, BytesMut};

use super::{Codec, CodecMetrics, DecodeType, check_len, narrow_payload};
use crate::record::{ErrorCode, Record};
use crate::{ChannelId, ProtocolError, Result};

pub const LEGACY_HEAD_LEN: usize = 24;
pub const LEGACY_EXT_HEAD_LEN: usize = 24;
pub const LEGACY_PLAIN_TYPE: u32 = 0x0000_0103;
pub const LEGACY_DYNAMIC_TYPE: u32 = 0x0000_0905;
pub const LEGACY_TRANSFER_TYPE: u32 = 0x0000_0201;

const META_ENTRY_HEAD_LEN: usize = 8;
const DYNAMIC_EXT_TYPE: u32 = 1;

/// Decoder for the legacy report framing
#[derive(Debug, Default)]
pub struct LegacyCodec {
    metrics: CodecMetrics,
}

impl LegacyCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

struct LegacyHead {
    msg_type: u32,
    data_id: u32,
    utc_time: u32,
    body_len: usize,
}

fn read_head(buf: &[u8]) -> Result<LegacyHead> {
    if buf.len() < LEGACY_HEAD_LEN {
        return Err(ProtocolError::too_short(LEGACY_HEAD_LEN, buf.len()));
    }
    let mut hdr = &buf[..LEGACY_HEAD_LEN];
    let head = LegacyHead {
        msg_type: hdr.get_u32(),
        data_id: hdr.get_u32(),
        utc_time: hdr.get_u32(),
        body_len: hdr.get_u32() as usize,
    };
    if !matches!(
        head.msg_type,
        LEGACY_PLAIN_TYPE | LEGACY_DYNAMIC_TYPE | LEGACY_TRANSFER_TYPE
    ) {
        return Err(ProtocolError::UnsupportedMessageType(head.msg_type));
    }
    if head.body_len > crate::MAX_BODY_LEN {
        return Err(ProtocolError::body_length(head.body_len, crate::MAX_BODY_LEN));
    }
    Ok(head)
}

/// Parse `count` meta entries out of the first `meta_len` bytes of `region`
fn parse_meta(region: &[u8], count: usize) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::with_capacity(count.min(64));
    let mut cur = region;
    while entries.len() < count && cur.has_remaining() {
        if cur.remaining() < META_ENTRY_HEAD_LEN {
            return Err(ProtocolError::malformed_extension("truncated meta entry"));
        }
        let key_len = cur.get_u32() as usize;
        let value_len = cur.get_u32() as usize;
        if key_len == 0 {
            return Err(ProtocolError::malformed_extension("empty meta key"));
        }
        if key_len.saturating_add(value_len) > cur.remaining() {
            return Err(ProtocolError::malformed_extension(format!(
                "meta entry {key_len}+{value_len} overruns {} bytes",
                cur.remaining()
            )));
        }
        let key = String::from_utf8_lossy(&cur[..key_len]).into_owned();
        cur.advance(key_len);
        let value = String::from_utf8_lossy(&cur[..value_len]).into_owned();
        cur.advance(value_len);
        entries.push((key, value));
    }
    Ok(entries)
}

/// Parse the extension head and meta region of a dynamic body, returning
/// the labels and the reserved meta size
fn parse_dynamic_body(body: &[u8]) -> Result<(Vec<(String, String)>, usize)> {
    if body.len() < LEGACY_EXT_HEAD_LEN {
        return Err(ProtocolError::body_length(body.len(), body.len()));
    }
    let mut ext = &body[..LEGACY_EXT_HEAD_LEN];
    let _ext_index = ext.get_u64();
    let _ext_type = ext.get_u32();
    let meta_len = ext.get_u32() as usize;
    let meta_max_len = ext.get_u32() as usize;
    let meta_count = ext.get_u32() as usize;

    let after_ext = body.len() - LEGACY_EXT_HEAD_LEN;
    if meta_max_len > after_ext || meta_len > meta_max_len {
        return Err(ProtocolError::malformed_extension(format!(
            "meta region {meta_len}/{meta_max_len} exceeds {after_ext} bytes"
        )));
    }
    let region = &body[LEGACY_EXT_HEAD_LEN..LEGACY_EXT_HEAD_LEN + meta_len];
    Ok((parse_meta(region, meta_count)?, meta_max_len))
}

/// Append a plain legacy report frame
pub fn encode_legacy_plain(
    out: &mut BytesMut,
    data_id: u32,
    utc_time: u32,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > crate::MAX_BODY_LEN {
        return Err(ProtocolError::body_length(payload.len(), crate::MAX_BODY_LEN));
    }
    out.reserve(LEGACY_HEAD_LEN + payload.len());
    put_head(out, LEGACY_PLAIN_TYPE, data_id, utc_time, payload.len());
    out.put_slice(payload);
    Ok(())
}

/// Append a dynamic-meta legacy report frame
pub fn encode_legacy_dynamic<K: AsRef<str>, V: AsRef<str>>(
    out: &mut BytesMut,
    data_id: u32,
    utc_time: u32,
    meta: &[(K, V)],
    payload: &[u8],
) -> Result<()> {
    let meta_len: usize = meta
        .iter()
        .map(|(k, v)| META_ENTRY_HEAD_LEN + k.as_ref().len() + v.as_ref().len())
        .sum();
    if meta.iter().any(|(k, _)| k.as_ref().is_empty()) {
        return Err(ProtocolError::encode("meta key must not be empty"));
    }
    let body_len = LEGACY_EXT_HEAD_LEN + meta_len + payload.len();
    if body_len > crate::MAX_BODY_LEN {
        return Err(ProtocolError::body_length(body_len, crate::MAX_BODY_LEN));
    }

    out.reserve(LEGACY_HEAD_LEN + body_len);
    put_head(out, LEGACY_DYNAMIC_TYPE, data_id, utc_time, body_len);
    out.put_u64(0);
    out.put_u32(DYNAMIC_EXT_TYPE);
    out.put_u32(meta_len as u32);
    out.put_u32(meta_len as u32);
    out.put_u32(meta.len() as u32);
    for (key, value) in meta {
        let (key, value) = (key.as_ref(), value.as_ref());
        out.put_u32(key.len() as u32);
        out.put_u32(value.len() as u32);
        out.put_slice(key.as_bytes());
        out.put_slice(value.as_bytes());
    }
    out.put_slice(payload);
    Ok(())
}

fn put_head(out: &mut BytesMut, msg_type: u32, data_id: u32, utc_time: u32, body_len: usize) {
    out.put_u32(msg_type);
    out.put_u32(data_id);
    out.put_u32(utc_time);
    out.put_u32(body_len as u32);
    out.put_u32(0);
    out.put_u32(0);
}

impl Codec for LegacyCodec {
    fn decode_type(&self) -> DecodeType {
        DecodeType::Legacy
    }

    fn decode_frame(&self, record: &mut Record) -> Result<()> {
        let buf = record.payload();
        let head = read_head(buf)?;
        check_len(head.body_len, buf.len() - LEGACY_HEAD_LEN)?;
        let frame_end = LEGACY_HEAD_LEN + head.body_len;

        let dynamic = if head.msg_type == LEGACY_DYNAMIC_TYPE {
            Some(parse_dynamic_body(&buf[LEGACY_HEAD_LEN..frame_end])?)
        } else {
            None
        };

        record.channel_id = ChannelId::new(head.data_id);
        record.created_at = head.utc_time;
        record.msg_type = head.msg_type;

        match dynamic {
            Some((labels, meta_max_len)) => {
                record.extensions = labels.iter().map(|(_, v)| v.clone()).collect();
                record.labels = labels;
                let payload_start = LEGACY_HEAD_LEN + LEGACY_EXT_HEAD_LEN + meta_max_len;
                narrow_payload(record, payload_start, frame_end);
            }
            None if head.msg_type == LEGACY_TRANSFER_TYPE => {
                record.payload_mut().truncate(frame_end);
                record.set_error(ErrorCode::Transfer, "legacy transfer message");
            }
            None => narrow_payload(record, LEGACY_HEAD_LEN, frame_end),
        }
        Ok(())
    }

    fn encode(&self, record: &Record, out: &mut BytesMut) -> Result<()> {
        if record.labels.is_empty() {
            encode_legacy_plain(
                out,
                record.channel_id.get(),
                record.created_at,
                record.payload(),
            )
        } else {
            encode_legacy_dynamic(
                out,
                record.channel_id.get(),
                record.created_at,
                &record.labels,
                record.payload(),
            )
        }
    }

    fn frame_length(&self, buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < LEGACY_HEAD_LEN {
            return Ok(None);
        }
        let head = read_head(buf)?;
        Ok(Some(LEGACY_HEAD_LEN + head.body_len))
    }

    fn metrics(&self) -> &CodecMetrics {
        &self.metrics
    }
}
