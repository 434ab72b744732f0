//! Self-describing TLV framing
//!
//! ```text
//! header (12)   version:u16 msg_type:u16 magic:u32 msg_len:u32   (msg_len includes header)
//! records       [tag:u16 len:u32 value]...
//! ```
//!
//! Unknown tags are skipped. Ops messages (`0x0F00..=0x0FFF`) may omit the
//! routing key; every other data message must carry it.

use std::ops::RangeInclusive;

use bytes::{Buf, BufMut, BytesMut};

use super::{Codec, CodecMetrics, DecodeType, check_len, narrow_payload};
use crate::record::{ErrorCode, Record};
use crate::{ChannelId, ProtocolError, Result};

pub const TLV_HEADER_LEN: usize = 12;
pub const TLV_MAGIC: u32 = 0x7C3B_9E01;
pub const TLV_VERSION: u16 = 1;
pub const TLV_DATA_TYPE: u16 = 0x0002;
pub const TLV_HEARTBEAT_TYPE: u16 = 0x0001;
pub const TLV_OPS_TYPES: RangeInclusive<u16> = 0x0F00..=0x0FFF;

pub const TAG_ROUTING_KEY: u16 = 0x0001;
pub const TAG_TIMESTAMP: u16 = 0x0002;
pub const TAG_PAYLOAD: u16 = 0x0003;
pub const TAG_EXTENSION: u16 = 0x0004;
pub const TAG_SERVICE_ID: u16 = 0x0005;

const TAG_HEADER_LEN: usize = 6;

/// Decoder for the TLV framing
#[derive(Debug, Default)]
pub struct TlvCodec {
    metrics: CodecMetrics,
}

impl TlvCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the header, returning (msg_type, msg_len)
    fn read_header(buf: &[u8]) -> Result<(u16, usize)> {
        if buf.len() < TLV_HEADER_LEN {
            return Err(ProtocolError::too_short(TLV_HEADER_LEN, buf.len()));
        }
        let mut hdr = &buf[..TLV_HEADER_LEN];
        let _version = hdr.get_u16();
        let msg_type = hdr.get_u16();
        let magic = hdr.get_u32();
        if magic != TLV_MAGIC {
            return Err(ProtocolError::magic(TLV_MAGIC, magic));
        }
        let msg_len = hdr.get_u32() as usize;
        if msg_len > crate::MAX_BODY_LEN || msg_len < TLV_HEADER_LEN {
            return Err(ProtocolError::body_length(msg_len, buf.len()));
        }
        Ok((msg_type, msg_len))
    }
}

/// Fields collected by one walk over the TLV records
#[derive(Default)]
struct TlvFields {
    routing_key: Option<u32>,
    timestamp: Option<u32>,
    service_id: Option<u32>,
    payload: Option<(usize, usize)>,
    extensions: Vec<String>,
}

fn read_u32_value(value: &[u8], tag: u16, offset: usize) -> Result<u32> {
    let mut v = value;
    if v.len() != 4 {
        return Err(ProtocolError::MalformedTag { tag, offset });
    }
    Ok(v.get_u32())
}

fn walk_tags(buf: &[u8], msg_len: usize) -> Result<TlvFields> {
    let mut fields = TlvFields::default();
    let mut offset = TLV_HEADER_LEN;

    while offset < msg_len {
        if msg_len - offset < TAG_HEADER_LEN {
            return Err(ProtocolError::MalformedTag { tag: 0, offset });
        }
        let mut hdr = &buf[offset..offset + TAG_HEADER_LEN];
        let tag = hdr.get_u16();
        let len = hdr.get_u32() as usize;
        let start = offset + TAG_HEADER_LEN;
        if len > msg_len - start {
            return Err(ProtocolError::MalformedTag { tag, offset });
        }
        let value = &buf[start..start + len];

        match tag {
            TAG_ROUTING_KEY => fields.routing_key = Some(read_u32_value(value, tag, offset)?),
            TAG_TIMESTAMP => fields.timestamp = Some(read_u32_value(value, tag, offset)?),
            TAG_SERVICE_ID => fields.service_id = Some(read_u32_value(value, tag, offset)?),
            TAG_PAYLOAD => fields.payload = Some((start, start + len)),
            TAG_EXTENSION => fields
                .extensions
                .push(String::from_utf8_lossy(value).into_owned()),
            _ => {}
        }
        offset = start + len;
    }
    Ok(fields)
}

fn put_tag(out: &mut BytesMut, tag: u16, value: &[u8]) {
    out.put_u16(tag);
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

impl Codec for TlvCodec {
    fn decode_type(&self) -> DecodeType {
        DecodeType::Tlv
    }

    fn decode_frame(&self, record: &mut Record) -> Result<()> {
        let buf = record.payload();
        let (msg_type, msg_len) = Self::read_header(buf)?;
        check_len(msg_len, buf.len())?;
        record.msg_type = u32::from(msg_type);

        if msg_type == TLV_HEARTBEAT_TYPE {
            record.set_error(ErrorCode::Skip, "heartbeat");
            return Ok(());
        }

        let fields = walk_tags(record.payload(), msg_len)?;
        let is_ops = TLV_OPS_TYPES.contains(&msg_type);

        let routing_key = match (fields.routing_key, is_ops) {
            (Some(key), _) => key,
            (None, true) => 0,
            (None, false) => return Err(ProtocolError::MissingTag(TAG_ROUTING_KEY)),
        };

        record.channel_id = ChannelId::new(routing_key);
        record.created_at = fields.timestamp.unwrap_or(0);
        record.is_ops = is_ops;
        record.service_id = fields.service_id.unwrap_or(0);
        record.extensions = fields.extensions;

        match fields.payload {
            Some((start, end)) => narrow_payload(record, start, end),
            None => record.payload_mut().clear(),
        }
        Ok(())
    }

    fn encode(&self, record: &Record, out: &mut BytesMut) -> Result<()> {
        let ext_len: usize = record
            .extensions
            .iter()
            .map(|e| TAG_HEADER_LEN + e.len())
            .sum();
        let mut msg_len = TLV_HEADER_LEN
            + 2 * (TAG_HEADER_LEN + 4)
            + ext_len
            + TAG_HEADER_LEN
            + record.len();
        if record.is_ops {
            msg_len += TAG_HEADER_LEN + 4;
        }
        if msg_len > crate::MAX_BODY_LEN {
            return Err(ProtocolError::body_length(msg_len, crate::MAX_BODY_LEN));
        }

        let msg_type = if record.is_ops {
            *TLV_OPS_TYPES.start()
        } else {
            TLV_DATA_TYPE
        };

        out.reserve(msg_len);
        out.put_u16(TLV_VERSION);
        out.put_u16(msg_type);
        out.put_u32(TLV_MAGIC);
        out.put_u32(msg_len as u32);
        put_tag(out, TAG_ROUTING_KEY, &record.channel_id.get().to_be_bytes());
        put_tag(out, TAG_TIMESTAMP, &record.created_at.to_be_bytes());
        if record.is_ops {
            put_tag(out, TAG_SERVICE_ID, &record.service_id.to_be_bytes());
        }
        for ext in &record.extensions {
            put_tag(out, TAG_EXTENSION, ext.as_bytes());
        }
        put_tag(out, TAG_PAYLOAD, record.payload());
        Ok(())
    }

    fn frame_length(&self, buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < TLV_HEADER_LEN {
            return Ok(None);
        }
        let (_, msg_len) = Self::read_header(buf)?;
        Ok(Some(msg_len))
    }

    fn metrics(&self) -> &CodecMetrics {
        &self.metrics
    }
}
