//! Dynamic-extension framing
//!
//! ```text
//! public header (16)     msg_type:u16 version:u16 magic:u32 body_len:u32 reserved:u32
//! secondary header (12)  channel_id:u32 timestamp:u32 ext_len:u32
//! extensions (ext_len)   [len:u16 value]...  source-id, event-name, business-id, free-form...
//! payload                body_len - 12 - ext_len bytes
//! ```

use bytes::{Buf, BufMut, BytesMut};

use super::{Codec, CodecMetrics, DecodeType, check_len, narrow_payload};
use crate::record::{ErrorCode, Record};
use crate::{ChannelId, ProtocolError, Result};

pub const PUBLIC_HEADER_LEN: usize = 16;
pub const SECONDARY_HEADER_LEN: usize = 12;
pub const EXT_MAGIC: u32 = 0x2E4A_5D17;
pub const EXT_VERSION: u16 = 2;
/// Data message
pub const EXT_MSG_TYPE: u16 = 0x0E01;
/// Keep-alive, decoded and skipped
pub const EXT_HEARTBEAT_TYPE: u16 = 0x0E00;

/// Header fields written by [`encode_extension_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionHeader {
    pub msg_type: u16,
    pub version: u16,
    pub channel_id: u32,
    pub timestamp: u32,
}

impl Default for ExtensionHeader {
    fn default() -> Self {
        Self {
            msg_type: EXT_MSG_TYPE,
            version: EXT_VERSION,
            channel_id: 0,
            timestamp: 0,
        }
    }
}

/// Append one dynamic-extension frame to `out`
pub fn encode_extension_frame<S: AsRef<str>>(
    out: &mut BytesMut,
    header: ExtensionHeader,
    extensions: &[S],
    payload: &[u8],
) -> Result<()> {
    let mut ext_len = 0usize;
    for ext in extensions {
        let len = ext.as_ref().len();
        if len > u16::MAX as usize {
            return Err(ProtocolError::encode(format!(
                "extension of {len} bytes exceeds u16 length"
            )));
        }
        ext_len += 2 + len;
    }

    let body_len = SECONDARY_HEADER_LEN + ext_len + payload.len();
    if body_len > crate::MAX_BODY_LEN {
        return Err(ProtocolError::body_length(body_len, crate::MAX_BODY_LEN));
    }

    out.reserve(PUBLIC_HEADER_LEN + body_len);
    out.put_u16(header.msg_type);
    out.put_u16(header.version);
    out.put_u32(EXT_MAGIC);
    out.put_u32(body_len as u32);
    out.put_u32(0);

    out.put_u32(header.channel_id);
    out.put_u32(header.timestamp);
    out.put_u32(ext_len as u32);
    for ext in extensions {
        let ext = ext.as_ref();
        out.put_u16(ext.len() as u16);
        out.put_slice(ext.as_bytes());
    }
    out.put_slice(payload);
    Ok(())
}

/// Decoder for the dynamic-extension framing
#[derive(Debug, Default)]
pub struct ExtensionCodec {
    metrics: CodecMetrics,
}

impl ExtensionCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the public header, returning (msg_type, body_len)
    fn read_public_header(buf: &[u8]) -> Result<(u16, usize)> {
        if buf.len() < PUBLIC_HEADER_LEN {
            return Err(ProtocolError::too_short(PUBLIC_HEADER_LEN, buf.len()));
        }
        let mut hdr = &buf[..PUBLIC_HEADER_LEN];
        let msg_type = hdr.get_u16();
        let _version = hdr.get_u16();
        let magic = hdr.get_u32();
        if magic != EXT_MAGIC {
            return Err(ProtocolError::magic(EXT_MAGIC, magic));
        }
        let body_len = hdr.get_u32() as usize;
        if body_len > crate::MAX_BODY_LEN {
            return Err(ProtocolError::body_length(body_len, crate::MAX_BODY_LEN));
        }
        Ok((msg_type, body_len))
    }
}

/// Walk the LV region; every value must fit exactly
fn parse_lv(mut region: &[u8]) -> Result<Vec<String>> {
    let mut values = Vec::new();
    while region.has_remaining() {
        if region.remaining() < 2 {
            return Err(ProtocolError::malformed_extension(
                "truncated extension length",
            ));
        }
        let len = region.get_u16() as usize;
        if len > region.remaining() {
            return Err(ProtocolError::malformed_extension(format!(
                "extension length {len} overruns {} remaining bytes",
                region.remaining()
            )));
        }
        values.push(String::from_utf8_lossy(&region[..len]).into_owned());
        region.advance(len);
    }
    Ok(values)
}

impl Codec for ExtensionCodec {
    fn decode_type(&self) -> DecodeType {
        DecodeType::Extension
    }

    fn decode_frame(&self, record: &mut Record) -> Result<()> {
        let buf = record.payload();
        let (msg_type, body_len) = Self::read_public_header(buf)?;

        if body_len <= SECONDARY_HEADER_LEN {
            return Err(ProtocolError::body_length(
                body_len,
                buf.len() - PUBLIC_HEADER_LEN,
            ));
        }
        check_len(body_len, buf.len() - PUBLIC_HEADER_LEN)?;

        if msg_type != EXT_MSG_TYPE && msg_type != EXT_HEARTBEAT_TYPE {
            return Err(ProtocolError::UnsupportedMessageType(u32::from(msg_type)));
        }

        let body = &buf[PUBLIC_HEADER_LEN..PUBLIC_HEADER_LEN + body_len];
        let mut secondary = &body[..SECONDARY_HEADER_LEN];
        let channel_id = secondary.get_u32();
        let timestamp = secondary.get_u32();
        let ext_len = secondary.get_u32() as usize;

        let rest = &body[SECONDARY_HEADER_LEN..];
        if ext_len > rest.len() {
            return Err(ProtocolError::malformed_extension(format!(
                "ext_len {ext_len} exceeds body remainder {}",
                rest.len()
            )));
        }
        let extensions = parse_lv(&rest[..ext_len])?;

        let payload_start = PUBLIC_HEADER_LEN + SECONDARY_HEADER_LEN + ext_len;
        let payload_end = PUBLIC_HEADER_LEN + body_len;

        let mut named = extensions.iter().cloned();
        record.fields.source_id = named.next();
        record.fields.event_name = named.next();
        record.fields.business_id = named.next();
        record.extensions = extensions;
        record.channel_id = ChannelId::new(channel_id);
        record.created_at = timestamp;
        record.msg_type = u32::from(msg_type);
        narrow_payload(record, payload_start, payload_end);

        if msg_type == EXT_HEARTBEAT_TYPE {
            record.set_error(ErrorCode::Skip, "heartbeat");
        }
        Ok(())
    }

    fn encode(&self, record: &Record, out: &mut BytesMut) -> Result<()> {
        let header = ExtensionHeader {
            channel_id: record.channel_id.get(),
            timestamp: record.created_at,
            ..Default::default()
        };
        encode_extension_frame(out, header, &record.extensions, record.payload())
    }

    fn frame_length(&self, buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < PUBLIC_HEADER_LEN {
            return Ok(None);
        }
        let (_, body_len) = Self::read_public_header(buf)?;
        Ok(Some(PUBLIC_HEADER_LEN + body_len))
    }

    fn metrics(&self) -> &CodecMetrics {
        &self.metrics
    }
}
