//! Tglog framing
//!
//! ```text
//! header (20)  magic:u32 msg_type:u16 version:u16 body_len:u32 dest_id:u32 timestamp:u32
//! body         body_len bytes
//! ```

use bytes::{Buf, BufMut, BytesMut};

use super::{Codec, CodecMetrics, DecodeType, check_len, narrow_payload};
use crate::record::Record;
use crate::{ChannelId, ProtocolError, Result};

pub const TGLOG_HEADER_LEN: usize = 20;
/// ASCII `tglg`
pub const TGLOG_MAGIC: u32 = 0x7467_6C67;
const TGLOG_VERSION: u16 = 1;
const TGLOG_LOG_TYPE: u16 = 1;

/// Decoder for tglog frames
#[derive(Debug, Default)]
pub struct TglogCodec {
    metrics: CodecMetrics,
}

impl TglogCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

struct TglogHeader {
    msg_type: u16,
    body_len: usize,
    dest_id: u32,
    timestamp: u32,
}

fn read_header(buf: &[u8]) -> Result<TglogHeader> {
    if buf.len() < TGLOG_HEADER_LEN {
        return Err(ProtocolError::too_short(TGLOG_HEADER_LEN, buf.len()));
    }
    let mut hdr = &buf[..TGLOG_HEADER_LEN];
    let magic = hdr.get_u32();
    if magic != TGLOG_MAGIC {
        return Err(ProtocolError::magic(TGLOG_MAGIC, magic));
    }
    let msg_type = hdr.get_u16();
    let _version = hdr.get_u16();
    let body_len = hdr.get_u32() as usize;
    if body_len > crate::MAX_BODY_LEN {
        return Err(ProtocolError::body_length(body_len, crate::MAX_BODY_LEN));
    }
    Ok(TglogHeader {
        msg_type,
        body_len,
        dest_id: hdr.get_u32(),
        timestamp: hdr.get_u32(),
    })
}

impl Codec for TglogCodec {
    fn decode_type(&self) -> DecodeType {
        DecodeType::Tglog
    }

    fn decode_frame(&self, record: &mut Record) -> Result<()> {
        let buf = record.payload();
        let header = read_header(buf)?;
        check_len(header.body_len, buf.len() - TGLOG_HEADER_LEN)?;

        record.channel_id = ChannelId::new(header.dest_id);
        record.created_at = header.timestamp;
        record.msg_type = u32::from(header.msg_type);
        narrow_payload(record, TGLOG_HEADER_LEN, TGLOG_HEADER_LEN + header.body_len);
        Ok(())
    }

    fn encode(&self, record: &Record, out: &mut BytesMut) -> Result<()> {
        if record.len() > crate::MAX_BODY_LEN {
            return Err(ProtocolError::body_length(record.len(), crate::MAX_BODY_LEN));
        }
        out.reserve(TGLOG_HEADER_LEN + record.len());
        out.put_u32(TGLOG_MAGIC);
        out.put_u16(TGLOG_LOG_TYPE);
        out.put_u16(TGLOG_VERSION);
        out.put_u32(record.len() as u32);
        out.put_u32(record.channel_id.get());
        out.put_u32(record.created_at);
        out.put_slice(record.payload());
        Ok(())
    }

    fn frame_length(&self, buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < TGLOG_HEADER_LEN {
            return Ok(None);
        }
        let header = read_header(buf)?;
        Ok(Some(TGLOG_HEADER_LEN + header.body_len))
    }

    fn metrics(&self) -> &CodecMetrics {
        &self.metrics
    }
}
