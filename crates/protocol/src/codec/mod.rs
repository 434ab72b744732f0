//! Wire codecs
//!
//! Stateless decoders that turn a raw inbound buffer into record fields, plus
//! the matching encoders used when relaying records downstream. A channel
//! picks one codec at start-up through [`DecodeType`].
//!
//! All multi-byte fields are big-endian. Magic numbers and message types are
//! validated before any declared length is trusted, and no declared length
//! may exceed [`MAX_BODY_LEN`](crate::MAX_BODY_LEN).
//!
//! | Framing | Header | Routing key |
//! |---------|--------|-------------|
//! | `extension` | 16-byte public + 12-byte secondary, LV extensions | secondary header |
//! | `tlv` | 12-byte header, tag/length/value records | tag `0x0001` |
//! | `legacy` | 24-byte report head, optional dynamic meta | `data_id` |
//! | `tglog` | 20-byte header | `dest_id` |

mod extension;
mod legacy;
mod metrics;
mod tglog;
mod tlv;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::BytesMut;

use crate::record::{ErrorCode, Record};
use crate::{ProtocolError, Result};

pub use extension::{
    EXT_HEARTBEAT_TYPE, EXT_MAGIC, EXT_MSG_TYPE, EXT_VERSION, ExtensionCodec, ExtensionHeader,
    PUBLIC_HEADER_LEN, SECONDARY_HEADER_LEN, encode_extension_frame,
};
pub use legacy::{
    LEGACY_DYNAMIC_TYPE, LEGACY_EXT_HEAD_LEN, LEGACY_HEAD_LEN, LEGACY_PLAIN_TYPE,
    LEGACY_TRANSFER_TYPE, LegacyCodec, encode_legacy_dynamic, encode_legacy_plain,
};
pub use metrics::{CodecMetrics, CodecMetricsSnapshot};
pub use tglog::{TGLOG_HEADER_LEN, TGLOG_MAGIC, TglogCodec};
pub use tlv::{
    TAG_EXTENSION, TAG_PAYLOAD, TAG_ROUTING_KEY, TAG_SERVICE_ID, TAG_TIMESTAMP, TLV_HEADER_LEN,
    TLV_HEARTBEAT_TYPE, TLV_MAGIC, TLV_OPS_TYPES, TlvCodec,
};

/// Framing selected for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeType {
    Extension,
    Tlv,
    Legacy,
    Tglog,
}

impl DecodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extension => "extension",
            Self::Tlv => "tlv",
            Self::Legacy => "legacy",
            Self::Tglog => "tglog",
        }
    }

    /// Build the codec for this framing
    pub fn codec(self) -> Arc<dyn Codec> {
        match self {
            Self::Extension => Arc::new(ExtensionCodec::new()),
            Self::Tlv => Arc::new(TlvCodec::new()),
            Self::Legacy => Arc::new(LegacyCodec::new()),
            Self::Tglog => Arc::new(TglogCodec::new()),
        }
    }
}

impl fmt::Display for DecodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecodeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "extension" | "ext" | "v2" => Ok(Self::Extension),
            "tlv" => Ok(Self::Tlv),
            "legacy" | "dynamical" | "v1" => Ok(Self::Legacy),
            "tglog" => Ok(Self::Tglog),
            other => Err(format!("unknown decode type '{other}'")),
        }
    }
}

/// A framing codec
///
/// Implementors provide [`decode_frame`](Codec::decode_frame); the provided
/// [`decode`](Codec::decode) wraps it with accounting and error annotation.
pub trait Codec: Send + Sync + fmt::Debug {
    fn decode_type(&self) -> DecodeType;

    /// Parse the header in `record`'s payload, fill metadata and strip framing
    fn decode_frame(&self, record: &mut Record) -> Result<()>;

    /// Serialize `record` into this framing
    fn encode(&self, record: &Record, out: &mut BytesMut) -> Result<()>;

    /// Total length of the frame starting at `buf`, once the header is
    /// available. `Ok(None)` means more bytes are needed to tell.
    fn frame_length(&self, buf: &[u8]) -> Result<Option<usize>>;

    fn metrics(&self) -> &CodecMetrics;

    /// Decode with accounting; on failure the record carries the error
    fn decode(&self, record: &mut Record) -> Result<()> {
        let wire_len = record.len() as u64;
        match self.decode_frame(record) {
            Ok(()) => {
                let metrics = self.metrics();
                metrics.record_received(wire_len);
                match record.error_code() {
                    Some(ErrorCode::Skip) => metrics.record_skipped(),
                    Some(ErrorCode::Transfer) => metrics.record_transferred(),
                    _ => {}
                }
                Ok(())
            }
            Err(e) => {
                self.metrics().record_failure(e.kind());
                record.set_error(ErrorCode::Decode, e.to_string());
                Err(e)
            }
        }
    }
}

/// Check a declared length against the ceiling and what is available
#[inline]
pub(crate) fn check_len(declared: usize, available: usize) -> Result<()> {
    if declared > crate::MAX_BODY_LEN || declared > available {
        return Err(ProtocolError::body_length(declared, available));
    }
    Ok(())
}

/// Strip everything outside `start..end` from the payload without copying
#[inline]
pub(crate) fn narrow_payload(record: &mut Record, start: usize, end: usize) {
    let payload = record.payload_mut();
    payload.truncate(end);
    let _ = payload.split_to(start);
}



#[cfg(test)]
#[path = "legacy_test.rs"]
mod legacy_test;
