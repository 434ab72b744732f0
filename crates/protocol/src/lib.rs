//! Conduit Protocol - record model and wire codecs
//!
//! This crate provides the types that flow through the ingestion pipeline:
//! - `Record` - one in-flight message plus its delivery metadata
//! - `ChannelId` - 32-bit routing key (12-bit platform, 20-bit stream)
//! - `Codec` / `DecodeType` - pluggable framing decoders and encoders
//! - `OpsReporter` / `OpsSnapshot` - delivery accounting
//!
//! # Design Principles
//!
//! - **Move semantics**: a `Record` has exactly one owner at a time and is not `Clone`
//! - **No copies on decode**: framing is stripped by narrowing the `BytesMut` in place
//! - **Validate before trust**: magic and type are checked before any length is used
//! - **Never panic on input**: every decoder returns `Result`

mod channel_id;
mod error;
mod ops;
mod record;

pub mod codec;

pub use channel_id::ChannelId;
pub use codec::{Codec, CodecMetrics, CodecMetricsSnapshot, DecodeType};
pub use error::{FailureKind, ProtocolError};
pub use ops::{CountingOpsReporter, NoopOpsReporter, OpsCounts, OpsReporter, OpsSnapshot, OpsState};
pub use record::{
    Clock, DynamicFields, ErrorCode, OutputInfo, Record, RecordError, SourceEndpoint, SystemClock,
    Transport, now_ms,
};

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Upper bound for any declared body or message length (64 MiB)
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

#[cfg(test)]
mod record_test;
