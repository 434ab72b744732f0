//! Protocol error types
//!
//! Errors raised while framing or decoding inbound messages. Every variant
//! maps onto one failure category so codecs can count failures per kind.

use thiserror::Error;

/// Failure category used for per-codec accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Header magic did not match
    Magic,
    /// A declared length is out of bounds
    BodyLength,
    /// A required field/tag was absent
    MissingTag,
    /// A sub-field (LV, TLV, meta entry) overran its region
    Malformed,
    /// Message type not accepted by this codec
    MessageType,
}

/// Errors that can occur during protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer is too short to contain the fixed header
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    MessageTooShort { expected: usize, actual: usize },

    /// Header magic did not match
    #[error("magic mismatch: expected {expected:#010x}, got {actual:#010x}")]
    MagicMismatch { expected: u32, actual: u32 },

    /// Declared body length is invalid
    #[error("invalid body length {declared} (available {available}, max {max})")]
    BodyLength {
        declared: usize,
        available: usize,
        max: usize,
    },

    /// Required tag absent from a self-describing message
    #[error("missing required tag {0:#06x}")]
    MissingTag(u16),

    /// TLV record overran the message
    #[error("malformed tag {tag:#06x} at offset {offset}")]
    MalformedTag { tag: u16, offset: usize },

    /// Extension region is inconsistent
    #[error("malformed extension: {0}")]
    MalformedExtension(String),

    /// Message type not accepted by the codec
    #[error("unsupported message type {0:#x}")]
    UnsupportedMessageType(u32),

    /// Encoder input does not fit the wire format
    #[error("encode failed: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Create a message too short error
    #[inline]
    pub fn too_short(expected: usize, actual: usize) -> Self {
        Self::MessageTooShort { expected, actual }
    }

    /// Create a magic mismatch error
    #[inline]
    pub fn magic(expected: u32, actual: u32) -> Self {
        Self::MagicMismatch { expected, actual }
    }

    /// Create a body length error
    #[inline]
    pub fn body_length(declared: usize, available: usize) -> Self {
        Self::BodyLength {
            declared,
            available,
            max: crate::MAX_BODY_LEN,
        }
    }

    /// Create a malformed extension error
    #[inline]
    pub fn malformed_extension(msg: impl Into<String>) -> Self {
        Self::MalformedExtension(msg.into())
    }

    /// Create an encode error
    #[inline]
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Failure category for metrics
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MagicMismatch { .. } => FailureKind::Magic,
            Self::MessageTooShort { .. } | Self::BodyLength { .. } => FailureKind::BodyLength,
            Self::MissingTag(_) => FailureKind::MissingTag,
            Self::MalformedTag { .. } | Self::MalformedExtension(_) | Self::Encode(_) => {
                FailureKind::Malformed
            }
            Self::UnsupportedMessageType(_) => FailureKind::MessageType,
        }
    }
}
