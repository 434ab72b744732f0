//! Routing key carried by every record
//!
//! A channel id packs a 12-bit platform number above a 20-bit stream id.
//! Platform 0 marks a legacy id allocated before platforms existed.

use std::fmt;

/// Bits used by the stream part
pub const STREAM_BITS: u32 = 20;

/// Mask selecting the stream part
pub const STREAM_MASK: u32 = (1 << STREAM_BITS) - 1;

/// Largest platform number representable in 12 bits
pub const MAX_PLATFORM: u32 = (1 << (32 - STREAM_BITS)) - 1;

/// Routing key of a record
///
/// # Example
///
/// ```
/// use conduit_protocol::ChannelId;
///
/// let id = ChannelId::from_parts(3, 1001);
/// assert_eq!(id.platform(), 3);
/// assert_eq!(id.stream(), 1001);
/// assert_eq!(ChannelId::new(id.get()), id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChannelId(u32);

impl ChannelId {
    /// The "no routing" key
    pub const NONE: ChannelId = ChannelId(0);

    /// Wrap a raw 32-bit key
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Build from platform and stream parts (excess bits are masked off)
    #[inline]
    pub const fn from_parts(platform: u32, stream: u32) -> Self {
        Self(((platform & MAX_PLATFORM) << STREAM_BITS) | (stream & STREAM_MASK))
    }

    /// Raw value as seen on the wire
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Top 12 bits
    #[inline]
    pub const fn platform(self) -> u32 {
        self.0 >> STREAM_BITS
    }

    /// Low 20 bits
    #[inline]
    pub const fn stream(self) -> u32 {
        self.0 & STREAM_MASK
    }

    /// Allocated before platform numbers existed
    #[inline]
    pub const fn is_legacy(self) -> bool {
        self.platform() == 0
    }

    /// Zero key: deliver to dataflow exporters only
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ChannelId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<ChannelId> for u32 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}
