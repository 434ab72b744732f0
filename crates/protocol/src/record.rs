//! In-flight record
//!
//! A `Record` is created by a receiver for each framed inbound message and is
//! moved stage to stage (worker queue, codec, exporters) until the stage that
//! ends its journey drops it. It is deliberately not `Clone`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};

use crate::ChannelId;
use crate::ops::{OpsSnapshot, OpsState};

/// Wall-clock milliseconds since the Unix epoch
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock source, injected where timestamps are stamped
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// Clock backed by `SystemTime`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

/// Transport a record arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
    Http,
    /// Produced in-process (tests, internal ops)
    Local,
}

impl Transport {
    /// Lowercase name used in tags and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub transport: Transport,
}

impl Default for SourceEndpoint {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            transport: Transport::Local,
        }
    }
}

/// Terminal or branching condition attached to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Framing or decode failure
    Decode,
    /// Legacy transfer message, forwarded raw to the transfer exporter
    Transfer,
    /// Heartbeat or other message that is silently dropped
    Skip,
    /// An exporter failed to deliver
    Export,
    /// Dropped by load shedding
    QueueFull,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Transfer => "transfer",
            Self::Skip => "skip",
            Self::Export => "export",
            Self::QueueFull => "queue_full",
        }
    }
}

/// Error code plus human-readable detail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    pub code: ErrorCode,
    pub message: String,
}

/// Named fields decoded from the extension header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicFields {
    pub source_id: Option<String>,
    pub event_name: Option<String>,
    pub business_id: Option<String>,
}

/// Output annotations written by the last exporter that handled the record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputInfo {
    /// e.g. `proxy|tcp|10.0.0.1|58625`
    pub tag: String,
    pub address: String,
    pub kind: &'static str,
}

/// One in-flight unit of data
#[derive(Debug)]
pub struct Record {
    payload: BytesMut,

    /// Routing key (0 = dataflow exporters only)
    pub channel_id: ChannelId,
    pub source: SourceEndpoint,

    /// Receiver stamp (ms)
    pub arrived_at_ms: u64,
    /// Producer stamp carried on the wire (seconds)
    pub created_at: u32,
    /// Stamped right before export (ms)
    pub output_at_ms: u64,

    /// Wire message type reported by the codec
    pub msg_type: u32,
    pub error: Option<RecordError>,

    /// Ordered protocol side-channel tags
    pub extensions: Vec<String>,
    pub fields: DynamicFields,
    /// `key=value` labels from legacy meta regions
    pub labels: Vec<(String, String)>,

    /// Output table/topic names appended by the router before each delivery
    pub table_names: Vec<String>,
    pub partition_hint: Option<u32>,
    pub output: OutputInfo,

    /// Internal self-telemetry record
    pub is_ops: bool,
    pub service_id: u32,
}

impl Record {
    /// Create a record around a raw inbound buffer
    pub fn new(payload: BytesMut, source: SourceEndpoint) -> Self {
        Self {
            payload,
            channel_id: ChannelId::NONE,
            source,
            arrived_at_ms: now_ms(),
            created_at: 0,
            output_at_ms: 0,
            msg_type: 0,
            error: None,
            extensions: Vec::new(),
            fields: DynamicFields::default(),
            labels: Vec::new(),
            table_names: Vec::new(),
            partition_hint: None,
            output: OutputInfo::default(),
            is_ops: false,
            service_id: 0,
        }
    }

    /// Record with a copied payload and a local source (tests, internal use)
    pub fn from_slice(payload: &[u8]) -> Self {
        Self::new(BytesMut::from(payload), SourceEndpoint::default())
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    /// Replace the payload buffer
    #[inline]
    pub fn set_payload(&mut self, payload: BytesMut) {
        self.payload = payload;
    }

    /// Cheap shared copy of the payload for sinks that hand bytes to a client
    pub fn payload_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.payload)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Attach an error, replacing any earlier one
    pub fn set_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.error = Some(RecordError {
            code,
            message: message.into(),
        });
    }

    #[inline]
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    #[inline]
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Concatenated extension tags in `[a][b]` form, used by filters
    pub fn extension_string(&self) -> String {
        let cap = self.extensions.iter().map(|e| e.len() + 2).sum();
        let mut out = String::with_capacity(cap);
        for ext in &self.extensions {
            out.push('[');
            out.push_str(ext);
            out.push(']');
        }
        out
    }

    /// Append an output table name
    pub fn add_table_name(&mut self, name: impl Into<String>) {
        self.table_names.push(name.into());
    }

    /// Mark the record as handed to an exporter
    pub fn set_output(&mut self, kind: &'static str, address: impl Into<String>, tag: String) {
        self.output = OutputInfo {
            tag,
            address: address.into(),
            kind,
        };
    }

    /// Accounting view of the record in the given state
    pub fn ops_snapshot(&self, state: OpsState) -> OpsSnapshot {
        OpsSnapshot {
            state,
            channel_id: self.channel_id,
            bytes: self.payload.len() as u64,
            source_ip: self.source.ip,
            transport: self.source.transport,
            arrived_at_ms: self.arrived_at_ms,
            output_at_ms: self.output_at_ms,
            output_tag: self.output.tag.clone(),
            error: self.error.clone(),
        }
    }
}
