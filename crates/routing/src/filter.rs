//! Record filters attached to route bindings
//!
//! A [`Filter`] holds an AND-list and an OR-list of [`FieldPredicate`]s. The
//! OR-list is checked first: when it is non-empty at least one predicate must
//! match. Every AND predicate must then match.
//!
//! Predicates look either at the record's extension string (`[a][b]...`) or
//! at the first delimited field of the payload.

use std::fmt;
use std::str::FromStr;

use conduit_protocol::Record;
use serde::Deserialize;

use crate::{Result, RoutingError};

/// Where a predicate looks for its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldIn {
    /// Decoded protocol extensions
    Protocol,
    /// First delimited field of the payload
    Data,
}

impl FieldIn {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for FieldIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldIn {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "protocol" => Ok(Self::Protocol),
            "data" => Ok(Self::Data),
            other => Err(RoutingError::invalid_filter(
                other,
                "field_in must be 'protocol' or 'data'",
            )),
        }
    }
}

/// One named match condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPredicate {
    pub name: String,
    pub field_in: FieldIn,
    pub value: String,
    pub separator: String,
}

impl FieldPredicate {
    /// Predicate over the extension string: matches when it contains `[value]`
    pub fn protocol(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_in: FieldIn::Protocol,
            value: value.into(),
            separator: String::new(),
        }
    }

    /// Predicate over the payload: matches when the bytes before the first
    /// `separator` equal `value`
    pub fn data(
        name: impl Into<String>,
        value: impl Into<String>,
        separator: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field_in: FieldIn::Data,
            value: value.into(),
            separator: separator.into(),
        }
    }

    /// Bracketed form used against the extension string
    #[inline]
    fn tag(&self) -> String {
        format!("[{}]", self.value)
    }

    fn matches(&self, record: &Record, extensions: &str) -> bool {
        match self.field_in {
            FieldIn::Protocol => extensions.contains(&self.tag()),
            FieldIn::Data => first_field(record.payload(), self.separator.as_bytes())
                == self.value.as_bytes(),
        }
    }
}

/// Bytes before the first `separator`, or the whole buffer when it is absent
///
/// An empty separator is found at offset 0, so the field is empty.
fn first_field<'a>(payload: &'a [u8], separator: &[u8]) -> &'a [u8] {
    if separator.is_empty() {
        return &payload[..0];
    }
    if separator.len() > payload.len() {
        return payload;
    }
    match payload
        .windows(separator.len())
        .position(|window| window == separator)
    {
        Some(pos) => &payload[..pos],
        None => payload,
    }
}

/// Compiled AND/OR filter
///
/// An empty filter accepts every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    and: Vec<FieldPredicate>,
    or: Vec<FieldPredicate>,
    /// Concatenated `[value]` tags of the protocol AND predicates
    and_protocol: String,
    /// Whether any AND predicate inspects the payload
    and_checks_data: bool,
}

impl Filter {
    pub fn new(and: Vec<FieldPredicate>, or: Vec<FieldPredicate>) -> Self {
        let and_protocol = and
            .iter()
            .filter(|p| p.field_in == FieldIn::Protocol)
            .map(FieldPredicate::tag)
            .collect();
        let and_checks_data = and.iter().any(|p| p.field_in == FieldIn::Data);
        Self {
            and,
            or,
            and_protocol,
            and_checks_data,
        }
    }

    /// Filter that accepts everything
    pub fn accept_all() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.and.is_empty() && self.or.is_empty()
    }

    pub fn and_predicates(&self) -> &[FieldPredicate] {
        &self.and
    }

    pub fn or_predicates(&self) -> &[FieldPredicate] {
        &self.or
    }

    /// Evaluate the filter against a decoded record
    pub fn matches(&self, record: &Record) -> bool {
        if self.is_empty() {
            return true;
        }
        let extensions = record.extension_string();
        self.check_or(record, &extensions) && self.check_and(record, &extensions)
    }

    fn check_or(&self, record: &Record, extensions: &str) -> bool {
        self.or.is_empty() || self.or.iter().any(|p| p.matches(record, extensions))
    }

    fn check_and(&self, record: &Record, extensions: &str) -> bool {
        if self.and.is_empty() {
            return true;
        }
        // equal length: match iff identical to the AND tags
        if !self.and_checks_data && extensions.len() == self.and_protocol.len() {
            return extensions == self.and_protocol;
        }
        self.and.iter().all(|p| p.matches(record, extensions))
    }
}
