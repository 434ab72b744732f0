//! Routing error types

use thiserror::Error;

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors raised while compiling filters or applying route updates
///
/// A lookup miss or a filter that does not match is never an error.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Update payload is not valid JSON for the expected shape
    #[error("invalid route payload: {source}")]
    InvalidPayload {
        #[source]
        source: serde_json::Error,
    },

    /// A required field is absent or empty
    #[error("route config for channel {channel_id} is missing '{field}'")]
    MissingField { channel_id: u32, field: String },

    /// A route names a filter that is not declared in the same payload
    #[error("route '{route}' references unknown filter '{filter}'")]
    UnknownFilter { route: String, filter: String },

    /// A filter declaration cannot be evaluated
    #[error("invalid filter '{name}': {reason}")]
    InvalidFilter { name: String, reason: String },

    /// The route target names no supported sink kind
    #[error("route '{route}' has no supported stream_to target")]
    UnsupportedTarget { route: String },
}

impl RoutingError {
    #[inline]
    pub fn missing_field(channel_id: u32, field: impl Into<String>) -> Self {
        Self::MissingField {
            channel_id,
            field: field.into(),
        }
    }

    #[inline]
    pub fn unknown_filter(route: impl Into<String>, filter: impl Into<String>) -> Self {
        Self::UnknownFilter {
            route: route.into(),
            filter: filter.into(),
        }
    }

    #[inline]
    pub fn invalid_filter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn unsupported_target(route: impl Into<String>) -> Self {
        Self::UnsupportedTarget {
            route: route.into(),
        }
    }
}

impl From<serde_json::Error> for RoutingError {
    fn from(source: serde_json::Error) -> Self {
        Self::InvalidPayload { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_filter_error() {
        let err = RoutingError::unknown_filter("to_kafka", "by_region");
        assert!(err.to_string().contains("to_kafka"));
        assert!(err.to_string().contains("by_region"));
    }

    #[test]
    fn test_missing_field_error() {
        let err = RoutingError::missing_field(1001, "route");
        assert_eq!(
            err.to_string(),
            "route config for channel 1001 is missing 'route'"
        );
    }

    #[test]
    fn test_invalid_payload_from_json() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err = RoutingError::from(json_err);
        assert!(matches!(err, RoutingError::InvalidPayload { .. }));
        assert!(err.to_string().starts_with("invalid route payload"));
    }
}
