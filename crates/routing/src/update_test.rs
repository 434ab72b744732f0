//! Tests for route payload parsing and compilation

use conduit_protocol::Record;

use crate::{ConfigEvent, EventKind, EventTarget, FieldIn, RouteConfig, RoutingError};

const ROUTE_PAYLOAD: &str = r#"{
    "metadata": { "channel_id": 1001, "plat_name": "tglog", "version": "1.0" },
    "route": [
        {
            "name": "to_kafka",
            "stream_to": { "stream_to_id": 7, "kafka": { "topic_name": "topic_a" } },
            "filter_name_and": ["eu"]
        },
        {
            "name": "to_redis",
            "stream_to": { "stream_to_id": 8, "redis": { "data_set": "logs", "biz_id": 2 } },
            "filter_name_or": ["login", "eu"]
        },
        {
            "name": "relay",
            "stream_to": { "stream_to_id": 9, "dsproxy": {} }
        }
    ],
    "stream_filters": [
        { "name": "eu", "field_in": "protocol", "field_data_value": "region=eu" },
        { "name": "login", "field_in": "data", "field_data_value": "login", "field_separator": "|" }
    ]
}"#;

// =============================================================================
// Compilation
// =============================================================================

#[test]
fn test_compile_route_payload() {
    let config = RouteConfig::parse(ROUTE_PAYLOAD).unwrap();
    assert_eq!(config.channel_id(), 1001);
    assert_eq!(config.metadata.plat_name, "tglog");

    let chain = config.compile().unwrap();
    assert_eq!(chain.len(), 3);

    assert_eq!(chain[0].name, "to_kafka");
    assert_eq!(chain[0].exporter_id, 7);
    assert_eq!(chain[0].table, "topic_a");
    assert_eq!(chain[0].filter.and_predicates().len(), 1);
    assert_eq!(chain[0].filter.and_predicates()[0].field_in, FieldIn::Protocol);

    // redis channel defaults to data_set + biz_id
    assert_eq!(chain[1].table, "logs2");
    assert_eq!(chain[1].filter.or_predicates().len(), 2);

    assert_eq!(chain[2].exporter_id, 9);
    assert_eq!(chain[2].table, "");
    assert!(chain[2].filter.is_empty());
}

#[test]
fn test_compiled_filters_evaluate() {
    let chain = RouteConfig::parse(ROUTE_PAYLOAD).unwrap().compile().unwrap();

    let mut record = Record::from_slice(b"login|x");
    record.extensions = vec!["region=eu".into()];
    assert!(chain[0].filter.matches(&record));
    assert!(chain[1].filter.matches(&record));

    let other = Record::from_slice(b"logout|x");
    assert!(!chain[0].filter.matches(&other));
    assert!(!chain[1].filter.matches(&other));
}

#[test]
fn test_unknown_filter_name() {
    let payload = r#"{
        "metadata": { "channel_id": 5 },
        "route": [ { "name": "r", "stream_to": { "kafka": {} }, "filter_name_and": ["nope"] } ]
    }"#;
    let err = RouteConfig::parse(payload).unwrap().compile().unwrap_err();
    assert!(matches!(err, RoutingError::UnknownFilter { .. }));
}

#[test]
fn test_missing_channel_id() {
    let err = RouteConfig::parse(r#"{ "route": [] }"#)
        .unwrap()
        .compile()
        .unwrap_err();
    assert!(matches!(err, RoutingError::MissingField { .. }));
}

#[test]
fn test_route_without_target() {
    let payload = r#"{
        "metadata": { "channel_id": 5 },
        "route": [ { "name": "r", "stream_to": { "stream_to_id": 1 } } ]
    }"#;
    let err = RouteConfig::parse(payload).unwrap().compile().unwrap_err();
    assert!(matches!(err, RoutingError::UnsupportedTarget { .. }));
}

#[test]
fn test_invalid_field_in() {
    let payload = r#"{
        "metadata": { "channel_id": 5 },
        "stream_filters": [ { "name": "f", "field_in": "header" } ]
    }"#;
    let err = RouteConfig::parse(payload).unwrap().compile().unwrap_err();
    assert!(matches!(err, RoutingError::InvalidFilter { .. }));
}

#[test]
fn test_malformed_json() {
    let err = RouteConfig::parse("{ not json").unwrap_err();
    assert!(matches!(err, RoutingError::InvalidPayload { .. }));
}

#[test]
fn test_parse_list() {
    let payload = format!("[{ROUTE_PAYLOAD}, {{ \"metadata\": {{ \"channel_id\": 2 }} }}]");
    let list = RouteConfig::parse_list(&payload).unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[1].channel_id(), 2);
    assert!(list[1].compile().unwrap().is_empty());
}

// =============================================================================
// Events
// =============================================================================

#[test]
fn test_event_from_json() {
    let event: ConfigEvent =
        serde_json::from_str(r#"{ "kind": "change", "target": "route", "key": 1001, "payload": "{}" }"#)
            .unwrap();
    assert_eq!(event, ConfigEvent::route(EventKind::Change, 1001, "{}"));
}

#[test]
fn test_delete_event_helpers() {
    let event = ConfigEvent::delete_exporter(7);
    assert_eq!(event.kind, EventKind::Delete);
    assert_eq!(event.target, EventTarget::Exporter);
    assert!(event.payload.is_empty());
}
