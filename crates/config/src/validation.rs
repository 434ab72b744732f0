//! Configuration validation
//!
//! Validates config consistency:
//! - Channel names are present and unique, decode types are known
//! - No two receivers of one protocol share a port
//! - Every exporter a channel or route names is declared
//! - Exporter settings pass their own checks (address lists, pool sizes, redis mode)
//! - Routes have a key, and their filters and targets resolve

use std::collections::{BTreeMap, HashMap, HashSet};

use conduit_sinks::{ExporterKind, ExporterSettings};
use conduit_sources::ReceiverProtocol;

use crate::Config;
use crate::error::{ConfigError, Result};

/// Validate the entire configuration
pub fn validate_config(config: &Config) -> Result<()> {
    let exporters = config.exporters.resolve()?;
    validate_channels(config)?;
    validate_ports(config)?;
    validate_routes(config, &exporters)?;
    Ok(())
}

/// Reject exporters whose client is not available to the running daemon
pub fn validate_sink_support(
    config: &Config,
    supported: impl Fn(ExporterKind) -> bool,
) -> Result<()> {
    for (name, settings) in config.exporters.resolve()? {
        let kind = settings.kind();
        if !supported(kind) {
            return Err(ConfigError::invalid_value(
                "exporter",
                name,
                "type",
                format!("no {kind} client is available in this build"),
            ));
        }
    }
    Ok(())
}

fn validate_channels(config: &Config) -> Result<()> {
    let mut names = HashSet::new();
    for channel in &config.channels {
        if channel.name.is_empty() {
            return Err(ConfigError::missing_field("channel", "<unnamed>", "name"));
        }
        if !names.insert(channel.name.as_str()) {
            return Err(ConfigError::duplicate("channel", &channel.name));
        }
        channel.decode_type()?;

        if channel.receiver.socket_addr().is_err() {
            return Err(ConfigError::invalid_value(
                "channel",
                &channel.name,
                "receiver.address",
                format!("'{}' is not an IP address", channel.receiver.address),
            ));
        }
        if channel.queue_ceiling == 0 {
            return Err(ConfigError::invalid_value(
                "channel",
                &channel.name,
                "queue_ceiling",
                "must be at least 1",
            ));
        }

        let referenced_by = format!("channel '{}'", channel.name);
        for exporter in channel.exporter_refs() {
            if !config.exporters.contains(exporter) {
                return Err(ConfigError::unknown_exporter(exporter, &referenced_by));
            }
        }
    }
    Ok(())
}

/// UDP and TCP may share a port; two receivers of one protocol may not
fn validate_ports(config: &Config) -> Result<()> {
    let mut ports: HashMap<(ReceiverProtocol, u16), Vec<&str>> = HashMap::new();
    for channel in config.channels.iter().filter(|c| c.enabled) {
        // port 0 asks the OS for a free port
        if channel.receiver.port == 0 {
            continue;
        }
        ports
            .entry((channel.receiver.protocol, channel.receiver.port))
            .or_default()
            .push(channel.name.as_str());
    }

    for ((protocol, port), channels) in &ports {
        if channels.len() > 1 {
            return Err(ConfigError::duplicate_port(
                protocol.as_str(),
                *port,
                channels.join(", "),
            ));
        }
    }
    Ok(())
}

fn validate_routes(config: &Config, exporters: &BTreeMap<String, ExporterSettings>) -> Result<()> {
    let mut keys = HashSet::new();
    for route in &config.routes {
        let label = route.label();
        if route.channel_id == 0 {
            return Err(ConfigError::missing_field("route", label, "channel_id"));
        }
        if !keys.insert((route.route_key_mode, route.channel_id)) {
            return Err(ConfigError::duplicate("route", label));
        }

        let filters: HashSet<&str> = route.filters.iter().map(|f| f.name.as_str()).collect();
        for filter in &route.filters {
            if !matches!(filter.field_in.as_str(), "protocol" | "data") {
                return Err(ConfigError::invalid_value(
                    "route",
                    &label,
                    "filters.field_in",
                    format!("'{}' (expected protocol or data)", filter.field_in),
                ));
            }
        }
        for binding in &route.bindings {
            if binding.name.is_empty() {
                return Err(ConfigError::missing_field("route", &label, "bindings.name"));
            }
            let unknown = binding
                .filter_and
                .iter()
                .chain(&binding.filter_or)
                .find(|name| !filters.contains(name.as_str()));
            if let Some(name) = unknown {
                return Err(ConfigError::invalid_value(
                    "route",
                    &label,
                    "bindings",
                    format!("binding '{}' uses undeclared filter '{name}'", binding.name),
                ));
            }
        }
        route.to_payload(exporters)?;
    }
    Ok(())
}
