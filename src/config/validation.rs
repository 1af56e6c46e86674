//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (connectors reference existing realms and
//!   bindings, outbound connections reference outbound bindings)
//! - Validate value ranges and address formats
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EndpointConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::schema::{ConnectorConfig, EndpointConfig, OutboundConnectionConfig, OutboundKind};
use crate::sasl::Mechanism;

/// Services the endpoint knows how to register.
pub const KNOWN_SERVICES: &[&str] = &["echo"];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A single semantic problem, located by a dotted path into the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate `config`, collecting every problem found.
pub fn validate_config(config: &EndpointConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.endpoint.name.trim().is_empty() {
        errors.push(ValidationError::new("endpoint.name", "must not be empty"));
    }
    for service in &config.endpoint.services {
        if !KNOWN_SERVICES.contains(&service.as_str()) {
            errors.push(ValidationError::new(
                "endpoint.services",
                format!("unknown service '{service}'"),
            ));
        }
    }

    let interfaces = unique_names(
        "interfaces",
        config.interfaces.iter().map(|i| i.name.as_str()),
        &mut errors,
    );
    for iface in &config.interfaces {
        if iface.address.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::new(
                format!("interfaces.{}.address", iface.name),
                format!("'{}' is not an IP address", iface.address),
            ));
        }
    }

    let socket_bindings = unique_names(
        "socket_bindings",
        config.socket_bindings.iter().map(|b| b.name.as_str()),
        &mut errors,
    );
    for binding in &config.socket_bindings {
        if !interfaces.contains(binding.interface.as_str()) {
            errors.push(ValidationError::new(
                format!("socket_bindings.{}.interface", binding.name),
                format!("unknown interface '{}'", binding.interface),
            ));
        }
    }

    let outbound_bindings = unique_names(
        "outbound_socket_bindings",
        config.outbound_socket_bindings.iter().map(|b| b.name.as_str()),
        &mut errors,
    );
    for binding in &config.outbound_socket_bindings {
        if binding.host.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("outbound_socket_bindings.{}.host", binding.name),
                "must not be empty",
            ));
        }
        if binding.port == 0 {
            errors.push(ValidationError::new(
                format!("outbound_socket_bindings.{}.port", binding.name),
                "must be greater than 0",
            ));
        }
    }

    let realms = unique_names("realms", config.realms.iter().map(|r| r.name.as_str()), &mut errors);

    unique_names(
        "connectors",
        config.connectors.iter().map(|c| c.name.as_str()),
        &mut errors,
    );
    for connector in &config.connectors {
        validate_connector(connector, &interfaces, &socket_bindings, &realms, &mut errors);
    }

    unique_names(
        "outbound_connections",
        config.outbound_connections.iter().map(|c| c.name.as_str()),
        &mut errors,
    );
    for outbound in &config.outbound_connections {
        validate_outbound(outbound, &outbound_bindings, &mut errors);
    }

    if !LOG_LEVELS.contains(&config.observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", config.observability.log_level),
        ));
    }
    if config.observability.metrics_enabled && config.observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_connector(
    connector: &ConnectorConfig,
    interfaces: &HashSet<&str>,
    socket_bindings: &HashSet<&str>,
    realms: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let field = |suffix: &str| format!("connectors.{}.{suffix}", connector.name);

    let strategies = [
        connector.socket_binding.is_some(),
        connector.interface.is_some(),
        connector.address.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if strategies != 1 {
        errors.push(ValidationError::new(
            field("binding"),
            "exactly one of socket_binding, interface or address must be set",
        ));
    }

    if let Some(name) = &connector.socket_binding {
        if !socket_bindings.contains(name.as_str()) {
            errors.push(ValidationError::new(
                field("socket_binding"),
                format!("unknown socket binding '{name}'"),
            ));
        }
    }
    if let Some(name) = &connector.interface {
        if !interfaces.contains(name.as_str()) {
            errors.push(ValidationError::new(field("interface"), format!("unknown interface '{name}'")));
        }
        if connector.port.is_none() {
            errors.push(ValidationError::new(field("port"), "required with interface"));
        }
    }
    if let Some(address) = &connector.address {
        if address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                field("address"),
                format!("'{address}' is not a socket address"),
            ));
        }
    }

    if let Some(realm) = &connector.security_realm {
        if !realms.contains(realm.as_str()) {
            errors.push(ValidationError::new(
                field("security_realm"),
                format!("unknown realm '{realm}'"),
            ));
        }
    }

    for name in connector.sasl.include_mechanisms.iter().flatten() {
        if name.parse::<Mechanism>().is_err() {
            errors.push(ValidationError::new(
                field("sasl.include_mechanisms"),
                format!("unknown mechanism '{name}'"),
            ));
        }
    }
}

fn validate_outbound(
    outbound: &OutboundConnectionConfig,
    outbound_bindings: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let field = |suffix: &str| format!("outbound_connections.{}.{suffix}", outbound.name);

    match outbound.kind {
        OutboundKind::Local | OutboundKind::Remote => match &outbound.outbound_socket_binding {
            Some(name) if outbound_bindings.contains(name.as_str()) => {}
            Some(name) => errors.push(ValidationError::new(
                field("outbound_socket_binding"),
                format!("unknown outbound socket binding '{name}'"),
            )),
            None => errors.push(ValidationError::new(
                field("outbound_socket_binding"),
                "required for local and remote connections",
            )),
        },
        OutboundKind::Generic => {
            if outbound.uri.as_deref().map_or(true, |u| u.trim().is_empty()) {
                errors.push(ValidationError::new(field("uri"), "required for generic connections"));
            }
        }
    }

    if outbound.password.is_some() && outbound.username.is_none() {
        errors.push(ValidationError::new(field("password"), "set without username"));
    }
}

/// Report empty and duplicate names; returns the set of names seen.
fn unique_names<'a>(
    section: &str,
    names: impl Iterator<Item = &'a str>,
    errors: &mut Vec<ValidationError>,
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{section}.name"), "must not be empty"));
        } else if !seen.insert(name) {
            errors.push(ValidationError::new(section, format!("duplicate name '{name}'")));
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> EndpointConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&EndpointConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let config = parse(
            r#"
            [[connectors]]
            name = "a"
            socket_binding = "missing"
            security_realm = "nope"

            [connectors.sasl]
            include_mechanisms = ["CRAM-MD5"]

            [[outbound_connections]]
            name = "b"
            kind = "remote"
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"connectors.a.socket_binding"));
        assert!(fields.contains(&"connectors.a.security_realm"));
        assert!(fields.contains(&"connectors.a.sasl.include_mechanisms"));
        assert!(fields.contains(&"outbound_connections.b.outbound_socket_binding"));
    }

    #[test]
    fn connector_needs_exactly_one_binding() {
        let config = parse(
            r#"
            [[connectors]]
            name = "a"
            address = "127.0.0.1:4447"
            socket_binding = "x"

            [[connectors]]
            name = "b"
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors.iter().filter(|e| e.field.ends_with(".binding")).count(),
            2
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let config = parse(
            r#"
            [[interfaces]]
            name = "public"
            address = "0.0.0.0"

            [[interfaces]]
            name = "public"
            address = "::"
            "#,
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].to_string(), "interfaces: duplicate name 'public'");
    }
}
