//! Live table of configured outbound connections.
//!
//! The table is swapped atomically on reload. Entries whose configuration
//! did not change keep their descriptor, so memoized destinations and
//! active connection counts survive a reload.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::{OutboundConnection, OutboundError, OutboundSocketBinding};
use crate::config::schema::{EndpointConfig, OutboundConnectionConfig, OutboundKind, OutboundSocketBindingConfig};
use crate::net::endpoint::Endpoint;
use crate::options::OptionMap;
use crate::sasl::client::PasswordCredentials;

#[derive(Clone)]
struct RegistryEntry {
    config: OutboundConnectionConfig,
    binding: Option<OutboundSocketBindingConfig>,
    connection: Arc<OutboundConnection>,
}

/// Counts from one reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub unchanged: usize,
}

pub struct OutboundRegistry {
    endpoint: Arc<Endpoint>,
    entries: ArcSwap<HashMap<String, RegistryEntry>>,
}

impl OutboundRegistry {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Build a registry from `config`.
    pub fn from_config(endpoint: Arc<Endpoint>, config: &EndpointConfig) -> Result<Self, OutboundError> {
        let registry = Self::new(endpoint);
        registry.reload(config)?;
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<OutboundConnection>> {
        self.entries.load().get(name).map(|e| Arc::clone(&e.connection))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Replace the table with the connections in `config`.
    ///
    /// Nothing is swapped if any entry fails to build.
    pub fn reload(&self, config: &EndpointConfig) -> Result<ReloadSummary, OutboundError> {
        let current = self.entries.load();
        let bindings: HashMap<&str, &OutboundSocketBindingConfig> = config
            .outbound_socket_bindings
            .iter()
            .map(|b| (b.name.as_str(), b))
            .collect();

        let mut summary = ReloadSummary::default();
        let mut next = HashMap::with_capacity(config.outbound_connections.len());

        for outbound in &config.outbound_connections {
            let binding = outbound
                .outbound_socket_binding
                .as_deref()
                .and_then(|name| bindings.get(name).map(|b| (*b).clone()));

            let entry = match current.get(&outbound.name) {
                Some(old) if old.config == *outbound && old.binding == binding => {
                    summary.unchanged += 1;
                    old.clone()
                }
                previous => {
                    if previous.is_some() {
                        summary.changed += 1;
                    } else {
                        summary.added += 1;
                    }
                    let connection = build_connection(outbound, binding.as_ref(), &self.endpoint)?;
                    RegistryEntry {
                        config: outbound.clone(),
                        binding,
                        connection: Arc::new(connection),
                    }
                }
            };
            next.insert(outbound.name.clone(), entry);
        }
        summary.removed = current.keys().filter(|name| !next.contains_key(*name)).count();

        self.entries.store(Arc::new(next));
        tracing::info!(
            added = summary.added,
            changed = summary.changed,
            removed = summary.removed,
            unchanged = summary.unchanged,
            "Outbound connections reloaded"
        );
        Ok(summary)
    }
}

fn build_connection(
    config: &OutboundConnectionConfig,
    binding: Option<&OutboundSocketBindingConfig>,
    endpoint: &Arc<Endpoint>,
) -> Result<OutboundConnection, OutboundError> {
    let endpoint = Some(Arc::clone(endpoint));
    let binding = || {
        binding
            .map(|b| {
                Arc::new(OutboundSocketBinding {
                    name: b.name.clone(),
                    host: b.host.clone(),
                    port: b.port,
                })
            })
            .ok_or_else(|| OutboundError::Config {
                connection: config.name.clone(),
                value: config.outbound_socket_binding.clone().unwrap_or_default(),
                reason: "unknown outbound socket binding".into(),
            })
    };

    let connection = match config.kind {
        OutboundKind::Local => OutboundConnection::local(&config.name, binding()?, endpoint)?,
        OutboundKind::Remote => OutboundConnection::remote(&config.name, binding()?, endpoint)?,
        OutboundKind::Generic => {
            let uri = config.uri.as_deref().ok_or_else(|| OutboundError::Config {
                connection: config.name.clone(),
                value: String::new(),
                reason: "generic connection needs a uri".into(),
            })?;
            OutboundConnection::generic(&config.name, uri, endpoint)?
        }
    };

    let mut options = OptionMap::builder();
    for (key, value) in &config.properties {
        options = options.set(key, value.clone());
    }
    let connection = connection.with_options(options.build());

    Ok(match &config.username {
        Some(username) => connection.with_credentials(Arc::new(PasswordCredentials::new(
            username.clone(),
            config.password.clone().unwrap_or_default(),
        ))),
        None => connection,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(raw: &str) -> EndpointConfig {
        toml::from_str(raw).unwrap()
    }

    const BASE: &str = r#"
        [[outbound_socket_bindings]]
        name = "db"
        host = "127.0.0.1"
        port = 4447

        [[outbound_connections]]
        name = "a"
        kind = "remote"
        outbound_socket_binding = "db"

        [[outbound_connections]]
        name = "b"
        kind = "generic"
        uri = "remote://127.0.0.1:5000"
        username = "bob"
        password = "secret"
    "#;

    #[test]
    fn builds_every_connection() {
        let registry = OutboundRegistry::from_config(Endpoint::new("test"), &config(BASE)).unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.get("a").unwrap().kind(), "remote");
        assert_eq!(registry.get("b").unwrap().kind(), "generic");
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn reload_keeps_unchanged_descriptors() {
        let registry = OutboundRegistry::from_config(Endpoint::new("test"), &config(BASE)).unwrap();
        let a_before = registry.get("a").unwrap();
        let b_before = registry.get("b").unwrap();

        let updated = BASE.replace("remote://127.0.0.1:5000", "remote://127.0.0.1:6000");
        let summary = registry.reload(&config(&updated)).unwrap();

        assert_eq!(
            summary,
            ReloadSummary {
                added: 0,
                changed: 1,
                removed: 0,
                unchanged: 1
            }
        );
        assert!(Arc::ptr_eq(&a_before, &registry.get("a").unwrap()));
        assert!(!Arc::ptr_eq(&b_before, &registry.get("b").unwrap()));
    }

    #[test]
    fn failed_reload_keeps_old_table() {
        let registry = OutboundRegistry::from_config(Endpoint::new("test"), &config(BASE)).unwrap();
        let broken = BASE.replace("remote://127.0.0.1:5000", "not a uri");
        assert!(registry.reload(&config(&broken)).is_err());
        assert_eq!(registry.len(), 2);

        let summary = registry.reload(&EndpointConfig::default()).unwrap();
        assert_eq!(summary.removed, 2);
        assert!(registry.is_empty());
    }
}
