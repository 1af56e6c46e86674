//! Startup orchestration.
//!
//! # Responsibilities
//! - Build realms, negotiators and the endpoint from a validated config
//! - Register the configured channel services
//! - Build the outbound connection registry
//! - Bind stream servers last, so traffic only arrives once ready
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal, and servers already bound are
//!   stopped again before the error is returned
//! - Subsystems initialize in order, not concurrently

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use thiserror::Error;

use super::shutdown::{resolve_channel_shutdown_timeout, Interrupt, StopContext};
use crate::channel::{ChannelOpenListener, DrainReport, ListenerError};
use crate::config::schema::{ConnectorConfig, EndpointConfig, RealmConfig};
use crate::net::binding::{BindingStrategy, SocketBindingManager};
use crate::net::endpoint::Endpoint;
use crate::net::server::{ServerError, StreamServer, StreamServerConfig};
use crate::options::{keys, OptionMap};
use crate::outbound::{OutboundError, OutboundRegistry};
use crate::realm::{PropertiesRealm, RealmError, SecurityRealm, SslContext};
use crate::sasl::{Negotiator, SetupError};
use crate::service;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("realm '{name}': {source}")]
    Realm {
        name: String,
        #[source]
        source: RealmError,
    },

    #[error("connector '{connector}': {source}")]
    Setup {
        connector: String,
        #[source]
        source: SetupError,
    },

    #[error("connector '{connector}': {reason}")]
    Connector { connector: String, reason: String },

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),
}

/// Everything started from one configuration.
pub struct RunningEndpoint {
    config: ArcSwap<EndpointConfig>,
    endpoint: Arc<Endpoint>,
    bindings: Arc<SocketBindingManager>,
    listeners: Vec<Arc<ChannelOpenListener>>,
    servers: Vec<Arc<StreamServer>>,
    outbound: Arc<OutboundRegistry>,
    shutdown_timeout: Duration,
}

impl RunningEndpoint {
    /// Start everything `config` describes.
    pub async fn start(config: EndpointConfig) -> Result<Self, StartupError> {
        let shutdown_timeout = resolve_channel_shutdown_timeout(config.endpoint.channel_shutdown_timeout.as_deref());
        let endpoint = Endpoint::new(config.endpoint.name.clone());

        let realms = config
            .realms
            .iter()
            .map(|realm| Ok((realm.name.clone(), build_realm(realm)?)))
            .collect::<Result<HashMap<_, _>, StartupError>>()?;

        let bindings = SocketBindingManager::new();
        let interfaces = interface_addresses(&config);
        for binding in &config.socket_bindings {
            if let Some(address) = interfaces.get(binding.interface.as_str()) {
                bindings.define(binding.name.clone(), SocketAddr::new(*address, binding.port));
            }
        }

        let mut listeners = Vec::with_capacity(config.endpoint.services.len());
        for name in &config.endpoint.services {
            let factory = service::factory_for(name).ok_or_else(|| StartupError::UnknownService(name.clone()))?;
            let listener = ChannelOpenListener::new(name.clone(), OptionMap::empty(), factory, shutdown_timeout);
            listener.start(&endpoint)?;
            listeners.push(listener);
        }

        let outbound = Arc::new(OutboundRegistry::from_config(Arc::clone(&endpoint), &config)?);

        let mut running = Self {
            config: ArcSwap::from_pointee(config.clone()),
            endpoint,
            bindings,
            listeners,
            servers: Vec::new(),
            outbound,
            shutdown_timeout,
        };

        for connector in &config.connectors {
            if let Err(e) = running.start_connector(connector, &realms, &interfaces, &config).await {
                tracing::error!(connector = %connector.name, error = %e, "Connector failed to start");
                running.shutdown(Interrupt::new()).await;
                return Err(e);
            }
        }

        tracing::info!(
            endpoint = %running.endpoint.name(),
            services = ?running.endpoint.service_names(),
            connectors = running.servers.len(),
            outbound = running.outbound.len(),
            channel_shutdown_timeout_ms = shutdown_timeout.as_millis() as u64,
            "Endpoint started"
        );
        Ok(running)
    }

    async fn start_connector(
        &mut self,
        connector: &ConnectorConfig,
        realms: &HashMap<String, Arc<dyn SecurityRealm>>,
        interfaces: &HashMap<&str, IpAddr>,
        config: &EndpointConfig,
    ) -> Result<(), StartupError> {
        let realm = match &connector.security_realm {
            Some(name) => Some(realms.get(name).cloned().ok_or_else(|| StartupError::Connector {
                connector: connector.name.clone(),
                reason: format!("unknown realm '{name}'"),
            })?),
            None => None,
        };
        let negotiator = Negotiator::new(realm, config.endpoint.local_token_path.clone()).map_err(|source| {
            StartupError::Setup {
                connector: connector.name.clone(),
                source,
            }
        })?;

        let server = Arc::new(StreamServer::new(
            StreamServerConfig {
                name: connector.name.clone(),
                binding: binding_strategy(connector, interfaces)?,
                overrides: connector_overrides(connector),
            },
            Arc::clone(&self.endpoint),
            Arc::new(negotiator),
            Some(Arc::clone(&self.bindings)),
        ));
        server.start().await?;
        self.servers.push(server);
        Ok(())
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn outbound(&self) -> &Arc<OutboundRegistry> {
        &self.outbound
    }

    pub fn bindings(&self) -> &Arc<SocketBindingManager> {
        &self.bindings
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn listener(&self, service: &str) -> Option<&Arc<ChannelOpenListener>> {
        self.listeners.iter().find(|l| l.service() == service)
    }

    /// Listening address of the connector named `name`.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.servers
            .iter()
            .find(|s| s.name() == name)
            .and_then(|s| s.local_addr())
    }

    /// Configuration currently in effect.
    pub fn config(&self) -> Arc<EndpointConfig> {
        self.config.load_full()
    }

    /// Apply a reloaded configuration. Only outbound connections change live.
    pub fn reload(&self, config: EndpointConfig) -> Result<(), OutboundError> {
        let current = self.config.load();
        let needs_restart: Vec<&str> = current
            .changed_sections(&config)
            .into_iter()
            .filter(|s| EndpointConfig::RESTART_SECTIONS.contains(s))
            .collect();
        if !needs_restart.is_empty() {
            tracing::warn!(sections = ?needs_restart, "Changes require a restart and were not applied");
        }
        self.outbound.reload(&config)?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Stop accepting, drain every service and close the endpoint.
    ///
    /// Raising `interrupt` cuts the drains short; remaining channels are
    /// still force-closed.
    pub async fn shutdown(&self, interrupt: Interrupt) -> Vec<(String, DrainReport)> {
        for server in &self.servers {
            server.stop().await;
        }

        let stops = self.listeners.iter().map(|listener| {
            let completion = listener.stop(StopContext::with_interrupt(interrupt.clone()));
            let service = listener.service().to_string();
            async move { (service, completion.await) }
        });
        let reports = join_all(stops).await;

        self.endpoint.close();
        for (service, report) in &reports {
            tracing::info!(
                service = %service,
                drained = report.drained,
                timed_out = report.timed_out,
                failed = report.failed,
                "Service drained"
            );
        }
        reports
    }
}

fn build_realm(config: &RealmConfig) -> Result<Arc<dyn SecurityRealm>, StartupError> {
    let realm_error = |source: RealmError| StartupError::Realm {
        name: config.name.clone(),
        source,
    };
    let mut realm = PropertiesRealm::load(&config.name, &config.users_file, config.credentials).map_err(realm_error)?;
    if let Some(tls) = &config.tls {
        let context = SslContext::from_pem_files(&tls.cert_path, &tls.key_path, tls.trust_store_path.as_deref())
            .map_err(|e| realm_error(RealmError::Tls(e)))?;
        realm = realm.with_ssl_context(context);
    }
    Ok(Arc::new(realm))
}

fn interface_addresses(config: &EndpointConfig) -> HashMap<&str, IpAddr> {
    config
        .interfaces
        .iter()
        .filter_map(|i| i.address.parse().ok().map(|addr| (i.name.as_str(), addr)))
        .collect()
}

fn binding_strategy(
    connector: &ConnectorConfig,
    interfaces: &HashMap<&str, IpAddr>,
) -> Result<BindingStrategy, StartupError> {
    let invalid = |reason: String| StartupError::Connector {
        connector: connector.name.clone(),
        reason,
    };
    if let Some(name) = &connector.socket_binding {
        return Ok(BindingStrategy::SocketBinding { name: name.clone() });
    }
    if let Some(name) = &connector.interface {
        let address = interfaces
            .get(name.as_str())
            .copied()
            .ok_or_else(|| invalid(format!("unknown interface '{name}'")))?;
        let port = connector.port.ok_or_else(|| invalid("interface needs a port".into()))?;
        return Ok(BindingStrategy::Interface { address, port });
    }
    match &connector.address {
        Some(address) => address
            .parse()
            .map(BindingStrategy::Address)
            .map_err(|_| invalid(format!("'{address}' is not a socket address"))),
        None => Err(invalid("no binding configured".into())),
    }
}

/// Connector option overrides: raw properties, then the typed SASL settings.
fn connector_overrides(connector: &ConnectorConfig) -> OptionMap {
    let mut builder = OptionMap::builder();
    for (key, value) in &connector.properties {
        builder = builder.set(key, value.clone());
    }

    let policy = &connector.sasl.policy;
    let flags = [
        (keys::SASL_POLICY_NOANONYMOUS, policy.no_anonymous),
        (keys::SASL_POLICY_NOPLAINTEXT, policy.no_plaintext),
        (keys::SASL_POLICY_NOACTIVE, policy.no_active),
        (keys::SASL_POLICY_NODICTIONARY, policy.no_dictionary),
        (keys::SASL_POLICY_FORWARD_SECRECY, policy.forward_secrecy),
        (keys::SASL_POLICY_PASS_CREDENTIALS, policy.pass_credentials),
    ];
    for (key, value) in flags {
        if let Some(value) = value {
            builder = builder.set(key, value);
        }
    }
    if let Some(include) = &connector.sasl.include_mechanisms {
        builder = builder.set(keys::SASL_MECHANISMS, include.clone());
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[tokio::test]
    async fn starts_anonymous_connector_and_shuts_down() {
        let config = parse_config(
            r#"
            [endpoint]
            name = "node-a"

            [[connectors]]
            name = "main"
            address = "127.0.0.1:0"
            "#,
        )
        .unwrap();
        let running = RunningEndpoint::start(config).await.unwrap();
        assert!(running.local_addr("main").is_some());
        assert!(running.listener("echo").is_some());
        assert_eq!(running.endpoint().service_names(), vec!["echo".to_string()]);

        let reports = running.shutdown(Interrupt::new()).await;
        assert_eq!(reports.len(), 1);
        assert!(running.endpoint().is_closed());
        assert!(running.local_addr("main").is_none());
    }

    #[tokio::test]
    async fn missing_users_file_fails_startup() {
        let config = parse_config(
            r#"
            [[realms]]
            name = "app"
            users_file = "/nonexistent/users.properties"
            "#,
        )
        .unwrap();
        assert!(matches!(
            RunningEndpoint::start(config).await,
            Err(StartupError::Realm { .. })
        ));
    }

    #[test]
    fn typed_sasl_settings_become_overrides() {
        let config = parse_config(
            r#"
            [[connectors]]
            name = "main"
            address = "127.0.0.1:0"

            [connectors.sasl]
            include_mechanisms = ["PLAIN"]

            [connectors.sasl.policy]
            no_plaintext = true

            [connectors.properties]
            "connection.max" = 8
            "#,
        )
        .unwrap();
        let options = connector_overrides(&config.connectors[0]);
        assert_eq!(options.get_bool(keys::SASL_POLICY_NOPLAINTEXT), Some(true));
        assert_eq!(options.get_list(keys::SASL_MECHANISMS), Some(vec!["PLAIN".to_string()]));
        assert_eq!(options.get_int(keys::MAX_CONNECTIONS), Some(8));
        assert!(!options.contains(keys::SASL_POLICY_NOANONYMOUS));
    }
}
