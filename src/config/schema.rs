//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::options::OptionValue;
use crate::realm::CredentialForm;

/// Root configuration for the endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    pub endpoint: EndpointSettings,

    /// Named network interfaces.
    pub interfaces: Vec<InterfaceConfig>,

    /// Named listen addresses (interface + port).
    pub socket_bindings: Vec<SocketBindingConfig>,

    /// Named remote destinations.
    pub outbound_socket_bindings: Vec<OutboundSocketBindingConfig>,

    pub realms: Vec<RealmConfig>,

    /// Stream servers.
    pub connectors: Vec<ConnectorConfig>,

    pub outbound_connections: Vec<OutboundConnectionConfig>,

    pub observability: ObservabilityConfig,
}

impl EndpointConfig {
    /// Sections that cannot change without restarting the process.
    pub const RESTART_SECTIONS: &'static [&'static str] =
        &["endpoint", "interfaces", "socket_bindings", "realms", "connectors"];

    /// Top-level sections that differ from `other`, in file order.
    pub fn changed_sections(&self, other: &EndpointConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        let mut check = |name: &'static str, same: bool| {
            if !same {
                changed.push(name);
            }
        };
        check("endpoint", self.endpoint == other.endpoint);
        check("interfaces", self.interfaces == other.interfaces);
        check("socket_bindings", self.socket_bindings == other.socket_bindings);
        check("outbound_socket_bindings", self.outbound_socket_bindings == other.outbound_socket_bindings);
        check("realms", self.realms == other.realms);
        check("connectors", self.connectors == other.connectors);
        check("outbound_connections", self.outbound_connections == other.outbound_connections);
        check("observability", self.observability == other.observability);
        changed
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EndpointSettings {
    /// Endpoint name announced to peers.
    pub name: String,

    /// Tokio worker threads (0 = number of CPUs).
    pub worker_threads: usize,

    /// Channel drain timeout in milliseconds, as text so bad values can be
    /// reported instead of failing the load.
    pub channel_shutdown_timeout: Option<String>,

    /// Directory for local-user challenge files.
    pub local_token_path: Option<PathBuf>,

    /// Built-in channel services to register.
    pub services: Vec<String>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            name: "remoting".to_string(),
            worker_threads: 0,
            channel_shutdown_timeout: None,
            local_token_path: None,
            services: vec!["echo".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InterfaceConfig {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SocketBindingConfig {
    pub name: String,
    pub interface: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OutboundSocketBindingConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RealmConfig {
    pub name: String,

    /// `user=value` properties file.
    pub users_file: PathBuf,

    #[serde(default)]
    pub credentials: CredentialForm,

    pub tls: Option<RealmTlsConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RealmTlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,

    /// CA bundle for client certificates; enables EXTERNAL.
    pub trust_store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConnectorConfig {
    pub name: String,

    /// Named socket binding to listen on.
    pub socket_binding: Option<String>,

    /// Named interface, used with `port`.
    pub interface: Option<String>,
    pub port: Option<u16>,

    /// Literal `ip:port`.
    pub address: Option<String>,

    /// Realm authenticating this connector; none means anonymous.
    pub security_realm: Option<String>,

    #[serde(default)]
    pub sasl: SaslConfig,

    /// Raw option overrides, e.g. `"connection.max" = 512`.
    #[serde(default)]
    pub properties: BTreeMap<String, OptionValue>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct SaslConfig {
    pub include_mechanisms: Option<Vec<String>>,
    pub policy: SaslPolicyConfig,
}

/// Unset fields keep the value computed from the realm.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct SaslPolicyConfig {
    pub no_anonymous: Option<bool>,
    pub no_plaintext: Option<bool>,
    pub no_active: Option<bool>,
    pub no_dictionary: Option<bool>,
    pub forward_secrecy: Option<bool>,
    pub pass_credentials: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
    Local,
    Remote,
    Generic,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OutboundConnectionConfig {
    pub name: String,
    pub kind: OutboundKind,

    /// For `local` and `remote`.
    pub outbound_socket_binding: Option<String>,

    /// For `generic`.
    pub uri: Option<String>,

    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default)]
    pub properties: BTreeMap<String, OptionValue>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9464".to_string(),
        }
    }
}
