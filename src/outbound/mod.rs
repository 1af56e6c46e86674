//! Outbound connections.
//!
//! # Data Flow
//! ```text
//! OutboundConnection::connect
//!     → destination(): first call resolves the binding (local/remote) and
//!       memoizes `scheme://addr`; generic connections carry their URI
//!     → Endpoint::connect → ProviderRegistry lookup by URI scheme
//!     → provider.rs TcpProvider dials, connection.rs runs the client handshake
//!     → Connection::open_channel(service) → ClientChannel
//! ```
//!
//! # Design Decisions
//! - Resolution is deferred until the first connect; configured but unused
//!   connections never touch DNS
//! - The memoized URI sits behind one async mutex per descriptor, held across
//!   resolution, so concurrent first connects resolve once
//! - Reconfiguration replaces whole descriptors (registry.rs)

pub mod connection;
pub mod provider;
pub mod registry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use url::Url;

use crate::net::endpoint::Endpoint;
use crate::net::protocol::ProtocolError;
use crate::options::OptionMap;
use crate::realm::CallbackHandler;
use crate::sasl::client::AnonymousCredentials;
use crate::sasl::NegotiationError;

pub use connection::{ClientChannel, Connection};
pub use provider::{ClientTls, ConnectRequest, ConnectionProvider, ProviderRegistry, TcpProvider};
pub use registry::OutboundRegistry;

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("outbound connection name must not be empty")]
    EmptyName,

    #[error("outbound connection '{connection}': invalid destination '{value}': {reason}")]
    Config {
        connection: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    IllegalState(String),

    #[error("outbound connection '{connection}': cannot resolve '{binding}': {source}")]
    Resolve {
        connection: String,
        binding: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no connection provider for scheme '{0}'")]
    UnknownScheme(String),

    #[error("connect to {uri} failed: {source}")]
    Connect {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("authentication rejected: {0}")]
    AuthenticationFailed(String),

    #[error("channel to '{service}' rejected: {reason}")]
    ChannelRejected { service: String, reason: String },
}

/// Something that can produce a destination address on demand.
pub trait DestinationBinding: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self) -> BoxFuture<'_, std::io::Result<SocketAddr>>;
}

/// A named `host:port` resolved through DNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSocketBinding {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl DestinationBinding for OutboundSocketBinding {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self) -> BoxFuture<'_, std::io::Result<SocketAddr>> {
        Box::pin(async move {
            tokio::net::lookup_host((self.host.as_str(), self.port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{}:{} has no addresses", self.host, self.port),
                    )
                })
        })
    }
}

/// How the destination URI is obtained.
#[derive(Clone)]
pub enum Destination {
    /// `local://addr` from a binding; same-machine authentication allowed.
    Local(Arc<dyn DestinationBinding>),
    /// `remote://addr` from a binding.
    Remote(Arc<dyn DestinationBinding>),
    /// A URI given up front.
    Generic,
}

impl Destination {
    pub fn kind(&self) -> &'static str {
        match self {
            Destination::Local(_) => "local",
            Destination::Remote(_) => "remote",
            Destination::Generic => "generic",
        }
    }
}

/// Decrements the owning descriptor's active count on drop.
#[derive(Debug)]
pub(crate) struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A configured outbound connection.
pub struct OutboundConnection {
    name: String,
    destination: Destination,
    // None until first resolution
    uri: tokio::sync::Mutex<Option<Url>>,
    options: OptionMap,
    credentials: Arc<dyn CallbackHandler>,
    tls: Option<ClientTls>,
    endpoint: Option<Arc<Endpoint>>,
    active: Arc<AtomicUsize>,
}

impl OutboundConnection {
    pub fn local(
        name: &str,
        binding: Arc<dyn DestinationBinding>,
        endpoint: Option<Arc<Endpoint>>,
    ) -> Result<Self, OutboundError> {
        Self::build(name, Destination::Local(binding), None, endpoint)
    }

    pub fn remote(
        name: &str,
        binding: Arc<dyn DestinationBinding>,
        endpoint: Option<Arc<Endpoint>>,
    ) -> Result<Self, OutboundError> {
        Self::build(name, Destination::Remote(binding), None, endpoint)
    }

    pub fn generic(name: &str, uri: &str, endpoint: Option<Arc<Endpoint>>) -> Result<Self, OutboundError> {
        let parsed = parse_uri(name, uri)?;
        Self::build(name, Destination::Generic, Some(parsed), endpoint)
    }

    fn build(
        name: &str,
        destination: Destination,
        uri: Option<Url>,
        endpoint: Option<Arc<Endpoint>>,
    ) -> Result<Self, OutboundError> {
        if name.trim().is_empty() {
            return Err(OutboundError::EmptyName);
        }
        Ok(Self {
            name: name.to_string(),
            destination,
            uri: tokio::sync::Mutex::new(uri),
            options: OptionMap::empty(),
            credentials: Arc::new(AnonymousCredentials),
            tls: None,
            endpoint,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn with_options(mut self, options: OptionMap) -> Self {
        self.options = options;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CallbackHandler>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.destination.kind()
    }

    pub fn options(&self) -> &OptionMap {
        &self.options
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// The destination URI, resolving and memoizing it on first use.
    pub async fn destination(&self) -> Result<Url, OutboundError> {
        let mut slot = self.uri.lock().await;
        if let Some(uri) = slot.as_ref() {
            return Ok(uri.clone());
        }

        let (scheme, binding) = match &self.destination {
            Destination::Local(binding) => ("local", binding),
            Destination::Remote(binding) => ("remote", binding),
            Destination::Generic => {
                return Err(OutboundError::IllegalState(format!(
                    "outbound connection '{}' has no destination",
                    self.name
                )))
            }
        };
        let addr = binding.resolve().await.map_err(|source| OutboundError::Resolve {
            connection: self.name.clone(),
            binding: binding.name().to_string(),
            source,
        })?;
        let uri = parse_uri(&self.name, &format!("{scheme}://{addr}"))?;

        tracing::debug!(connection = %self.name, uri = %uri, "Outbound destination resolved");
        *slot = Some(uri.clone());
        Ok(uri)
    }

    /// Establish a connection to the destination.
    pub async fn connect(&self) -> Result<Connection, OutboundError> {
        let endpoint = self.endpoint.as_ref().ok_or_else(|| {
            OutboundError::IllegalState(format!("outbound connection '{}' has no endpoint", self.name))
        })?;
        let uri = self.destination().await?;
        let request = ConnectRequest {
            uri,
            options: self.options.clone(),
            credentials: Arc::clone(&self.credentials),
            tls: self.tls.clone(),
        };
        let connection = endpoint.connect(request).await?;
        tracing::info!(connection = %self.name, uri = %connection.uri(), "Outbound connection established");
        Ok(connection.with_active(ActiveGuard::new(&self.active)))
    }

    /// Replace the URI of a generic connection that is not connected.
    pub async fn set_destination(&self, uri: &str) -> Result<(), OutboundError> {
        if !matches!(self.destination, Destination::Generic) {
            return Err(OutboundError::IllegalState(format!(
                "outbound connection '{}' is {} and derives its destination from a binding",
                self.name,
                self.kind()
            )));
        }
        if self.active_connections() > 0 {
            return Err(OutboundError::IllegalState(format!(
                "outbound connection '{}' is connected",
                self.name
            )));
        }
        let parsed = parse_uri(&self.name, uri)?;
        *self.uri.lock().await = Some(parsed);
        Ok(())
    }
}

fn parse_uri(connection: &str, raw: &str) -> Result<Url, OutboundError> {
    let config_error = |reason: String| OutboundError::Config {
        connection: connection.to_string(),
        value: raw.to_string(),
        reason,
    };
    let uri = Url::parse(raw).map_err(|e| config_error(e.to_string()))?;
    if uri.host().is_none() {
        return Err(config_error("missing host".into()));
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_uri_names_connection_and_value() {
        let err = OutboundConnection::generic("backend", "remote//nope", None).err().unwrap();
        let message = err.to_string();
        assert!(message.contains("backend"));
        assert!(message.contains("remote//nope"));

        assert!(matches!(
            OutboundConnection::generic("backend", "mailto:someone", None),
            Err(OutboundError::Config { .. })
        ));
        assert!(matches!(
            OutboundConnection::generic(" ", "remote://h:1", None),
            Err(OutboundError::EmptyName)
        ));
    }

    #[tokio::test]
    async fn connect_without_endpoint_is_illegal_state() {
        let conn = OutboundConnection::generic("backend", "remote://127.0.0.1:4447", None).unwrap();
        assert!(matches!(conn.connect().await, Err(OutboundError::IllegalState(_))));
    }

    #[tokio::test]
    async fn set_destination_only_for_generic() {
        let binding = Arc::new(OutboundSocketBinding {
            name: "b".into(),
            host: "127.0.0.1".into(),
            port: 1,
        });
        let local = OutboundConnection::local("l", binding, None).unwrap();
        assert!(matches!(
            local.set_destination("remote://h:2").await,
            Err(OutboundError::IllegalState(_))
        ));

        let generic = OutboundConnection::generic("g", "remote://h:1", None).unwrap();
        generic.set_destination("remote://other:2").await.unwrap();
        assert_eq!(generic.destination().await.unwrap().as_str(), "remote://other:2");
    }

    #[tokio::test]
    async fn local_binding_builds_scheme_uri() {
        let binding = Arc::new(OutboundSocketBinding {
            name: "b".into(),
            host: "127.0.0.1".into(),
            port: 4447,
        });
        let local = OutboundConnection::local("l", binding, None).unwrap();
        assert_eq!(local.destination().await.unwrap().as_str(), "local://127.0.0.1:4447");
    }
}
