//! Connection providers keyed by URI scheme.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use url::{Host, Url};

use super::connection::{client_handshake, Connection};
use super::OutboundError;
use crate::options::OptionMap;
use crate::realm::CallbackHandler;

/// Port used when a URI does not name one.
pub const DEFAULT_PORT: u16 = 4447;

/// TLS settings for outbound connections.
#[derive(Clone)]
pub struct ClientTls {
    pub config: Arc<ClientConfig>,
    /// The config carries a client certificate, so EXTERNAL is possible.
    pub has_certificate: bool,
}

/// Everything a provider needs to open one connection.
#[derive(Clone)]
pub struct ConnectRequest {
    pub uri: Url,
    pub options: OptionMap,
    pub credentials: Arc<dyn CallbackHandler>,
    pub tls: Option<ClientTls>,
}

pub trait ConnectionProvider: Send + Sync {
    fn scheme(&self) -> &str;

    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, OutboundError>>;
}

/// Plain TCP dialer running the client handshake.
#[derive(Debug, Clone)]
pub struct TcpProvider {
    scheme: String,
    allow_local: bool,
}

impl TcpProvider {
    /// `remote://` connections never attempt same-machine authentication.
    pub fn remote() -> Self {
        Self {
            scheme: "remote".into(),
            allow_local: false,
        }
    }

    /// `local://` connections may authenticate as the local user.
    pub fn local() -> Self {
        Self {
            scheme: "local".into(),
            allow_local: true,
        }
    }
}

/// Host part of `uri` usable for dialing and TLS server names.
pub(crate) fn dial_host(uri: &Url) -> Option<String> {
    match uri.host()? {
        Host::Domain(domain) => Some(domain.to_string()),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

impl ConnectionProvider for TcpProvider {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, OutboundError>> {
        let allow_local = self.allow_local;
        Box::pin(async move {
            let host = dial_host(&request.uri).ok_or_else(|| OutboundError::Config {
                connection: request.uri.scheme().to_string(),
                value: request.uri.to_string(),
                reason: "missing host".into(),
            })?;
            let port = request.uri.port().unwrap_or(DEFAULT_PORT);

            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|source| OutboundError::Connect {
                    uri: request.uri.to_string(),
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            client_handshake(Box::new(stream), &request, allow_local).await
        })
    }
}

/// Providers by scheme. Registration is idempotent: the first provider
/// registered for a scheme stays.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn ConnectionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `remote` and `local` TCP providers.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_if_absent(Arc::new(TcpProvider::remote()));
        registry.register_if_absent(Arc::new(TcpProvider::local()));
        registry
    }

    /// Returns `false` if the scheme already had a provider.
    pub fn register_if_absent(&self, provider: Arc<dyn ConnectionProvider>) -> bool {
        match self.providers.entry(provider.scheme().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                tracing::debug!(scheme = %provider.scheme(), "Connection provider registered");
                slot.insert(provider);
                true
            }
        }
    }

    pub fn get(&self, scheme: &str) -> Result<Arc<dyn ConnectionProvider>, OutboundError> {
        self.providers
            .get(scheme)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| OutboundError::UnknownScheme(scheme.to_string()))
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        schemes.sort();
        schemes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_registered_once() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(registry.schemes(), vec!["local".to_string(), "remote".to_string()]);
        assert!(!registry.register_if_absent(Arc::new(TcpProvider::remote())));
        assert!(registry.get("http").is_err());
    }

    #[test]
    fn ipv6_hosts_lose_brackets() {
        let uri = Url::parse("remote://[::1]:4447").unwrap();
        assert_eq!(dial_host(&uri).as_deref(), Some("::1"));
    }
}
