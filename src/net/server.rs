//! The stream server: binds a connector and feeds authenticated channels to
//! the endpoint.
//!
//! # Responsibilities
//! - Merge the security provider's options with connector overrides
//!   (overrides win) and derive the effective negotiation policy
//! - Resolve the bind address from the connector's binding strategy
//! - Register the bound socket with the socket-binding manager, if any,
//!   under the binding name or, for unnamed bindings, the connector name
//! - Accept connections, run the handshake under a timeout, and dispatch
//!   `OPEN <service>` to the endpoint
//! - Close the socket on stop; stopping twice is a no-op

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::lifecycle::Shutdown;
use crate::net::binding::{BindingError, BindingStrategy, SocketBindingManager};
use crate::net::connection::{ConnectionGuard, ConnectionState, ConnectionTracker};
use crate::net::endpoint::{Endpoint, EndpointError, OpenListener};
use crate::net::handshake::{self, HandshakeConfig, HandshakeError};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError, DEFAULT_MAX_CONNECTIONS};
use crate::net::protocol::{Frame, FramedStream, ProtocolError};
use crate::options::{keys, OptionMap};
use crate::realm::TlsError;
use crate::sasl::{Mechanism, NegotiationPolicy, Negotiator, SetupError};

/// Handshake bound used when the option map does not set one.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("connector '{0}' is already started")]
    AlreadyStarted(String),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("connector '{connector}' enables SSL but its realm has no SSL context")]
    TlsUnavailable { connector: String },
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("handshake timed out")]
    TimedOut,
}

/// Connector-level settings.
#[derive(Debug, Clone)]
pub struct StreamServerConfig {
    pub name: String,
    pub binding: BindingStrategy,
    /// Connector overrides, applied over the security provider's options.
    pub overrides: OptionMap,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: Arc<Shutdown>,
    accept_task: JoinHandle<()>,
    options: OptionMap,
    policy: NegotiationPolicy,
}

struct ConnectionContext {
    handshake: HandshakeConfig,
    endpoint: Arc<Endpoint>,
    handshake_timeout: Duration,
}

pub struct StreamServer {
    config: StreamServerConfig,
    endpoint: Arc<Endpoint>,
    negotiator: Arc<Negotiator>,
    bindings: Option<Arc<SocketBindingManager>>,
    tracker: ConnectionTracker,
    running: tokio::sync::Mutex<Option<Running>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl StreamServer {
    pub fn new(
        config: StreamServerConfig,
        endpoint: Arc<Endpoint>,
        negotiator: Arc<Negotiator>,
        bindings: Option<Arc<SocketBindingManager>>,
    ) -> Self {
        Self {
            config,
            endpoint,
            negotiator,
            bindings,
            tracker: ConnectionTracker::new(),
            running: tokio::sync::Mutex::new(None),
            bound: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Name the bound socket is reported under.
    fn tracking_name(&self) -> &str {
        self.config.binding.binding_name().unwrap_or(&self.config.name)
    }

    /// Address the server is listening on, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Merged option map in effect, while running.
    pub async fn effective_options(&self) -> Option<OptionMap> {
        self.running.lock().await.as_ref().map(|r| r.options.clone())
    }

    pub async fn effective_policy(&self) -> Option<NegotiationPolicy> {
        self.running.lock().await.as_ref().map(|r| r.policy.clone())
    }

    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyStarted(self.config.name.clone()));
        }

        let options = self.negotiator.setup().to_options().merge(&self.config.overrides);
        let policy = NegotiationPolicy::from_options(&options);
        let include = options
            .get_list(keys::SASL_MECHANISMS)
            .map(|names| {
                names
                    .iter()
                    .map(|n| n.parse::<Mechanism>().map_err(|_| SetupError::UnknownMechanism(n.clone())))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let tls = if policy.ssl().enabled {
            let context = self.negotiator.ssl_context().ok_or_else(|| ServerError::TlsUnavailable {
                connector: self.config.name.clone(),
            })?;
            Some(context.server_config(policy.ssl().client_auth)?)
        } else {
            None
        };

        let max_connections = options
            .get_int(keys::MAX_CONNECTIONS)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let handshake_timeout = options
            .get_int(keys::HANDSHAKE_TIMEOUT_MS)
            .and_then(|ms| u64::try_from(ms).ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);

        let address = self.config.binding.resolve(self.bindings.as_deref())?;
        let listener = Listener::bind(address, max_connections).await?;
        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind { address, source })?;

        if let Some(manager) = &self.bindings {
            manager.register_bound(self.tracking_name(), address, local_addr);
        }

        let context = Arc::new(ConnectionContext {
            handshake: HandshakeConfig {
                endpoint_name: self.endpoint.name().to_string(),
                negotiator: Arc::clone(&self.negotiator),
                policy: policy.clone(),
                include,
                tls,
            },
            endpoint: Arc::clone(&self.endpoint),
            handshake_timeout,
        });
        let shutdown = Arc::new(Shutdown::new());
        // subscribed before the task runs so an immediate stop() is not lost
        let stop = shutdown.subscribe();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            context,
            Arc::clone(&shutdown),
            stop,
            self.tracker.clone(),
            self.config.name.clone(),
        ));

        tracing::info!(
            connector = %self.config.name,
            address = %local_addr,
            binding = %self.config.binding,
            mechanisms = ?self.negotiator.setup().offered(&policy, None),
            ssl = policy.ssl().enabled,
            "Stream server started"
        );

        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        *running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
            options,
            policy,
        });
        Ok(local_addr)
    }

    /// Close the listening socket. Handshakes in progress are abandoned;
    /// channels already opened belong to their services.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.shutdown.trigger();
        if let Err(e) = running.accept_task.await {
            tracing::warn!(connector = %self.config.name, error = %e, "Accept loop ended abnormally");
        }
        if let Some(manager) = &self.bindings {
            manager.unregister_bound(self.tracking_name());
        }
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::info!(connector = %self.config.name, address = %running.local_addr, "Stream server stopped");
    }
}

async fn accept_loop(
    listener: Listener,
    context: Arc<ConnectionContext>,
    shutdown: Arc<Shutdown>,
    mut stop: broadcast::Receiver<()>,
    tracker: ConnectionTracker,
    connector: String,
) {
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    let guard = tracker.track();
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        permit,
                        guard,
                        Arc::clone(&context),
                        shutdown.subscribe(),
                    ));
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::error!(connector = %connector, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    permit: ConnectionPermit,
    guard: ConnectionGuard,
    context: Arc<ConnectionContext>,
    mut stop: broadcast::Receiver<()>,
) {
    let connection_id = guard.id();
    tracing::debug!(connection_id = %connection_id, peer_addr = %peer, state = ?ConnectionState::Handshaking, "Connection handshaking");

    let opened = tokio::select! {
        _ = stop.recv() => {
            tracing::debug!(connection_id = %connection_id, "Handshake abandoned, server stopping");
            return;
        }
        result = tokio::time::timeout(context.handshake_timeout, open_channel(stream, peer, &context)) => {
            result.unwrap_or(Err(ConnectionError::TimedOut))
        }
    };

    match opened {
        Ok((channel, framed, listener)) => {
            tracing::debug!(
                connection_id = %connection_id,
                channel_id = %channel.id(),
                state = ?ConnectionState::Open,
                "Connection promoted to channel"
            );
            channel.add_close_handler(move |_| {
                drop(permit);
                drop(guard);
            });
            listener.channel_opened(channel, framed);
        }
        Err(ConnectionError::Handshake(HandshakeError::Negotiation(_))) => {
            // already logged by the handshake
        }
        Err(e) => {
            tracing::debug!(connection_id = %connection_id, peer_addr = %peer, error = %e, "Connection closed before channel open");
        }
    }
}

async fn open_channel(
    stream: TcpStream,
    peer: SocketAddr,
    context: &ConnectionContext,
) -> Result<(Channel, FramedStream, Arc<dyn OpenListener>), ConnectionError> {
    let _ = stream.set_nodelay(true);
    let (mut framed, identity) = handshake::accept(Box::new(stream), &context.handshake).await?;
    tracing::trace!(peer_addr = %peer, state = ?ConnectionState::Authenticated, "Awaiting OPEN");

    let service = framed
        .expect("OPEN", |f| match f {
            Frame::Open(service) => Ok(service),
            other => Err(other),
        })
        .await?;
    let listener = match context.endpoint.service_listener(&service) {
        Ok(listener) => listener,
        Err(e) => {
            let _ = framed.write_frame(&Frame::Closed(e.to_string())).await;
            return Err(e.into());
        }
    };

    let channel = Channel::new(service, identity, Some(peer));
    framed.write_frame(&Frame::Opened(channel.id().to_string())).await?;
    Ok((channel, framed, listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(binding: BindingStrategy, bindings: Option<Arc<SocketBindingManager>>) -> StreamServer {
        StreamServer::new(
            StreamServerConfig {
                name: "main".into(),
                binding,
                overrides: OptionMap::empty(),
            },
            Endpoint::new("node"),
            Arc::new(Negotiator::new(None, None).unwrap()),
            bindings,
        )
    }

    fn loopback() -> BindingStrategy {
        BindingStrategy::Address("127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn stop_right_after_start_completes() {
        // current-thread runtime: the accept task has not run yet
        let server = server(loopback(), None);
        server.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), server.stop())
            .await
            .expect("stop hung");
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn second_stop_is_a_no_op() {
        let server = server(loopback(), None);
        let addr = server.start().await.unwrap();
        server.stop().await;
        tokio::time::timeout(Duration::from_millis(500), server.stop())
            .await
            .expect("second stop hung");
        assert!(TcpStream::connect(addr).await.is_err());

        // and the connector can start again
        server.start().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn named_binding_is_tracked_while_running() {
        let manager = SocketBindingManager::new();
        manager.define("remoting", "127.0.0.1:0".parse().unwrap());
        let server = server(
            BindingStrategy::SocketBinding {
                name: "remoting".into(),
            },
            Some(Arc::clone(&manager)),
        );

        let addr = server.start().await.unwrap();
        let bound = manager.bound_sockets();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].name, "remoting");
        assert_eq!(bound[0].bound, addr);

        server.stop().await;
        assert!(manager.bound_sockets().is_empty());
    }

    #[tokio::test]
    async fn unnamed_bindings_are_tracked_under_the_connector() {
        let manager = SocketBindingManager::new();
        for binding in [
            BindingStrategy::Interface {
                address: "127.0.0.1".parse().unwrap(),
                port: 0,
            },
            loopback(),
        ] {
            let server = server(binding, Some(Arc::clone(&manager)));
            let addr = server.start().await.unwrap();

            let bound = manager.bound_sockets();
            assert_eq!(bound.len(), 1);
            assert_eq!(bound[0].name, "main");
            assert_eq!(bound[0].configured.port(), 0);
            assert_eq!(bound[0].bound, addr);

            server.stop().await;
            assert!(manager.bound_sockets().is_empty());
        }
    }
}
