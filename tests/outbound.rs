//! Outbound connection descriptors: lazy resolution, memoization and providers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};

use remoting_endpoint::net::protocol::FramedStream;
use remoting_endpoint::net::Endpoint;
use remoting_endpoint::outbound::{
    ConnectRequest, Connection, ConnectionProvider, DestinationBinding, OutboundConnection, OutboundError,
    ProviderRegistry,
};

mod common;

struct CountingBinding {
    resolves: AtomicUsize,
    fail: bool,
}

impl CountingBinding {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            resolves: AtomicUsize::new(0),
            fail,
        })
    }

    fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl DestinationBinding for CountingBinding {
    fn name(&self) -> &str {
        "backend-binding"
    }

    fn resolve(&self) -> BoxFuture<'_, std::io::Result<SocketAddr>> {
        Box::pin(async move {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such host"))
            } else {
                Ok("10.1.2.3:4447".parse().unwrap())
            }
        })
    }
}

/// Hands out in-memory connections and counts them.
struct FakeProvider {
    scheme: &'static str,
    connects: AtomicUsize,
    peers: Mutex<Vec<FramedStream>>,
}

impl FakeProvider {
    fn new(scheme: &'static str) -> Arc<Self> {
        Arc::new(Self {
            scheme,
            connects: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
        })
    }
}

impl ConnectionProvider for FakeProvider {
    fn scheme(&self) -> &str {
        self.scheme
    }

    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, OutboundError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (ours, theirs) = common::duplex_pair();
        self.peers.lock().unwrap().push(theirs);
        Box::pin(async move { Ok(Connection::new(request.uri, "fake-peer".into(), "tester".into(), ours)) })
    }
}

fn endpoint_with(provider: Arc<FakeProvider>) -> Arc<Endpoint> {
    let providers = ProviderRegistry::new();
    assert!(providers.register_if_absent(provider));
    Endpoint::with_providers("client", providers)
}

#[tokio::test]
async fn concurrent_first_connects_resolve_once() {
    let provider = FakeProvider::new("remote");
    let binding = CountingBinding::new(false);
    let outbound = OutboundConnection::remote("backend", binding.clone(), Some(endpoint_with(provider.clone()))).unwrap();

    let connections = join_all((0..5).map(|_| outbound.connect())).await;
    let connections: Vec<Connection> = connections.into_iter().map(Result::unwrap).collect();

    assert_eq!(binding.resolves(), 1);
    assert_eq!(provider.connects.load(Ordering::SeqCst), 5);
    assert_eq!(connections[0].uri().as_str(), "remote://10.1.2.3:4447");
    assert_eq!(outbound.active_connections(), 5);

    drop(connections);
    assert_eq!(outbound.active_connections(), 0);
    outbound.connect().await.unwrap();
    assert_eq!(binding.resolves(), 1);
}

#[tokio::test]
async fn failed_resolution_is_not_memoized() {
    let provider = FakeProvider::new("local");
    let binding = CountingBinding::new(true);
    let outbound = OutboundConnection::local("backend", binding.clone(), Some(endpoint_with(provider))).unwrap();

    let err = outbound.connect().await.err().unwrap();
    assert!(matches!(err, OutboundError::Resolve { .. }));
    assert!(err.to_string().contains("backend-binding"));

    assert!(outbound.connect().await.is_err());
    assert_eq!(binding.resolves(), 2);
}

#[tokio::test]
async fn generic_destination_cannot_change_while_connected() {
    let provider = FakeProvider::new("fake");
    let outbound = OutboundConnection::generic("g", "fake://host-a:1", Some(endpoint_with(provider))).unwrap();

    let connection = outbound.connect().await.unwrap();
    assert!(matches!(
        outbound.set_destination("fake://host-b:2").await,
        Err(OutboundError::IllegalState(_))
    ));

    drop(connection);
    outbound.set_destination("fake://host-b:2").await.unwrap();
    let connection = outbound.connect().await.unwrap();
    assert_eq!(connection.uri().as_str(), "fake://host-b:2");
}

#[tokio::test]
async fn unknown_scheme_has_no_provider() {
    let outbound = OutboundConnection::generic("g", "carrier-pigeon://coop:1", Some(Endpoint::new("client"))).unwrap();
    assert!(matches!(
        outbound.connect().await,
        Err(OutboundError::UnknownScheme(scheme)) if scheme == "carrier-pigeon"
    ));
}

#[tokio::test]
async fn closed_endpoint_refuses_connects() {
    let endpoint = Endpoint::new("client");
    let outbound = OutboundConnection::generic("g", "remote://127.0.0.1:1", Some(Arc::clone(&endpoint))).unwrap();
    endpoint.close();
    assert!(matches!(outbound.connect().await, Err(OutboundError::IllegalState(_))));
}

#[tokio::test]
async fn connection_refused_names_the_uri() {
    // bind then drop to get a port with nothing listening
    let port = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };
    let uri = format!("remote://127.0.0.1:{port}");
    let err = common::connect(&uri, common::anonymous()).await.err().unwrap();
    assert!(matches!(err, OutboundError::Connect { .. }));
    assert!(err.to_string().contains(&uri));
}
