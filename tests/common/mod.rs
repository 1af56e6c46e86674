//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use remoting_endpoint::channel::{
    Channel, ChannelHandle, ChannelId, ChannelOpenListener, HandleError, HandleFactory,
};
use remoting_endpoint::net::binding::BindingStrategy;
use remoting_endpoint::net::protocol::FramedStream;
use remoting_endpoint::net::{Endpoint, StreamServer, StreamServerConfig};
use remoting_endpoint::options::OptionMap;
use remoting_endpoint::outbound::{Connection, OutboundConnection, OutboundError};
use remoting_endpoint::realm::{CallbackHandler, CredentialForm, PropertiesRealm, SecurityRealm};
use remoting_endpoint::sasl::client::{AnonymousCredentials, PasswordCredentials};
use remoting_endpoint::sasl::{AuthenticatedIdentity, Mechanism, Negotiator, ANONYMOUS_IDENTITY};
use remoting_endpoint::service::EchoService;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "wonderland";

/// A realm holding one user, alice.
pub fn users_realm(form: CredentialForm) -> Arc<dyn SecurityRealm> {
    Arc::new(PropertiesRealm::from_users("TestRealm", form, [(USER, PASSWORD)]))
}

pub fn anonymous_identity() -> AuthenticatedIdentity {
    AuthenticatedIdentity {
        mechanism: Mechanism::Anonymous,
        authentication_id: ANONYMOUS_IDENTITY.into(),
        authorization_id: ANONYMOUS_IDENTITY.into(),
    }
}

pub fn channel(service: &str) -> Channel {
    Channel::new(service, anonymous_identity(), None)
}

/// Two ends of an in-memory framed stream.
pub fn duplex_pair() -> (FramedStream, FramedStream) {
    let (a, b) = tokio::io::duplex(16 * 1024);
    (FramedStream::new(Box::new(a)), FramedStream::new(Box::new(b)))
}

/// Fresh directory for local-user challenge files.
pub fn token_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("remoting-tokens-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// How a [`FakeHandle`] behaves when awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Immediate,
    Never,
    Fail,
    Panic,
}

pub struct FakeHandle {
    id: ChannelId,
    completion: Completion,
    pub shutdowns: AtomicUsize,
    pub forced: AtomicUsize,
}

impl FakeHandle {
    pub fn new(completion: Completion) -> Arc<Self> {
        Self::with_id(ChannelId::new(), completion)
    }

    pub fn with_id(id: ChannelId, completion: Completion) -> Arc<Self> {
        Arc::new(Self {
            id,
            completion,
            shutdowns: AtomicUsize::new(0),
            forced: AtomicUsize::new(0),
        })
    }

    pub fn was_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst) > 0
    }
}

async fn explode() -> Result<bool, HandleError> {
    panic!("handle exploded while draining")
}

impl ChannelHandle for FakeHandle {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown_now(&self) {
        self.forced.fetch_add(1, Ordering::SeqCst);
    }

    fn await_completion(&self, timeout: Duration) -> BoxFuture<'_, Result<bool, HandleError>> {
        match self.completion {
            Completion::Immediate => Box::pin(async { Ok(true) }),
            Completion::Never => Box::pin(async move {
                tokio::time::sleep(timeout).await;
                Ok(false)
            }),
            Completion::Fail => Box::pin(async move {
                Err(HandleError::Failed {
                    channel_id: self.id,
                    reason: "verification failed".into(),
                })
            }),
            Completion::Panic => Box::pin(explode()),
        }
    }
}

/// Factory handing out [`FakeHandle`]s in a fixed order of behaviours.
pub struct FakeFactory {
    plan: Mutex<Vec<Completion>>,
    pub handles: Mutex<Vec<Arc<FakeHandle>>>,
    streams: Mutex<Vec<FramedStream>>,
}

impl FakeFactory {
    /// Handles take behaviours from `plan` in order, then `Immediate`.
    pub fn new(plan: Vec<Completion>) -> Arc<Self> {
        let mut plan = plan;
        plan.reverse();
        Arc::new(Self {
            plan: Mutex::new(plan),
            handles: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
        })
    }

    pub fn handles(&self) -> Vec<Arc<FakeHandle>> {
        self.handles.lock().unwrap().clone()
    }
}

impl HandleFactory for FakeFactory {
    fn create_handle(&self, channel: &Channel, stream: FramedStream) -> Arc<dyn ChannelHandle> {
        let completion = self.plan.lock().unwrap().pop().unwrap_or(Completion::Immediate);
        let handle = FakeHandle::with_id(channel.id(), completion);
        self.handles.lock().unwrap().push(Arc::clone(&handle));
        self.streams.lock().unwrap().push(stream);
        handle
    }
}

/// A stream server on an ephemeral port serving one channel service.
pub struct TestServer {
    pub endpoint: Arc<Endpoint>,
    pub server: StreamServer,
    pub listener: Arc<ChannelOpenListener>,
    pub addr: SocketAddr,
}

impl TestServer {
    pub fn uri(&self, scheme: &str) -> String {
        format!("{scheme}://{}", self.addr)
    }

    pub async fn stop(&self) {
        self.server.stop().await;
        self.endpoint.close();
    }
}

pub struct ServerOptions {
    pub realm: Option<Arc<dyn SecurityRealm>>,
    pub overrides: OptionMap,
    pub factory: Arc<dyn HandleFactory>,
    pub service: String,
    pub drain_timeout: Duration,
    pub token_dir: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            realm: None,
            overrides: OptionMap::empty(),
            factory: Arc::new(EchoService::new()),
            service: "echo".into(),
            drain_timeout: Duration::from_secs(2),
            token_dir: None,
        }
    }
}

pub async fn start_server(options: ServerOptions) -> TestServer {
    let endpoint = Endpoint::new("test-server");
    let listener = ChannelOpenListener::new(
        options.service.clone(),
        OptionMap::empty(),
        options.factory,
        options.drain_timeout,
    );
    listener.start(&endpoint).unwrap();

    let negotiator = Negotiator::new(options.realm, options.token_dir).unwrap();
    let server = StreamServer::new(
        StreamServerConfig {
            name: "test".into(),
            binding: BindingStrategy::Address("127.0.0.1:0".parse().unwrap()),
            overrides: options.overrides,
        },
        Arc::clone(&endpoint),
        Arc::new(negotiator),
        None,
    );
    let addr = server.start().await.unwrap();

    TestServer {
        endpoint,
        server,
        listener,
        addr,
    }
}

pub fn password(user: &str, password: &str) -> Arc<dyn CallbackHandler> {
    Arc::new(PasswordCredentials::new(user, password))
}

pub fn anonymous() -> Arc<dyn CallbackHandler> {
    Arc::new(AnonymousCredentials)
}

/// Connect to `uri` through a fresh client endpoint.
pub async fn connect(uri: &str, credentials: Arc<dyn CallbackHandler>) -> Result<Connection, OutboundError> {
    OutboundConnection::generic("test-client", uri, Some(Endpoint::new("test-client")))?
        .with_credentials(credentials)
        .connect()
        .await
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
