//! Full stack: stream server, echo service, outbound client and shutdown.

use std::sync::Arc;
use std::time::Duration;

use remoting_endpoint::config::parse_config;
use remoting_endpoint::lifecycle::{Interrupt, RunningEndpoint, StopContext};
use remoting_endpoint::net::protocol::{Frame, FramedStream, ProtocolError};
use remoting_endpoint::options::{keys, OptionMap};
use remoting_endpoint::outbound::OutboundError;
use remoting_endpoint::service::EchoService;

mod common;
use common::ServerOptions;

#[tokio::test]
async fn echo_round_trip() {
    let server = common::start_server(ServerOptions::default()).await;

    let connection = common::connect(&server.uri("remote"), common::anonymous()).await.unwrap();
    let mut channel = connection.open_channel("echo").await.unwrap();
    assert!(channel.id().starts_with("chan-"));

    assert_eq!(channel.request("hello").await.unwrap().as_deref(), Some("hello"));
    assert_eq!(channel.request("again").await.unwrap().as_deref(), Some("again"));
    assert_eq!(server.listener.live_handles(), 1);

    channel.close().await.unwrap();
    let listener = Arc::clone(&server.listener);
    assert!(common::eventually(Duration::from_secs(1), || listener.live_handles() == 0).await);
    server.stop().await;
}

#[tokio::test]
async fn unknown_service_is_rejected() {
    let server = common::start_server(ServerOptions::default()).await;

    let connection = common::connect(&server.uri("remote"), common::anonymous()).await.unwrap();
    let result = connection.open_channel("ledger").await;
    assert!(matches!(
        result,
        Err(OutboundError::ChannelRejected { service, .. }) if service == "ledger"
    ));
    server.stop().await;
}

#[tokio::test]
async fn stop_lets_in_flight_reply_finish() {
    let server = common::start_server(ServerOptions {
        factory: Arc::new(EchoService::new().with_reply_delay(Duration::from_millis(150))),
        ..Default::default()
    })
    .await;

    let connection = common::connect(&server.uri("remote"), common::anonymous()).await.unwrap();
    let mut channel = connection.open_channel("echo").await.unwrap();
    channel.send("slow").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let completion = server.listener.stop(StopContext::new());
    assert_eq!(channel.recv().await.unwrap().as_deref(), Some("slow"));
    assert_eq!(channel.recv().await.unwrap(), None);
    assert!(channel.is_closed());

    let report = completion.await;
    assert_eq!(report.drained, 1);
    assert_eq!(report.timed_out, 0);

    // the service is gone from the endpoint once stopped
    let late = common::connect(&server.uri("remote"), common::anonymous()).await.unwrap();
    assert!(matches!(
        late.open_channel("echo").await,
        Err(OutboundError::ChannelRejected { .. })
    ));
    server.stop().await;
}

#[tokio::test]
async fn handshake_timeout_drops_idle_peer() {
    let server = common::start_server(ServerOptions {
        overrides: OptionMap::builder().set(keys::HANDSHAKE_TIMEOUT_MS, 100i64).build(),
        ..Default::default()
    })
    .await;

    let stream = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let mut framed = FramedStream::new(Box::new(stream));
    assert!(matches!(framed.read_frame().await.unwrap(), Frame::Hello { .. }));
    assert!(matches!(framed.read_frame().await.unwrap(), Frame::Mechs(_)));

    let ended = tokio::time::timeout(Duration::from_secs(2), framed.read_frame()).await.unwrap();
    assert!(matches!(ended, Err(ProtocolError::Closed) | Err(ProtocolError::Io(_))));
    server.stop().await;
}

#[tokio::test]
async fn connection_limit_holds_until_a_channel_closes() {
    let server = common::start_server(ServerOptions {
        overrides: OptionMap::builder().set(keys::MAX_CONNECTIONS, 1i64).build(),
        ..Default::default()
    })
    .await;
    let uri = server.uri("remote");

    let first = common::connect(&uri, common::anonymous()).await.unwrap();
    let channel = first.open_channel("echo").await.unwrap();

    let second = tokio::spawn({
        let uri = uri.clone();
        async move { common::connect(&uri, common::anonymous()).await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!second.is_finished());

    channel.close().await.unwrap();
    let connection = tokio::time::timeout(Duration::from_secs(2), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(connection.identity(), "anonymous");
    server.stop().await;
}

#[tokio::test]
async fn running_endpoint_serves_reloaded_outbound_connection() {
    let config = parse_config(
        r#"
        [endpoint]
        name = "node-a"
        channel_shutdown_timeout = "500"

        [[connectors]]
        name = "main"
        address = "127.0.0.1:0"
        "#,
    )
    .unwrap();
    let running = RunningEndpoint::start(config.clone()).await.unwrap();
    let addr = running.local_addr("main").unwrap();
    assert!(running.outbound().is_empty());

    let mut reloaded = config;
    reloaded.outbound_connections = parse_config(&format!(
        r#"
        [[outbound_connections]]
        name = "self"
        kind = "generic"
        uri = "remote://{addr}"
        "#
    ))
    .unwrap()
    .outbound_connections;
    running.reload(reloaded).unwrap();

    let outbound = running.outbound().get("self").unwrap();
    let connection = outbound.connect().await.unwrap();
    assert_eq!(connection.remote_endpoint(), "node-a");
    let mut channel = connection.open_channel("echo").await.unwrap();
    assert_eq!(channel.request("loop").await.unwrap().as_deref(), Some("loop"));

    let reports = running.shutdown(Interrupt::new()).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].1.drained, 1);
    assert_eq!(channel.recv().await.unwrap(), None);
}
