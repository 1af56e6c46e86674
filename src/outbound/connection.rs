//! Client handshake and the client-side connection and channel.

use url::Url;

use super::provider::{dial_host, ConnectRequest};
use super::{ActiveGuard, OutboundError};
use crate::net::protocol::{BoxedStream, Frame, FramedStream, ProtocolError};
use crate::net::tls;
use crate::options::keys;
use crate::sasl::client::{select_client, ClientCapabilities};
use crate::sasl::Mechanism;

/// Run the client side of the handshake over a freshly dialed stream.
pub(crate) async fn client_handshake(
    stream: BoxedStream,
    request: &ConnectRequest,
    allow_local: bool,
) -> Result<Connection, OutboundError> {
    let host = dial_host(&request.uri).unwrap_or_default();
    let immediate_tls = request.options.bool_or(keys::SSL_ENABLED, false)
        && !request.options.bool_or(keys::SSL_STARTTLS, true);

    let mut secured = false;
    let mut framed = match &request.tls {
        Some(client_tls) if immediate_tls => {
            secured = true;
            tls::connect(stream, client_tls.config.clone(), &host).await?
        }
        _ => FramedStream::new(stream),
    };

    let (remote_endpoint, starttls) = framed
        .expect("HELLO", |f| match f {
            Frame::Hello { endpoint, starttls } => Ok((endpoint, starttls)),
            other => Err(other),
        })
        .await?;
    let mut offered = read_mechs(&mut framed).await?;

    if let (true, false, Some(client_tls)) = (starttls, secured, &request.tls) {
        framed.write_frame(&Frame::StartTls).await?;
        framed
            .expect("PROCEED", |f| match f {
                Frame::Proceed => Ok(()),
                other => Err(other),
            })
            .await?;
        framed = tls::connect(framed.into_inner()?, client_tls.config.clone(), &host).await?;
        secured = true;
        offered = read_mechs(&mut framed).await?;
    }

    let caps = ClientCapabilities {
        allow_local,
        has_certificate: secured && request.tls.as_ref().is_some_and(|t| t.has_certificate),
        authorization_id: None,
    };
    let mut client = select_client(&offered, &request.credentials, &caps)?;
    framed
        .write_frame(&Frame::Auth {
            mechanism: client.mechanism().name().to_string(),
            payload: client.initial_response()?,
        })
        .await?;

    loop {
        match framed.read_frame().await? {
            Frame::Challenge(challenge) => {
                let response = client.evaluate(&challenge)?;
                framed.write_frame(&Frame::Response(response)).await?;
            }
            Frame::Success(identity) => {
                tracing::debug!(
                    remote_endpoint = %remote_endpoint,
                    mechanism = %client.mechanism(),
                    identity = %identity,
                    tls = secured,
                    "Authenticated to remote endpoint"
                );
                return Ok(Connection::new(request.uri.clone(), remote_endpoint, identity, framed));
            }
            Frame::Failure(reason) => return Err(OutboundError::AuthenticationFailed(reason)),
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "CHALLENGE or SUCCESS",
                    got: other.verb().to_string(),
                }
                .into())
            }
        }
    }
}

async fn read_mechs(framed: &mut FramedStream) -> Result<Vec<Mechanism>, OutboundError> {
    let names = framed
        .expect("MECHS", |f| match f {
            Frame::Mechs(names) => Ok(names),
            other => Err(other),
        })
        .await?;
    // mechanisms this client does not know are skipped
    Ok(names.iter().filter_map(|n| n.parse().ok()).collect())
}

/// An authenticated connection, ready to open one channel.
pub struct Connection {
    uri: Url,
    remote_endpoint: String,
    identity: String,
    stream: FramedStream,
    active: Option<ActiveGuard>,
}

impl Connection {
    pub fn new(uri: Url, remote_endpoint: String, identity: String, stream: FramedStream) -> Self {
        Self {
            uri,
            remote_endpoint,
            identity,
            stream,
            active: None,
        }
    }

    pub(crate) fn with_active(mut self, guard: ActiveGuard) -> Self {
        self.active = Some(guard);
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    /// Identity the server granted.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Open a channel to `service`, consuming the connection.
    pub async fn open_channel(mut self, service: &str) -> Result<ClientChannel, OutboundError> {
        self.stream.write_frame(&Frame::Open(service.to_string())).await?;
        match self.stream.read_frame().await? {
            Frame::Opened(id) => Ok(ClientChannel {
                id,
                service: service.to_string(),
                stream: self.stream,
                closed: false,
                _active: self.active,
            }),
            Frame::Closed(reason) | Frame::Failure(reason) => Err(OutboundError::ChannelRejected {
                service: service.to_string(),
                reason,
            }),
            other => Err(ProtocolError::Unexpected {
                expected: "OPENED",
                got: other.verb().to_string(),
            }
            .into()),
        }
    }
}

/// Client end of an open channel.
pub struct ClientChannel {
    id: String,
    service: String,
    stream: FramedStream,
    closed: bool,
    _active: Option<ActiveGuard>,
}

impl ClientChannel {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn send(&mut self, message: &str) -> Result<(), OutboundError> {
        if self.closed {
            return Err(OutboundError::IllegalState(format!("channel {} is closed", self.id)));
        }
        self.stream.write_frame(&Frame::Data(message.to_string())).await?;
        Ok(())
    }

    /// Next message, or `None` once the server closed the channel.
    pub async fn recv(&mut self) -> Result<Option<String>, OutboundError> {
        if self.closed {
            return Ok(None);
        }
        match self.stream.read_frame().await {
            Ok(Frame::Data(message)) => Ok(Some(message)),
            Ok(Frame::Closed(reason)) => {
                tracing::debug!(channel = %self.id, reason = %reason, "Channel closed by server");
                self.closed = true;
                Ok(None)
            }
            Err(ProtocolError::Closed) => {
                self.closed = true;
                Ok(None)
            }
            Ok(other) => Err(ProtocolError::Unexpected {
                expected: "DATA",
                got: other.verb().to_string(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Send and wait for the reply.
    pub async fn request(&mut self, message: &str) -> Result<Option<String>, OutboundError> {
        self.send(message).await?;
        self.recv().await
    }

    pub async fn close(mut self) -> Result<(), OutboundError> {
        if !self.closed {
            self.stream.write_frame(&Frame::Closed("client closing".into())).await?;
            let _ = self.stream.shutdown().await;
        }
        Ok(())
    }
}
