//! Server side of the connection handshake.
//!
//! # Data Flow
//! ```text
//! [TLS accept, when ssl.enabled && !ssl.starttls]
//!     → HELLO <endpoint> [STARTTLS] → MECHS ...
//!     ← STARTTLS → PROCEED → TLS accept → MECHS ...     (optional)
//!     ← AUTH <mech> [payload]
//!     → CHALLENGE / ← RESPONSE ...                      (mechanism driven)
//!     → SUCCESS <identity> | FAILURE <reason>
//! ```
//!
//! EXTERNAL is only offered once a client certificate has been seen.

use std::sync::Arc;

use rustls::ServerConfig;
use thiserror::Error;

use crate::net::protocol::{BoxedStream, Frame, FramedStream, ProtocolError};
use crate::net::tls;
use crate::sasl::server::Step;
use crate::sasl::{AuthenticatedIdentity, Mechanism, NegotiationError, NegotiationPolicy, Negotiator};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("handshake timed out")]
    TimedOut,
}

/// Everything the server needs to authenticate one connection.
pub struct HandshakeConfig {
    pub endpoint_name: String,
    pub negotiator: Arc<Negotiator>,
    pub policy: NegotiationPolicy,
    pub include: Option<Vec<Mechanism>>,
    pub tls: Option<Arc<ServerConfig>>,
}

impl HandshakeConfig {
    fn immediate_tls(&self) -> Option<&Arc<ServerConfig>> {
        let ssl = self.policy.ssl();
        self.tls.as_ref().filter(|_| ssl.enabled && !ssl.starttls)
    }

    fn starttls(&self) -> Option<&Arc<ServerConfig>> {
        let ssl = self.policy.ssl();
        self.tls.as_ref().filter(|_| ssl.enabled && ssl.starttls)
    }

    /// Mechanisms to advertise given whether the peer showed a certificate.
    pub fn offered(&self, peer_certificate: bool) -> Vec<Mechanism> {
        self.negotiator
            .setup()
            .offered(&self.policy, self.include.as_deref())
            .into_iter()
            .filter(|m| *m != Mechanism::External || peer_certificate)
            .collect()
    }
}

fn names(mechanisms: &[Mechanism]) -> Vec<String> {
    mechanisms.iter().map(|m| m.name().to_string()).collect()
}

/// Run the handshake to the point of a successful authentication.
pub async fn accept(
    stream: BoxedStream,
    config: &HandshakeConfig,
) -> Result<(FramedStream, AuthenticatedIdentity), HandshakeError> {
    let (mut framed, mut peer) = match config.immediate_tls() {
        Some(tls_config) => tls::accept(stream, Arc::clone(tls_config)).await?,
        None => (FramedStream::new(stream), None),
    };
    let mut upgradable = config.starttls().is_some();

    framed
        .write_frame(&Frame::Hello {
            endpoint: config.endpoint_name.clone(),
            starttls: upgradable,
        })
        .await?;
    let mut offered = config.offered(peer.is_some());
    framed.write_frame(&Frame::Mechs(names(&offered))).await?;

    loop {
        match framed.read_frame().await? {
            Frame::StartTls if upgradable => {
                framed.write_frame(&Frame::Proceed).await?;
                let raw = framed.into_inner()?;
                let tls_config = config.starttls().cloned().ok_or(ProtocolError::Unexpected {
                    expected: "AUTH",
                    got: "STARTTLS".into(),
                })?;
                (framed, peer) = tls::accept(raw, tls_config).await?;
                upgradable = false;
                offered = config.offered(peer.is_some());
                framed.write_frame(&Frame::Mechs(names(&offered))).await?;
                tracing::debug!(client_certificate = peer.is_some(), "Connection upgraded to TLS");
            }
            Frame::Auth { mechanism, payload } => {
                return authenticate(framed, config, &offered, peer, &mechanism, payload).await;
            }
            other => {
                let err = ProtocolError::Unexpected {
                    expected: "AUTH",
                    got: other.verb().to_string(),
                };
                let _ = framed.write_frame(&Frame::Failure(err.to_string())).await;
                return Err(err.into());
            }
        }
    }
}

async fn authenticate(
    mut framed: FramedStream,
    config: &HandshakeConfig,
    offered: &[Mechanism],
    peer: Option<String>,
    requested: &str,
    payload: Vec<u8>,
) -> Result<(FramedStream, AuthenticatedIdentity), HandshakeError> {
    match exchange(&mut framed, config, offered, peer, requested, payload).await {
        Ok(identity) => {
            framed.write_frame(&Frame::Success(identity.authorization_id.clone())).await?;
            tracing::debug!(
                mechanism = %identity.mechanism,
                authentication_id = %identity.authentication_id,
                authorization_id = %identity.authorization_id,
                "Peer authenticated"
            );
            Ok((framed, identity))
        }
        Err(HandshakeError::Negotiation(e)) => {
            metrics::counter!("remoting_auth_failures_total", "mechanism" => requested.to_string()).increment(1);
            tracing::warn!(mechanism = %requested, error = %e, "Authentication failed");
            let _ = framed.write_frame(&Frame::Failure(e.to_string())).await;
            Err(e.into())
        }
        Err(e) => Err(e),
    }
}

async fn exchange(
    framed: &mut FramedStream,
    config: &HandshakeConfig,
    offered: &[Mechanism],
    peer: Option<String>,
    requested: &str,
    payload: Vec<u8>,
) -> Result<AuthenticatedIdentity, HandshakeError> {
    let mechanism: Mechanism = requested.parse()?;
    if !offered.contains(&mechanism) {
        return Err(NegotiationError::NotOffered(mechanism).into());
    }
    let mut server = config.negotiator.create_server(mechanism, peer)?;

    let mut step = server.evaluate(&payload)?;
    loop {
        match step {
            Step::Complete(identity) => return Ok(identity),
            Step::Challenge(challenge) => {
                framed.write_frame(&Frame::Challenge(challenge)).await?;
                let response = framed
                    .expect("RESPONSE", |f| match f {
                        Frame::Response(r) => Ok(r),
                        other => Err(other),
                    })
                    .await?;
                step = server.evaluate(&response)?;
            }
        }
    }
}
