//! TLS upgrades for framed streams.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use sha2::{Digest, Sha256};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::net::protocol::{BoxedStream, FramedStream, ProtocolError};

/// Identity of a certificate: hex SHA-256 of its DER encoding.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Server side of a TLS upgrade. Returns the new stream and the fingerprint
/// of the client certificate, if one was presented.
pub async fn accept(
    stream: BoxedStream,
    config: Arc<ServerConfig>,
) -> Result<(FramedStream, Option<String>), ProtocolError> {
    let tls = TlsAcceptor::from(config).accept(stream).await?;
    let peer = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(fingerprint);
    Ok((FramedStream::new(Box::new(tls)), peer))
}

/// Client side of a TLS upgrade.
pub async fn connect(stream: BoxedStream, config: Arc<ClientConfig>, host: &str) -> Result<FramedStream, ProtocolError> {
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| ProtocolError::Malformed(format!("invalid TLS server name '{host}': {e}")))?;
    let tls = TlsConnector::from(config).connect(name, stream).await?;
    Ok(FramedStream::new(Box::new(tls)))
}
