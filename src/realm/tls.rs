//! TLS material owned by a realm.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

use crate::sasl::ClientAuthMode;

/// Errors raised while loading or assembling TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    #[error("no private key found in '{0}'")]
    NoPrivateKey(String),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client verifier error: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// Server certificate, key and optional trust store of a realm.
///
/// Cheap to clone; the material is shared.
#[derive(Clone)]
pub struct SslContext {
    inner: Arc<SslContextInner>,
}

struct SslContextInner {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    trust_roots: Option<Arc<RootCertStore>>,
}

impl std::fmt::Debug for SslContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SslContext")
            .field("certs", &self.inner.certs.len())
            .field("trust_store", &self.inner.trust_roots.is_some())
            .finish()
    }
}

impl SslContext {
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        trust_roots: Option<RootCertStore>,
    ) -> Self {
        Self {
            inner: Arc::new(SslContextInner {
                certs,
                key,
                trust_roots: trust_roots.map(Arc::new),
            }),
        }
    }

    /// Load PEM material from disk.
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        trust_store_path: Option<&Path>,
    ) -> Result<Self, TlsError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        let roots = trust_store_path.map(load_roots).transpose()?;
        Ok(Self::new(certs, key, roots))
    }

    pub fn has_trust_store(&self) -> bool {
        self.inner.trust_roots.is_some()
    }

    /// Build a server configuration.
    ///
    /// With a trust store and [`ClientAuthMode::Requested`] the peer is asked
    /// for a certificate but may still connect without one.
    pub fn server_config(&self, client_auth: ClientAuthMode) -> Result<Arc<ServerConfig>, TlsError> {
        let certs = self.inner.certs.clone();
        let key = self.inner.key.clone_key();
        let builder = ServerConfig::builder();

        let config = match (&self.inner.trust_roots, client_auth) {
            (Some(roots), ClientAuthMode::Requested) => {
                let verifier = WebPkiClientVerifier::builder(Arc::clone(roots))
                    .allow_unauthenticated()
                    .build()?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            _ => builder.with_no_client_auth().with_single_cert(certs, key)?,
        };
        Ok(Arc::new(config))
    }
}

/// Build a client configuration trusting `roots`, optionally presenting a
/// client certificate.
pub fn client_config(
    roots: RootCertStore,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Io {
        path: path.display().to_string(),
        source,
    })
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

pub fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}
