//! Security realms.
//!
//! # Data Flow
//! ```text
//! [[realms]] config
//!     → properties.rs (users file → credential store)
//!     → tls.rs (certificate chain, key, trust store → SslContext)
//!     → SecurityRealm trait object
//!     → sasl::Negotiator (capability query + credential verification)
//! ```
//!
//! # Design Decisions
//! - Realms advertise callbacks they can answer; the negotiator picks
//!   mechanisms from that set instead of being told which style a backend uses
//! - A realm answers at most one of the digest or plaintext callback families

pub mod callback;
pub mod properties;
pub mod tls;

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;

pub use callback::{Callback, CallbackError, CallbackHandler, CallbackKind};
pub use properties::{CredentialForm, PropertiesRealm};
pub use tls::{SslContext, TlsError};

/// A capability-queryable credential store.
pub trait SecurityRealm: Send + Sync {
    fn name(&self) -> &str;

    /// Callbacks this realm's handler can answer.
    fn supported_callbacks(&self) -> BTreeSet<CallbackKind>;

    fn ssl_context(&self) -> Option<SslContext>;

    fn has_trust_store(&self) -> bool;

    fn callback_handler(&self) -> Arc<dyn CallbackHandler>;
}

/// Errors raised while loading a realm.
#[derive(Debug, Error)]
pub enum RealmError {
    #[error("failed to read users file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("{path}:{line}: expected 'user=value'")]
    Malformed { path: String, line: usize },

    #[error(transparent)]
    Tls(#[from] TlsError),
}
