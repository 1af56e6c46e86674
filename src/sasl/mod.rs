//! SASL mechanism negotiation.
//!
//! # Data Flow
//! ```text
//! SecurityRealm (capabilities, SSL context)
//!     → negotiator.rs (ordered mechanism list + NegotiationPolicy)
//!     → connector option overrides (policy flags, include list)
//!     → net::handshake offers mechanisms to the peer
//!     → server.rs mechanism exchange
//!     → verifier.rs per-mechanism credential checks
//!     → AuthenticatedIdentity
//! ```
//!
//! # Design Decisions
//! - Mechanism order is the preference order offered to peers
//! - The policy is computed once per realm and never mutated; overrides
//!   produce a new value
//! - Client certificates are requested, never required, so local-user
//!   authentication keeps working without one

pub mod client;
pub mod digest;
pub mod negotiator;
pub mod server;
pub mod verifier;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::options::{keys, OptionMap};
use crate::realm::CallbackError;

pub use negotiator::{Negotiator, SecuritySetup};

/// Identity granted to same-machine callers that pass the local challenge.
pub const LOCAL_USER_IDENTITY: &str = "$local";

/// Identity assigned to anonymous peers.
pub const ANONYMOUS_IDENTITY: &str = "anonymous";

/// Mechanism property names.
pub mod properties {
    pub const REALM_NAME: &str = "realm";
    pub const PRE_DIGESTED: &str = "digest.pre-hashed";
    pub const LOCAL_DEFAULT_USER: &str = "local-user.default-user";
    pub const LOCAL_CHALLENGE_PATH: &str = "local-user.challenge-path";
}

/// A negotiable mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// Client certificate presented during the TLS handshake.
    External,
    /// Same-machine trust proven by reading a challenge token file.
    LocalUser,
    DigestSha256,
    Plain,
    Anonymous,
}

impl Mechanism {
    pub const ALL: [Mechanism; 5] = [
        Mechanism::External,
        Mechanism::LocalUser,
        Mechanism::DigestSha256,
        Mechanism::Plain,
        Mechanism::Anonymous,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::External => "EXTERNAL",
            Mechanism::LocalUser => "JBOSS-LOCAL-USER",
            Mechanism::DigestSha256 => "DIGEST-SHA-256",
            Mechanism::Plain => "PLAIN",
            Mechanism::Anonymous => "ANONYMOUS",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mechanism {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mechanism::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| NegotiationError::Unsupported(s.to_string()))
    }
}

/// A mechanism together with its properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MechanismConfig {
    pub mechanism: Mechanism,
    pub properties: BTreeMap<String, String>,
}

impl MechanismConfig {
    pub fn new(mechanism: Mechanism) -> Self {
        Self {
            mechanism,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Whether the server asks peers for a client certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuthMode {
    #[default]
    NotRequested,
    Requested,
}

impl ClientAuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuthMode::NotRequested => "not-requested",
            ClientAuthMode::Requested => "requested",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "not-requested" => Some(ClientAuthMode::NotRequested),
            "requested" => Some(ClientAuthMode::Requested),
            _ => None,
        }
    }
}

/// Transport security flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SslPolicy {
    pub enabled: bool,
    pub starttls: bool,
    pub client_auth: ClientAuthMode,
}

/// Negotiation policy flags.
///
/// Built by the negotiator; later layers derive new values with
/// [`NegotiationPolicy::with_overrides`] instead of mutating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationPolicy {
    no_anonymous: bool,
    no_plaintext: bool,
    no_active: bool,
    no_dictionary: bool,
    forward_secrecy: bool,
    pass_credentials: bool,
    ssl: SslPolicy,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            no_anonymous: true,
            no_plaintext: true,
            no_active: false,
            no_dictionary: false,
            forward_secrecy: false,
            pass_credentials: false,
            ssl: SslPolicy::default(),
        }
    }
}

impl NegotiationPolicy {
    pub fn no_anonymous(&self) -> bool {
        self.no_anonymous
    }

    pub fn no_plaintext(&self) -> bool {
        self.no_plaintext
    }

    pub fn no_active(&self) -> bool {
        self.no_active
    }

    pub fn no_dictionary(&self) -> bool {
        self.no_dictionary
    }

    pub fn forward_secrecy(&self) -> bool {
        self.forward_secrecy
    }

    pub fn pass_credentials(&self) -> bool {
        self.pass_credentials
    }

    pub fn ssl(&self) -> SslPolicy {
        self.ssl
    }

    /// Whether the policy lets `mechanism` be offered.
    pub fn permits(&self, mechanism: Mechanism) -> bool {
        match mechanism {
            Mechanism::Anonymous => !self.no_anonymous,
            Mechanism::Plain => !self.no_plaintext,
            // shared-secret mechanisms are open to dictionary attacks
            Mechanism::DigestSha256 => !self.no_dictionary,
            Mechanism::External | Mechanism::LocalUser => true,
        }
    }

    pub fn to_options(&self) -> OptionMap {
        OptionMap::builder()
            .set(keys::SASL_POLICY_NOANONYMOUS, self.no_anonymous)
            .set(keys::SASL_POLICY_NOPLAINTEXT, self.no_plaintext)
            .set(keys::SASL_POLICY_NOACTIVE, self.no_active)
            .set(keys::SASL_POLICY_NODICTIONARY, self.no_dictionary)
            .set(keys::SASL_POLICY_FORWARD_SECRECY, self.forward_secrecy)
            .set(keys::SASL_POLICY_PASS_CREDENTIALS, self.pass_credentials)
            .set(keys::SSL_ENABLED, self.ssl.enabled)
            .set(keys::SSL_STARTTLS, self.ssl.starttls)
            .set(keys::SSL_CLIENT_AUTH_MODE, self.ssl.client_auth.as_str())
            .build()
    }

    /// A copy of `self` with every flag present in `options` replaced.
    pub fn with_overrides(&self, options: &OptionMap) -> NegotiationPolicy {
        let client_auth = match options.get_text(keys::SSL_CLIENT_AUTH_MODE) {
            Some(raw) => ClientAuthMode::parse(raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "Unknown client auth mode, keeping computed value");
                self.ssl.client_auth
            }),
            None => self.ssl.client_auth,
        };

        NegotiationPolicy {
            no_anonymous: options.bool_or(keys::SASL_POLICY_NOANONYMOUS, self.no_anonymous),
            no_plaintext: options.bool_or(keys::SASL_POLICY_NOPLAINTEXT, self.no_plaintext),
            no_active: options.bool_or(keys::SASL_POLICY_NOACTIVE, self.no_active),
            no_dictionary: options.bool_or(keys::SASL_POLICY_NODICTIONARY, self.no_dictionary),
            forward_secrecy: options.bool_or(keys::SASL_POLICY_FORWARD_SECRECY, self.forward_secrecy),
            pass_credentials: options.bool_or(keys::SASL_POLICY_PASS_CREDENTIALS, self.pass_credentials),
            ssl: SslPolicy {
                enabled: options.bool_or(keys::SSL_ENABLED, self.ssl.enabled),
                starttls: options.bool_or(keys::SSL_STARTTLS, self.ssl.starttls),
                client_auth,
            },
        }
    }

    /// Read a policy back from an option map, defaulting missing flags.
    pub fn from_options(options: &OptionMap) -> NegotiationPolicy {
        NegotiationPolicy::default().with_overrides(options)
    }
}

/// Builder used by the negotiator while computing a policy.
#[derive(Debug, Default)]
pub(crate) struct PolicyBuilder {
    policy: NegotiationPolicy,
}

impl PolicyBuilder {
    pub(crate) fn allow_anonymous(&mut self) -> &mut Self {
        self.policy.no_anonymous = false;
        self
    }

    pub(crate) fn allow_plaintext(&mut self) -> &mut Self {
        self.policy.no_plaintext = false;
        self
    }

    pub(crate) fn ssl(&mut self, ssl: SslPolicy) -> &mut Self {
        self.policy.ssl = ssl;
        self
    }

    pub(crate) fn build(self) -> NegotiationPolicy {
        self.policy
    }
}

/// The outcome of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    pub mechanism: Mechanism,
    pub authentication_id: String,
    pub authorization_id: String,
}

/// Configuration errors raised while preparing negotiation for a realm.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no supported authentication mechanism for realm '{realm}'")]
    NoSupportedMechanism { realm: String },

    #[error("unknown mechanism '{0}' in include list")]
    UnknownMechanism(String),
}

/// Per-connection authentication failures.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("mechanism {0} is not supported")]
    Unsupported(String),

    #[error("mechanism {0} was not offered")]
    NotOffered(Mechanism),

    #[error("callback failed: {0}")]
    Callback(#[from] CallbackError),

    #[error("authentication failed for '{0}'")]
    AuthenticationFailed(String),

    #[error("'{authentication_id}' may not act as '{authorization_id}'")]
    NotAuthorized {
        authentication_id: String,
        authorization_id: String,
    },

    #[error("malformed {0} message")]
    Malformed(&'static str),

    #[error("unexpected message after {0} completed")]
    AlreadyComplete(Mechanism),

    #[error("no offered mechanism is usable with these credentials")]
    NoUsableMechanism,

    #[error("local challenge failed: {0}")]
    LocalChallenge(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_names_round_trip() {
        for m in Mechanism::ALL {
            assert_eq!(m.name().parse::<Mechanism>().unwrap(), m);
        }
        assert!("CRAM-MD5".parse::<Mechanism>().is_err());
    }

    #[test]
    fn overrides_replace_only_present_flags() {
        let policy = NegotiationPolicy::default();
        let overrides = OptionMap::builder()
            .set(keys::SASL_POLICY_NOANONYMOUS, false)
            .set(keys::SSL_CLIENT_AUTH_MODE, "requested")
            .build();
        let derived = policy.with_overrides(&overrides);

        assert!(!derived.no_anonymous());
        assert!(derived.no_plaintext());
        assert_eq!(derived.ssl().client_auth, ClientAuthMode::Requested);
        // the source is unchanged
        assert!(policy.no_anonymous());
    }

    #[test]
    fn options_round_trip() {
        let mut builder = PolicyBuilder::default();
        builder.allow_plaintext().ssl(SslPolicy {
            enabled: true,
            starttls: true,
            client_auth: ClientAuthMode::Requested,
        });
        let policy = builder.build();
        assert_eq!(NegotiationPolicy::from_options(&policy.to_options()), policy);
    }

    #[test]
    fn permits_follows_flags() {
        let policy = NegotiationPolicy::default();
        assert!(!policy.permits(Mechanism::Anonymous));
        assert!(!policy.permits(Mechanism::Plain));
        assert!(policy.permits(Mechanism::LocalUser));
        assert!(policy.permits(Mechanism::DigestSha256));
    }
}
