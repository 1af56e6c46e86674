//! Mechanism computation and credential-verifier dispatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::options::{keys, OptionMap};
use crate::realm::{CallbackHandler, CallbackKind, SecurityRealm, SslContext};
use crate::sasl::server::{
    AnonymousServer, DigestServer, ExternalServer, LocalUserServer, MechanismServer, PlainServer,
};
use crate::sasl::verifier::{AnonymousVerifier, ExternalVerifier, LocalUserVerifier, RealmVerifier};
use crate::sasl::{
    properties, ClientAuthMode, Mechanism, MechanismConfig, NegotiationError, NegotiationPolicy, PolicyBuilder,
    SetupError, SslPolicy, LOCAL_USER_IDENTITY,
};

/// Ordered mechanisms plus the policy computed alongside them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecuritySetup {
    mechanisms: Vec<MechanismConfig>,
    policy: NegotiationPolicy,
}

impl SecuritySetup {
    pub fn mechanisms(&self) -> &[MechanismConfig] {
        &self.mechanisms
    }

    pub fn mechanism_names(&self) -> Vec<Mechanism> {
        self.mechanisms.iter().map(|m| m.mechanism).collect()
    }

    pub fn policy(&self) -> &NegotiationPolicy {
        &self.policy
    }

    pub fn find(&self, mechanism: Mechanism) -> Option<&MechanismConfig> {
        self.mechanisms.iter().find(|m| m.mechanism == mechanism)
    }

    /// Option map a security provider contributes to a connector.
    pub fn to_options(&self) -> OptionMap {
        let names = self.mechanisms.iter().map(|m| m.mechanism.name().to_string()).collect::<Vec<_>>();
        OptionMap::builder()
            .set_all(&self.policy.to_options())
            .set(keys::SASL_MECHANISMS, names)
            .build()
    }

    /// Mechanisms that may be offered under `policy`, optionally narrowed to
    /// `include`. Preference order is preserved.
    pub fn offered(&self, policy: &NegotiationPolicy, include: Option<&[Mechanism]>) -> Vec<Mechanism> {
        self.mechanisms
            .iter()
            .map(|m| m.mechanism)
            .filter(|m| policy.permits(*m))
            .filter(|m| include.map_or(true, |list| list.contains(m)))
            .collect()
    }
}

/// Computes usable mechanisms for a realm and hands out verifiers for them.
pub struct Negotiator {
    realm: Option<Arc<dyn SecurityRealm>>,
    setup: SecuritySetup,
    pre_check: Option<Arc<dyn CallbackHandler>>,
}

impl Negotiator {
    pub fn new(realm: Option<Arc<dyn SecurityRealm>>, local_token_path: Option<PathBuf>) -> Result<Self, SetupError> {
        let setup = Self::compute_mechanisms(realm.as_deref(), local_token_path.as_deref())?;
        tracing::debug!(
            realm = realm.as_ref().map_or("<none>", |r| r.name()),
            mechanisms = ?setup.mechanism_names(),
            "Negotiation configured"
        );
        Ok(Self {
            realm,
            setup,
            pre_check: None,
        })
    }

    /// Install a verifier consulted before the realm for digest and
    /// plaintext mechanisms.
    pub fn with_pre_check(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.pre_check = Some(handler);
        self
    }

    /// Compute the ordered mechanism list and policy for `realm`.
    ///
    /// Local-user always comes first, except that EXTERNAL is put ahead of it
    /// when the realm has both an SSL context and a trust store.
    pub fn compute_mechanisms(
        realm: Option<&dyn SecurityRealm>,
        local_token_path: Option<&Path>,
    ) -> Result<SecuritySetup, SetupError> {
        let mut mechanisms = Vec::new();
        let mut policy = PolicyBuilder::default();

        let mut local = MechanismConfig::new(Mechanism::LocalUser)
            .with_property(properties::LOCAL_DEFAULT_USER, LOCAL_USER_IDENTITY);
        if let Some(path) = local_token_path {
            local = local.with_property(properties::LOCAL_CHALLENGE_PATH, path.display().to_string());
        }
        mechanisms.push(local);
        policy.allow_plaintext();

        match realm {
            Some(realm) => {
                let kinds = realm.supported_callbacks();
                let has = |k: CallbackKind| kinds.contains(&k);

                if has(CallbackKind::Name)
                    && has(CallbackKind::RealmName)
                    && (has(CallbackKind::Password) || has(CallbackKind::DigestHash))
                    && has(CallbackKind::Authorize)
                {
                    let mut digest = MechanismConfig::new(Mechanism::DigestSha256)
                        .with_property(properties::REALM_NAME, realm.name());
                    if has(CallbackKind::DigestHash) {
                        digest = digest.with_property(properties::PRE_DIGESTED, "true");
                    }
                    mechanisms.push(digest);
                } else if has(CallbackKind::Name) && has(CallbackKind::VerifyPassword) && has(CallbackKind::Authorize) {
                    mechanisms.push(MechanismConfig::new(Mechanism::Plain));
                    policy.allow_plaintext();
                } else {
                    return Err(SetupError::NoSupportedMechanism {
                        realm: realm.name().to_string(),
                    });
                }

                let ssl = match realm.ssl_context() {
                    None => SslPolicy::default(),
                    Some(_) if realm.has_trust_store() => {
                        mechanisms.insert(0, MechanismConfig::new(Mechanism::External));
                        // Requested rather than required: local-user must keep
                        // working for callers without a certificate.
                        SslPolicy {
                            enabled: true,
                            starttls: true,
                            client_auth: ClientAuthMode::Requested,
                        }
                    }
                    Some(_) => SslPolicy {
                        enabled: true,
                        starttls: true,
                        client_auth: ClientAuthMode::NotRequested,
                    },
                };
                policy.ssl(ssl);
            }
            None => {
                mechanisms.push(MechanismConfig::new(Mechanism::Anonymous));
                policy.allow_anonymous();
            }
        }

        Ok(SecuritySetup {
            mechanisms,
            policy: policy.build(),
        })
    }

    pub fn setup(&self) -> &SecuritySetup {
        &self.setup
    }

    pub fn realm(&self) -> Option<&Arc<dyn SecurityRealm>> {
        self.realm.as_ref()
    }

    pub fn ssl_context(&self) -> Option<SslContext> {
        self.realm.as_ref().and_then(|r| r.ssl_context())
    }

    /// Credential verifier for `mechanism_name`.
    ///
    /// Names outside the computed list yield [`NegotiationError::Unsupported`].
    pub fn credential_verifier(&self, mechanism_name: &str) -> Result<Arc<dyn CallbackHandler>, NegotiationError> {
        let mechanism: Mechanism = mechanism_name.parse()?;
        let config = self
            .setup
            .find(mechanism)
            .ok_or_else(|| NegotiationError::Unsupported(mechanism_name.to_string()))?;

        let verifier: Arc<dyn CallbackHandler> = match mechanism {
            Mechanism::LocalUser => Arc::new(LocalUserVerifier::new(
                config
                    .property(properties::LOCAL_DEFAULT_USER)
                    .unwrap_or(LOCAL_USER_IDENTITY),
            )),
            Mechanism::External => Arc::new(ExternalVerifier),
            Mechanism::Anonymous => Arc::new(AnonymousVerifier),
            Mechanism::DigestSha256 | Mechanism::Plain => {
                let realm = self
                    .realm
                    .as_ref()
                    .ok_or_else(|| NegotiationError::Unsupported(mechanism_name.to_string()))?;
                Arc::new(RealmVerifier::new(realm.callback_handler(), self.pre_check.clone()))
            }
        };
        Ok(verifier)
    }

    /// Start a server-side exchange for `mechanism`.
    ///
    /// `peer_identity` is the fingerprint of the client certificate, if any.
    pub fn create_server(
        &self,
        mechanism: Mechanism,
        peer_identity: Option<String>,
    ) -> Result<Box<dyn MechanismServer>, NegotiationError> {
        let verifier = self.credential_verifier(mechanism.name())?;
        let config = self
            .setup
            .find(mechanism)
            .ok_or_else(|| NegotiationError::Unsupported(mechanism.name().to_string()))?;

        let server: Box<dyn MechanismServer> = match mechanism {
            Mechanism::Anonymous => Box::new(AnonymousServer::new(verifier)),
            Mechanism::Plain => Box::new(PlainServer::new(verifier)),
            Mechanism::External => Box::new(ExternalServer::new(verifier, peer_identity)),
            Mechanism::DigestSha256 => {
                let realm = config
                    .property(properties::REALM_NAME)
                    .map(str::to_string)
                    .or_else(|| self.realm.as_ref().map(|r| r.name().to_string()))
                    .unwrap_or_default();
                let pre_hashed = config.property(properties::PRE_DIGESTED) == Some("true");
                Box::new(DigestServer::new(verifier, realm, pre_hashed))
            }
            Mechanism::LocalUser => {
                let default_user = config
                    .property(properties::LOCAL_DEFAULT_USER)
                    .unwrap_or(LOCAL_USER_IDENTITY)
                    .to_string();
                let dir = config
                    .property(properties::LOCAL_CHALLENGE_PATH)
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir);
                Box::new(LocalUserServer::new(verifier, default_user, dir))
            }
        };
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::RootCertStore;

    use super::*;
    use crate::realm::{CredentialForm, PropertiesRealm};

    /// Realm with a hand-picked callback set and TLS material.
    struct ShapedRealm {
        callbacks: BTreeSet<CallbackKind>,
        ssl: Option<SslContext>,
        inner: PropertiesRealm,
    }

    impl ShapedRealm {
        fn new(callbacks: &[CallbackKind]) -> Self {
            Self {
                callbacks: callbacks.iter().copied().collect(),
                ssl: None,
                inner: PropertiesRealm::from_users("Shaped", CredentialForm::Clear, [("a", "b")]),
            }
        }

        fn with_ssl(mut self, trust_store: bool) -> Self {
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(vec![0u8; 8]));
            let roots = trust_store.then(RootCertStore::empty);
            self.ssl = Some(SslContext::new(Vec::new(), key, roots));
            self
        }
    }

    impl SecurityRealm for ShapedRealm {
        fn name(&self) -> &str {
            "Shaped"
        }

        fn supported_callbacks(&self) -> BTreeSet<CallbackKind> {
            self.callbacks.clone()
        }

        fn ssl_context(&self) -> Option<SslContext> {
            self.ssl.clone()
        }

        fn has_trust_store(&self) -> bool {
            self.ssl.as_ref().is_some_and(SslContext::has_trust_store)
        }

        fn callback_handler(&self) -> Arc<dyn CallbackHandler> {
            self.inner.callback_handler()
        }
    }

    const DIGEST_CAPABLE: &[CallbackKind] = &[
        CallbackKind::Name,
        CallbackKind::RealmName,
        CallbackKind::Password,
        CallbackKind::Authorize,
    ];

    #[test]
    fn password_realm_gets_local_then_digest() {
        let realm = ShapedRealm::new(DIGEST_CAPABLE);
        let setup = Negotiator::compute_mechanisms(Some(&realm), None).unwrap();
        assert_eq!(setup.mechanism_names(), vec![Mechanism::LocalUser, Mechanism::DigestSha256]);
        assert!(!setup.policy().no_plaintext());
        assert!(setup.find(Mechanism::DigestSha256).unwrap().property(properties::PRE_DIGESTED).is_none());
    }

    #[test]
    fn no_realm_allows_anonymous() {
        let setup = Negotiator::compute_mechanisms(None, None).unwrap();
        assert_eq!(setup.mechanism_names(), vec![Mechanism::LocalUser, Mechanism::Anonymous]);
        assert!(!setup.policy().no_anonymous());
    }

    #[test]
    fn realm_without_usable_callbacks_fails() {
        let realm = ShapedRealm::new(&[CallbackKind::Name, CallbackKind::Authorize]);
        let err = Negotiator::compute_mechanisms(Some(&realm), None).unwrap_err();
        assert!(matches!(err, SetupError::NoSupportedMechanism { ref realm } if realm == "Shaped"));
    }

    #[test]
    fn trust_store_puts_external_first_and_requests_client_auth() {
        let realm = ShapedRealm::new(DIGEST_CAPABLE).with_ssl(true);
        let setup = Negotiator::compute_mechanisms(Some(&realm), None).unwrap();
        assert_eq!(
            setup.mechanism_names(),
            vec![Mechanism::External, Mechanism::LocalUser, Mechanism::DigestSha256]
        );
        let ssl = setup.policy().ssl();
        assert!(ssl.enabled);
        assert!(ssl.starttls);
        assert_eq!(ssl.client_auth, ClientAuthMode::Requested);
    }

    #[test]
    fn ssl_without_trust_store_is_transport_only() {
        let realm = ShapedRealm::new(DIGEST_CAPABLE).with_ssl(false);
        let setup = Negotiator::compute_mechanisms(Some(&realm), None).unwrap();
        assert_eq!(setup.mechanism_names(), vec![Mechanism::LocalUser, Mechanism::DigestSha256]);
        assert!(setup.policy().ssl().starttls);
        assert_eq!(setup.policy().ssl().client_auth, ClientAuthMode::NotRequested);
    }

    #[test]
    fn unknown_mechanism_is_unsupported() {
        let negotiator = Negotiator::new(None, None).unwrap();
        assert!(matches!(
            negotiator.credential_verifier("CRAM-MD5"),
            Err(NegotiationError::Unsupported(_))
        ));
        // known name, but not computed for this realm
        assert!(matches!(
            negotiator.credential_verifier("PLAIN"),
            Err(NegotiationError::Unsupported(_))
        ));
    }

    #[test]
    fn verify_only_realm_gets_plain() {
        let realm = PropertiesRealm::from_users("Ldapish", CredentialForm::Verify, [("a", "b")]);
        let setup = Negotiator::compute_mechanisms(Some(&realm), None).unwrap();
        assert_eq!(setup.mechanism_names(), vec![Mechanism::LocalUser, Mechanism::Plain]);
        assert!(!setup.policy().no_plaintext());
        assert!(setup.policy().no_anonymous());
        assert!(!setup.policy().ssl().enabled);
    }

    #[test]
    fn pre_hashed_realm_marks_digest() {
        let realm = PropertiesRealm::from_users("AppRealm", CredentialForm::Digest, [("a", "b")]);
        let setup = Negotiator::compute_mechanisms(Some(&realm), Some(Path::new("/var/tokens"))).unwrap();
        let digest = setup.find(Mechanism::DigestSha256).unwrap();
        assert_eq!(digest.property(properties::PRE_DIGESTED), Some("true"));
        assert_eq!(digest.property(properties::REALM_NAME), Some("AppRealm"));
        let local = setup.find(Mechanism::LocalUser).unwrap();
        assert_eq!(local.property(properties::LOCAL_CHALLENGE_PATH), Some("/var/tokens"));
    }

    #[test]
    fn offered_respects_policy_and_include_list() {
        let setup = Negotiator::compute_mechanisms(None, None).unwrap();
        let policy = setup.policy().clone();
        assert_eq!(setup.offered(&policy, None), vec![Mechanism::LocalUser, Mechanism::Anonymous]);
        assert_eq!(
            setup.offered(&policy, Some(&[Mechanism::Anonymous])),
            vec![Mechanism::Anonymous]
        );

        let strict = policy.with_overrides(&OptionMap::builder().set(keys::SASL_POLICY_NOANONYMOUS, true).build());
        assert_eq!(setup.offered(&strict, None), vec![Mechanism::LocalUser]);
    }

    #[test]
    fn setup_options_list_mechanisms_in_order() {
        let setup = Negotiator::compute_mechanisms(None, None).unwrap();
        let options = setup.to_options();
        assert_eq!(
            options.get_list(keys::SASL_MECHANISMS),
            Some(vec!["JBOSS-LOCAL-USER".to_string(), "ANONYMOUS".to_string()])
        );
        assert_eq!(options.get_bool(keys::SASL_POLICY_NOANONYMOUS), Some(false));
    }
}
