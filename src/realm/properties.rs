//! Realm backed by a `user=value` properties file.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::realm::callback::{Callback, CallbackError, CallbackHandler, CallbackKind};
use crate::realm::{RealmError, SecurityRealm, SslContext};
use crate::sasl::digest;

/// How the users file stores credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialForm {
    /// Clear-text passwords; the realm can hand them out for digest verification.
    #[default]
    Clear,
    /// Pre-hashed `H(user:realm:password)` values.
    Digest,
    /// Clear-text passwords that the realm only verifies, never reveals.
    Verify,
}

/// File-backed credential store.
pub struct PropertiesRealm {
    name: String,
    form: CredentialForm,
    users: Arc<HashMap<String, String>>,
    ssl: Option<SslContext>,
}

impl PropertiesRealm {
    /// Load users from `path`.
    pub fn load(name: &str, path: &Path, form: CredentialForm) -> Result<Self, RealmError> {
        let content = std::fs::read_to_string(path).map_err(|source| RealmError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut users = HashMap::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, value) = line.split_once('=').ok_or_else(|| RealmError::Malformed {
                path: path.display().to_string(),
                line: idx + 1,
            })?;
            users.insert(user.trim().to_string(), value.trim().to_string());
        }

        tracing::info!(realm = %name, users = users.len(), ?form, "Realm loaded");
        Ok(Self::from_users(name, form, users))
    }

    pub fn from_users<I, K, V>(name: &str, form: CredentialForm, users: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.to_string(),
            form,
            users: Arc::new(users.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
            ssl: None,
        }
    }

    pub fn with_ssl_context(mut self, ssl: SslContext) -> Self {
        self.ssl = Some(ssl);
        self
    }
}

impl SecurityRealm for PropertiesRealm {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_callbacks(&self) -> BTreeSet<CallbackKind> {
        let mut kinds = BTreeSet::from([CallbackKind::Name, CallbackKind::Authorize]);
        match self.form {
            CredentialForm::Clear => {
                kinds.extend([CallbackKind::RealmName, CallbackKind::Password, CallbackKind::VerifyPassword]);
            }
            CredentialForm::Digest => {
                kinds.extend([CallbackKind::RealmName, CallbackKind::DigestHash, CallbackKind::VerifyPassword]);
            }
            CredentialForm::Verify => {
                kinds.insert(CallbackKind::VerifyPassword);
            }
        }
        kinds
    }

    fn ssl_context(&self) -> Option<SslContext> {
        self.ssl.clone()
    }

    fn has_trust_store(&self) -> bool {
        self.ssl.as_ref().is_some_and(SslContext::has_trust_store)
    }

    fn callback_handler(&self) -> Arc<dyn CallbackHandler> {
        Arc::new(PropertiesHandler {
            realm: self.name.clone(),
            form: self.form,
            users: Arc::clone(&self.users),
        })
    }
}

struct PropertiesHandler {
    realm: String,
    form: CredentialForm,
    users: Arc<HashMap<String, String>>,
}

impl PropertiesHandler {
    fn check_password(&self, user: &str, password: &str) -> bool {
        match (self.users.get(user), self.form) {
            (Some(stored), CredentialForm::Digest) => {
                digest::constant_time_eq(stored.as_bytes(), digest::a1(user, &self.realm, password).as_bytes())
            }
            (Some(stored), _) => digest::constant_time_eq(stored.as_bytes(), password.as_bytes()),
            (None, _) => false,
        }
    }
}

impl CallbackHandler for PropertiesHandler {
    fn handle(&self, callbacks: &mut [Callback]) -> Result<(), CallbackError> {
        let mut user: Option<String> = None;

        for cb in callbacks.iter_mut() {
            match cb {
                Callback::Name { default, name } => {
                    user = name.clone().or_else(|| default.clone());
                }
                Callback::RealmName { realm } => {
                    if *realm != self.realm {
                        return Err(CallbackError::WrongRealm {
                            realm: self.realm.clone(),
                            requested: realm.clone(),
                        });
                    }
                }
                Callback::Password { password } => {
                    if self.form != CredentialForm::Clear {
                        return Err(CallbackError::Unsupported(CallbackKind::Password));
                    }
                    let name = user.as_deref().ok_or(CallbackError::MissingIdentity)?;
                    *password = self.users.get(name).cloned();
                }
                Callback::DigestHash { hash } => {
                    if self.form != CredentialForm::Digest {
                        return Err(CallbackError::Unsupported(CallbackKind::DigestHash));
                    }
                    let name = user.as_deref().ok_or(CallbackError::MissingIdentity)?;
                    *hash = self.users.get(name).cloned();
                }
                Callback::VerifyPassword { password, verified } => {
                    let name = user.as_deref().ok_or(CallbackError::MissingIdentity)?;
                    *verified = Some(self.check_password(name, password));
                }
                Callback::Authorize {
                    authentication_id,
                    authorization_id,
                    authorized,
                } => {
                    *authorized = Some(authentication_id == authorization_id);
                }
            }
        }
        Ok(())
    }
}
