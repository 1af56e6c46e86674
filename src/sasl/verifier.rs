//! Per-mechanism credential verifiers.

use std::sync::Arc;

use crate::realm::{Callback, CallbackError, CallbackHandler};

/// Accepts only the fixed local identity and never allows impersonation.
pub struct LocalUserVerifier {
    identity: String,
}

impl LocalUserVerifier {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

impl CallbackHandler for LocalUserVerifier {
    fn handle(&self, callbacks: &mut [Callback]) -> Result<(), CallbackError> {
        for cb in callbacks.iter_mut() {
            match cb {
                Callback::Name { default, name } => {
                    let claimed = name.as_deref().or(default.as_deref()).ok_or(CallbackError::MissingIdentity)?;
                    if claimed != self.identity {
                        return Err(CallbackError::IdentityMismatch {
                            expected: self.identity.clone(),
                            actual: claimed.to_string(),
                        });
                    }
                }
                Callback::Authorize {
                    authentication_id,
                    authorization_id,
                    authorized,
                } => {
                    *authorized = Some(authentication_id == authorization_id);
                }
                other => return Err(CallbackError::Unsupported(other.kind())),
            }
        }
        Ok(())
    }
}

/// Certificate-authenticated peers may only act as themselves.
pub struct ExternalVerifier;

impl CallbackHandler for ExternalVerifier {
    fn handle(&self, callbacks: &mut [Callback]) -> Result<(), CallbackError> {
        for cb in callbacks.iter_mut() {
            match cb {
                Callback::Authorize {
                    authentication_id,
                    authorization_id,
                    authorized,
                } => {
                    *authorized = Some(authentication_id == authorization_id);
                }
                other => return Err(CallbackError::Unsupported(other.kind())),
            }
        }
        Ok(())
    }
}

/// Anonymous authentication expects no callbacks at all.
pub struct AnonymousVerifier;

impl CallbackHandler for AnonymousVerifier {
    fn handle(&self, callbacks: &mut [Callback]) -> Result<(), CallbackError> {
        match callbacks.first() {
            Some(cb) => Err(CallbackError::Unsupported(cb.kind())),
            None => Ok(()),
        }
    }
}

/// Delegates to a realm, optionally after an external pre-check.
///
/// The realm is skipped when the pre-check answers at least one callback.
pub struct RealmVerifier {
    realm: Arc<dyn CallbackHandler>,
    pre_check: Option<Arc<dyn CallbackHandler>>,
}

impl RealmVerifier {
    pub fn new(realm: Arc<dyn CallbackHandler>, pre_check: Option<Arc<dyn CallbackHandler>>) -> Self {
        Self { realm, pre_check }
    }
}

impl CallbackHandler for RealmVerifier {
    fn handle(&self, callbacks: &mut [Callback]) -> Result<(), CallbackError> {
        if let Some(pre_check) = &self.pre_check {
            let mut trial = callbacks.to_vec();
            pre_check.handle(&mut trial)?;
            if trial.iter().any(Callback::is_answered) {
                callbacks.clone_from_slice(&trial);
                return Ok(());
            }
        }
        self.realm.handle(callbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realm::CallbackKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn local_user_rejects_other_names() {
        let v = LocalUserVerifier::new("$local");
        let mut ok = vec![Callback::name("$local"), Callback::authorize("$local", "$local")];
        v.handle(&mut ok).unwrap();
        assert!(matches!(ok[1], Callback::Authorize { authorized: Some(true), .. }));

        let mut bad = vec![Callback::name("root")];
        assert!(matches!(v.handle(&mut bad), Err(CallbackError::IdentityMismatch { .. })));

        let mut impersonate = vec![Callback::authorize("$local", "admin")];
        v.handle(&mut impersonate).unwrap();
        assert!(matches!(impersonate[0], Callback::Authorize { authorized: Some(false), .. }));
    }

    #[test]
    fn anonymous_rejects_any_callback() {
        assert!(AnonymousVerifier.handle(&mut []).is_ok());
        let mut cbs = vec![Callback::name("x")];
        assert!(matches!(
            AnonymousVerifier.handle(&mut cbs),
            Err(CallbackError::Unsupported(CallbackKind::Name))
        ));
    }

    #[test]
    fn external_only_authorizes() {
        let mut cbs = vec![Callback::Password { password: None }];
        assert!(ExternalVerifier.handle(&mut cbs).is_err());
    }

    fn counting_realm(calls: Arc<AtomicUsize>) -> Arc<dyn CallbackHandler> {
        Arc::new(move |cbs: &mut [Callback]| -> Result<(), CallbackError> {
            calls.fetch_add(1, Ordering::SeqCst);
            for cb in cbs.iter_mut() {
                if let Callback::VerifyPassword { verified, .. } = cb {
                    *verified = Some(false);
                }
            }
            Ok(())
        })
    }

    #[test]
    fn definitive_pre_check_short_circuits_realm() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pre: Arc<dyn CallbackHandler> = Arc::new(|cbs: &mut [Callback]| -> Result<(), CallbackError> {
            for cb in cbs.iter_mut() {
                if let Callback::VerifyPassword { verified, .. } = cb {
                    *verified = Some(true);
                }
            }
            Ok(())
        });
        let v = RealmVerifier::new(counting_realm(calls.clone()), Some(pre));
        let mut cbs = vec![
            Callback::name("alice"),
            Callback::VerifyPassword {
                password: "token".into(),
                verified: None,
            },
        ];
        v.handle(&mut cbs).unwrap();
        assert!(matches!(cbs[1], Callback::VerifyPassword { verified: Some(true), .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn silent_pre_check_falls_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pre: Arc<dyn CallbackHandler> = Arc::new(|_: &mut [Callback]| -> Result<(), CallbackError> { Ok(()) });
        let v = RealmVerifier::new(counting_realm(calls.clone()), Some(pre));
        let mut cbs = vec![
            Callback::name("alice"),
            Callback::VerifyPassword {
                password: "pw".into(),
                verified: None,
            },
        ];
        v.handle(&mut cbs).unwrap();
        assert!(matches!(cbs[1], Callback::VerifyPassword { verified: Some(false), .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
