//! Credential callbacks exchanged between mechanisms and realms.

use thiserror::Error;

/// Capability tags used when a realm advertises what it can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallbackKind {
    Name,
    RealmName,
    Password,
    DigestHash,
    VerifyPassword,
    Authorize,
}

/// A single credential question.
///
/// Server-side mechanisms fill in the request fields and let the handler
/// answer the `Option` fields. Client-side handlers answer `Name` and
/// `Password` with the caller's own credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Name {
        default: Option<String>,
        name: Option<String>,
    },
    RealmName {
        realm: String,
    },
    Password {
        password: Option<String>,
    },
    /// Hex-encoded `H(user:realm:password)`.
    DigestHash {
        hash: Option<String>,
    },
    VerifyPassword {
        password: String,
        verified: Option<bool>,
    },
    Authorize {
        authentication_id: String,
        authorization_id: String,
        authorized: Option<bool>,
    },
}

impl Callback {
    pub fn name(name: impl Into<String>) -> Self {
        Callback::Name {
            default: None,
            name: Some(name.into()),
        }
    }

    pub fn authorize(authentication_id: impl Into<String>, authorization_id: impl Into<String>) -> Self {
        Callback::Authorize {
            authentication_id: authentication_id.into(),
            authorization_id: authorization_id.into(),
            authorized: None,
        }
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            Callback::Name { .. } => CallbackKind::Name,
            Callback::RealmName { .. } => CallbackKind::RealmName,
            Callback::Password { .. } => CallbackKind::Password,
            Callback::DigestHash { .. } => CallbackKind::DigestHash,
            Callback::VerifyPassword { .. } => CallbackKind::VerifyPassword,
            Callback::Authorize { .. } => CallbackKind::Authorize,
        }
    }

    /// True once a handler has produced a verification answer for this callback.
    pub fn is_answered(&self) -> bool {
        match self {
            Callback::Password { password } => password.is_some(),
            Callback::DigestHash { hash } => hash.is_some(),
            Callback::VerifyPassword { verified, .. } => verified.is_some(),
            Callback::Authorize { authorized, .. } => authorized.is_some(),
            Callback::Name { .. } | Callback::RealmName { .. } => false,
        }
    }
}

/// The name carried by the first `Name` callback in `callbacks`.
pub fn claimed_name(callbacks: &[Callback]) -> Option<&str> {
    callbacks.iter().find_map(|cb| match cb {
        Callback::Name { name, default } => name.as_deref().or(default.as_deref()),
        _ => None,
    })
}

/// Errors raised while answering callbacks.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("unsupported callback {0:?}")]
    Unsupported(CallbackKind),

    #[error("identity '{actual}' rejected, expected '{expected}'")]
    IdentityMismatch { expected: String, actual: String },

    #[error("no identity supplied")]
    MissingIdentity,

    #[error("realm '{realm}' does not match '{requested}'")]
    WrongRealm { realm: String, requested: String },
}

/// Answers credential callbacks.
pub trait CallbackHandler: Send + Sync {
    fn handle(&self, callbacks: &mut [Callback]) -> Result<(), CallbackError>;
}

impl<F> CallbackHandler for F
where
    F: Fn(&mut [Callback]) -> Result<(), CallbackError> + Send + Sync,
{
    fn handle(&self, callbacks: &mut [Callback]) -> Result<(), CallbackError> {
        self(callbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answered_tracks_output_fields() {
        let mut cb = Callback::VerifyPassword {
            password: "pw".into(),
            verified: None,
        };
        assert!(!cb.is_answered());
        if let Callback::VerifyPassword { verified, .. } = &mut cb {
            *verified = Some(false);
        }
        assert!(cb.is_answered());
        assert_eq!(cb.kind(), CallbackKind::VerifyPassword);
    }

    #[test]
    fn claimed_name_falls_back_to_default() {
        let cbs = vec![Callback::Name {
            default: Some("$local".into()),
            name: None,
        }];
        assert_eq!(claimed_name(&cbs), Some("$local"));
    }
}
