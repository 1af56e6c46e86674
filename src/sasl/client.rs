//! Client side of each mechanism exchange.
//!
//! Credentials come from a [`CallbackHandler`] that answers `Name` and
//! `Password` callbacks. A mechanism is only chosen when the handler can
//! supply everything it needs.

use std::sync::Arc;

use crate::realm::{Callback, CallbackError, CallbackHandler};
use crate::sasl::{digest, Mechanism, NegotiationError};

pub trait MechanismClient: Send {
    fn mechanism(&self) -> Mechanism;

    /// Payload sent together with the mechanism name.
    fn initial_response(&mut self) -> Result<Vec<u8>, NegotiationError>;

    /// Reply to a server challenge.
    fn evaluate(&mut self, challenge: &[u8]) -> Result<Vec<u8>, NegotiationError>;
}

/// Supplies no credentials; only anonymous and identity-free mechanisms
/// can be negotiated with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousCredentials;

impl CallbackHandler for AnonymousCredentials {
    fn handle(&self, _callbacks: &mut [Callback]) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Fixed username and password.
#[derive(Clone)]
pub struct PasswordCredentials {
    username: String,
    password: String,
}

impl PasswordCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for PasswordCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl CallbackHandler for PasswordCredentials {
    fn handle(&self, callbacks: &mut [Callback]) -> Result<(), CallbackError> {
        for cb in callbacks.iter_mut() {
            match cb {
                Callback::Name { name, .. } => *name = Some(self.username.clone()),
                Callback::Password { password } => *password = Some(self.password.clone()),
                _ => {}
            }
        }
        Ok(())
    }
}

/// What the client can offer beyond its callback handler.
#[derive(Debug, Clone, Default)]
pub struct ClientCapabilities {
    /// Attempt same-machine authentication when offered.
    pub allow_local: bool,
    /// A client certificate was presented during TLS.
    pub has_certificate: bool,
    pub authorization_id: Option<String>,
}

/// Pick the first offered mechanism the client can complete.
pub fn select_client(
    offered: &[Mechanism],
    credentials: &Arc<dyn CallbackHandler>,
    caps: &ClientCapabilities,
) -> Result<Box<dyn MechanismClient>, NegotiationError> {
    let authz = caps.authorization_id.clone().unwrap_or_default();

    for mechanism in offered {
        let client: Option<Box<dyn MechanismClient>> = match mechanism {
            Mechanism::External if caps.has_certificate => Some(Box::new(ExternalClient { authz: authz.clone() })),
            Mechanism::LocalUser if caps.allow_local => Some(Box::new(LocalUserClient {
                authz: authz.clone(),
                sent: false,
            })),
            Mechanism::DigestSha256 | Mechanism::Plain => password_credentials(credentials.as_ref())?.map(|(user, pw)| {
                let client: Box<dyn MechanismClient> = if *mechanism == Mechanism::Plain {
                    Box::new(PlainClient {
                        authz: authz.clone(),
                        user,
                        password: pw,
                    })
                } else {
                    Box::new(DigestClient {
                        authz: authz.clone(),
                        user,
                        password: pw,
                    })
                };
                client
            }),
            Mechanism::Anonymous => Some(Box::new(AnonymousClient)),
            _ => None,
        };
        if let Some(client) = client {
            tracing::debug!(mechanism = %client.mechanism(), "Selected client mechanism");
            return Ok(client);
        }
    }
    Err(NegotiationError::NoUsableMechanism)
}

fn password_credentials(handler: &dyn CallbackHandler) -> Result<Option<(String, String)>, NegotiationError> {
    let mut cbs = [
        Callback::Name {
            default: None,
            name: None,
        },
        Callback::Password { password: None },
    ];
    handler.handle(&mut cbs)?;
    match cbs {
        [Callback::Name { name: Some(user), .. }, Callback::Password { password: Some(pw) }] => Ok(Some((user, pw))),
        _ => Ok(None),
    }
}

struct AnonymousClient;

impl MechanismClient for AnonymousClient {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Anonymous
    }

    fn initial_response(&mut self) -> Result<Vec<u8>, NegotiationError> {
        Ok(Vec::new())
    }

    fn evaluate(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        Err(NegotiationError::AlreadyComplete(Mechanism::Anonymous))
    }
}

struct ExternalClient {
    authz: String,
}

impl MechanismClient for ExternalClient {
    fn mechanism(&self) -> Mechanism {
        Mechanism::External
    }

    fn initial_response(&mut self) -> Result<Vec<u8>, NegotiationError> {
        Ok(self.authz.clone().into_bytes())
    }

    fn evaluate(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        Err(NegotiationError::AlreadyComplete(Mechanism::External))
    }
}

struct PlainClient {
    authz: String,
    user: String,
    password: String,
}

impl MechanismClient for PlainClient {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Plain
    }

    fn initial_response(&mut self) -> Result<Vec<u8>, NegotiationError> {
        Ok(format!("{}\0{}\0{}", self.authz, self.user, self.password).into_bytes())
    }

    fn evaluate(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        Err(NegotiationError::AlreadyComplete(Mechanism::Plain))
    }
}

struct DigestClient {
    authz: String,
    user: String,
    password: String,
}

impl MechanismClient for DigestClient {
    fn mechanism(&self) -> Mechanism {
        Mechanism::DigestSha256
    }

    fn initial_response(&mut self) -> Result<Vec<u8>, NegotiationError> {
        Ok(Vec::new())
    }

    fn evaluate(&mut self, challenge: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        let raw = std::str::from_utf8(challenge).map_err(|_| NegotiationError::Malformed("DIGEST-SHA-256"))?;
        let directives = digest::parse_directives(raw);
        let realm = digest::directive(&directives, "realm").ok_or(NegotiationError::Malformed("DIGEST-SHA-256"))?;
        let nonce = digest::directive(&directives, "nonce").ok_or(NegotiationError::Malformed("DIGEST-SHA-256"))?;

        let a1 = digest::a1(&self.user, realm, &self.password);
        let mut reply = format!("username={},response={}", self.user, digest::response(&a1, nonce));
        if !self.authz.is_empty() {
            reply.push_str(&format!(",authzid={}", self.authz));
        }
        Ok(reply.into_bytes())
    }
}

/// Answers the local challenge by reading the token file the server names.
struct LocalUserClient {
    authz: String,
    sent: bool,
}

impl MechanismClient for LocalUserClient {
    fn mechanism(&self) -> Mechanism {
        Mechanism::LocalUser
    }

    fn initial_response(&mut self) -> Result<Vec<u8>, NegotiationError> {
        Ok(self.authz.clone().into_bytes())
    }

    fn evaluate(&mut self, challenge: &[u8]) -> Result<Vec<u8>, NegotiationError> {
        if self.sent {
            return Err(NegotiationError::AlreadyComplete(Mechanism::LocalUser));
        }
        let path = std::str::from_utf8(challenge).map_err(|_| NegotiationError::Malformed("JBOSS-LOCAL-USER"))?;
        let token = std::fs::read(path).map_err(NegotiationError::LocalChallenge)?;
        self.sent = true;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon() -> Arc<dyn CallbackHandler> {
        Arc::new(AnonymousCredentials)
    }

    fn password() -> Arc<dyn CallbackHandler> {
        Arc::new(PasswordCredentials::new("alice", "secret"))
    }

    #[test]
    fn skips_mechanisms_without_credentials() {
        let offered = [Mechanism::External, Mechanism::LocalUser, Mechanism::Plain, Mechanism::Anonymous];
        let client = select_client(&offered, &anon(), &ClientCapabilities::default()).unwrap();
        assert_eq!(client.mechanism(), Mechanism::Anonymous);

        let client = select_client(&offered, &password(), &ClientCapabilities::default()).unwrap();
        assert_eq!(client.mechanism(), Mechanism::Plain);

        let caps = ClientCapabilities {
            allow_local: true,
            ..Default::default()
        };
        let client = select_client(&offered, &password(), &caps).unwrap();
        assert_eq!(client.mechanism(), Mechanism::LocalUser);
    }

    #[test]
    fn nothing_usable() {
        let result = select_client(&[Mechanism::DigestSha256], &anon(), &ClientCapabilities::default());
        assert!(matches!(result, Err(NegotiationError::NoUsableMechanism)));
    }

    #[test]
    fn plain_payload_layout() {
        let mut client = select_client(&[Mechanism::Plain], &password(), &ClientCapabilities::default()).unwrap();
        assert_eq!(client.initial_response().unwrap(), b"\0alice\0secret".to_vec());
    }

    #[test]
    fn digest_reply_matches_server_formula() {
        let mut client =
            select_client(&[Mechanism::DigestSha256], &password(), &ClientCapabilities::default()).unwrap();
        let reply = client.evaluate(b"realm=AppRealm,nonce=n1").unwrap();
        let reply = String::from_utf8(reply).unwrap();
        let expected = digest::response(&digest::a1("alice", "AppRealm", "secret"), "n1");
        assert_eq!(reply, format!("username=alice,response={expected}"));
    }
}
