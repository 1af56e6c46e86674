//! Server side of each mechanism exchange.
//!
//! Each server is a small state machine driven by the peer's responses. It
//! asks its verifier two separate questions: first "are these credentials
//! valid" and then "may this identity act as the requested one".

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use rand::RngCore;

use crate::realm::{Callback, CallbackHandler};
use crate::sasl::{digest, AuthenticatedIdentity, Mechanism, NegotiationError, ANONYMOUS_IDENTITY};

/// Result of evaluating one peer message.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Challenge(Vec<u8>),
    Complete(AuthenticatedIdentity),
}

pub trait MechanismServer: Send {
    fn mechanism(&self) -> Mechanism;

    fn evaluate(&mut self, response: &[u8]) -> Result<Step, NegotiationError>;
}

fn authorize(
    verifier: &dyn CallbackHandler,
    mechanism: Mechanism,
    authentication_id: String,
    authorization_id: String,
) -> Result<AuthenticatedIdentity, NegotiationError> {
    let mut cbs = [Callback::authorize(authentication_id.clone(), authorization_id.clone())];
    verifier.handle(&mut cbs)?;
    match cbs[0] {
        Callback::Authorize {
            authorized: Some(true), ..
        } => Ok(AuthenticatedIdentity {
            mechanism,
            authentication_id,
            authorization_id,
        }),
        _ => Err(NegotiationError::NotAuthorized {
            authentication_id,
            authorization_id,
        }),
    }
}

fn utf8<'a>(bytes: &'a [u8], what: &'static str) -> Result<&'a str, NegotiationError> {
    std::str::from_utf8(bytes).map_err(|_| NegotiationError::Malformed(what))
}

/// Empty authorization id means "same as authentication id".
fn or_self(authorization_id: &str, authentication_id: &str) -> String {
    if authorization_id.is_empty() {
        authentication_id.to_string()
    } else {
        authorization_id.to_string()
    }
}

pub struct AnonymousServer {
    verifier: Arc<dyn CallbackHandler>,
    complete: bool,
}

impl AnonymousServer {
    pub fn new(verifier: Arc<dyn CallbackHandler>) -> Self {
        Self {
            verifier,
            complete: false,
        }
    }
}

impl MechanismServer for AnonymousServer {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Anonymous
    }

    fn evaluate(&mut self, response: &[u8]) -> Result<Step, NegotiationError> {
        if self.complete {
            return Err(NegotiationError::AlreadyComplete(Mechanism::Anonymous));
        }
        self.verifier.handle(&mut [])?;
        self.complete = true;
        tracing::debug!(trace = %String::from_utf8_lossy(response), "Anonymous login");
        Ok(Step::Complete(AuthenticatedIdentity {
            mechanism: Mechanism::Anonymous,
            authentication_id: ANONYMOUS_IDENTITY.to_string(),
            authorization_id: ANONYMOUS_IDENTITY.to_string(),
        }))
    }
}

/// `authzid NUL authcid NUL password`
pub struct PlainServer {
    verifier: Arc<dyn CallbackHandler>,
    complete: bool,
}

impl PlainServer {
    pub fn new(verifier: Arc<dyn CallbackHandler>) -> Self {
        Self {
            verifier,
            complete: false,
        }
    }
}

impl MechanismServer for PlainServer {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Plain
    }

    fn evaluate(&mut self, response: &[u8]) -> Result<Step, NegotiationError> {
        if self.complete {
            return Err(NegotiationError::AlreadyComplete(Mechanism::Plain));
        }
        let parts: Vec<&[u8]> = response.split(|b| *b == 0).collect();
        let [authz, authc, password] = parts.as_slice() else {
            return Err(NegotiationError::Malformed("PLAIN"));
        };
        let authz = utf8(authz, "PLAIN")?;
        let authc = utf8(authc, "PLAIN")?;
        let password = utf8(password, "PLAIN")?;
        if authc.is_empty() {
            return Err(NegotiationError::Malformed("PLAIN"));
        }

        let mut cbs = [
            Callback::name(authc),
            Callback::VerifyPassword {
                password: password.to_string(),
                verified: None,
            },
        ];
        self.verifier.handle(&mut cbs)?;
        if !matches!(cbs[1], Callback::VerifyPassword { verified: Some(true), .. }) {
            return Err(NegotiationError::AuthenticationFailed(authc.to_string()));
        }

        self.complete = true;
        let identity = authorize(
            self.verifier.as_ref(),
            Mechanism::Plain,
            authc.to_string(),
            or_self(authz, authc),
        )?;
        Ok(Step::Complete(identity))
    }
}

/// Challenge/response over `H(H(user:realm:password):nonce)`.
pub struct DigestServer {
    verifier: Arc<dyn CallbackHandler>,
    realm: String,
    pre_hashed: bool,
    nonce: Option<String>,
    complete: bool,
}

impl DigestServer {
    pub fn new(verifier: Arc<dyn CallbackHandler>, realm: String, pre_hashed: bool) -> Self {
        Self {
            verifier,
            realm,
            pre_hashed,
            nonce: None,
            complete: false,
        }
    }
}

impl MechanismServer for DigestServer {
    fn mechanism(&self) -> Mechanism {
        Mechanism::DigestSha256
    }

    fn evaluate(&mut self, response: &[u8]) -> Result<Step, NegotiationError> {
        if self.complete {
            return Err(NegotiationError::AlreadyComplete(Mechanism::DigestSha256));
        }
        let Some(nonce) = self.nonce.clone() else {
            let nonce = digest::nonce();
            let challenge = format!("realm={},nonce={}", self.realm, nonce);
            self.nonce = Some(nonce);
            return Ok(Step::Challenge(challenge.into_bytes()));
        };

        let raw = utf8(response, "DIGEST-SHA-256")?;
        let directives = digest::parse_directives(raw);
        let user = digest::directive(&directives, "username").ok_or(NegotiationError::Malformed("DIGEST-SHA-256"))?;
        let client_response =
            digest::directive(&directives, "response").ok_or(NegotiationError::Malformed("DIGEST-SHA-256"))?;
        let authz = digest::directive(&directives, "authzid").unwrap_or("");

        let credential = if self.pre_hashed {
            Callback::DigestHash { hash: None }
        } else {
            Callback::Password { password: None }
        };
        let mut cbs = [
            Callback::name(user),
            Callback::RealmName {
                realm: self.realm.clone(),
            },
            credential,
        ];
        self.verifier.handle(&mut cbs)?;

        let a1 = match &cbs[2] {
            Callback::DigestHash { hash: Some(hash) } => hash.clone(),
            Callback::Password { password: Some(pw) } => digest::a1(user, &self.realm, pw),
            _ => return Err(NegotiationError::AuthenticationFailed(user.to_string())),
        };
        if !digest::constant_time_eq(digest::response(&a1, &nonce).as_bytes(), client_response.as_bytes()) {
            return Err(NegotiationError::AuthenticationFailed(user.to_string()));
        }

        self.complete = true;
        let identity = authorize(
            self.verifier.as_ref(),
            Mechanism::DigestSha256,
            user.to_string(),
            or_self(authz, user),
        )?;
        Ok(Step::Complete(identity))
    }
}

/// Proves same-machine access by asking the peer to read a token file.
pub struct LocalUserServer {
    verifier: Arc<dyn CallbackHandler>,
    default_user: String,
    challenge_dir: PathBuf,
    authorization_id: String,
    token: Option<(PathBuf, String)>,
    complete: bool,
}

impl LocalUserServer {
    pub fn new(verifier: Arc<dyn CallbackHandler>, default_user: String, challenge_dir: PathBuf) -> Self {
        Self {
            verifier,
            default_user,
            challenge_dir,
            authorization_id: String::new(),
            token: None,
            complete: false,
        }
    }

    fn write_token(&self) -> std::io::Result<(PathBuf, String)> {
        std::fs::create_dir_all(&self.challenge_dir)?;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let path = self
            .challenge_dir
            .join(format!("challenge-{}", uuid::Uuid::new_v4()));

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(token.as_bytes())?;
        Ok((path, token))
    }
}

impl MechanismServer for LocalUserServer {
    fn mechanism(&self) -> Mechanism {
        Mechanism::LocalUser
    }

    fn evaluate(&mut self, response: &[u8]) -> Result<Step, NegotiationError> {
        if self.complete {
            return Err(NegotiationError::AlreadyComplete(Mechanism::LocalUser));
        }
        let Some((path, token)) = self.token.take() else {
            self.authorization_id = utf8(response, "JBOSS-LOCAL-USER")?.to_string();
            let (path, token) = self.write_token().map_err(NegotiationError::LocalChallenge)?;
            let challenge = path.display().to_string().into_bytes();
            self.token = Some((path, token));
            return Ok(Step::Challenge(challenge));
        };

        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!(path = %path.display(), error = %e, "Challenge file already gone");
        }
        if !digest::constant_time_eq(response, token.as_bytes()) {
            return Err(NegotiationError::AuthenticationFailed(self.default_user.clone()));
        }

        let mut cbs = [Callback::Name {
            default: Some(self.default_user.clone()),
            name: None,
        }];
        self.verifier.handle(&mut cbs)?;

        self.complete = true;
        let identity = authorize(
            self.verifier.as_ref(),
            Mechanism::LocalUser,
            self.default_user.clone(),
            or_self(&self.authorization_id, &self.default_user),
        )?;
        Ok(Step::Complete(identity))
    }
}

impl Drop for LocalUserServer {
    fn drop(&mut self) {
        if let Some((path, _)) = self.token.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Authenticates the peer by the certificate it presented during TLS.
pub struct ExternalServer {
    verifier: Arc<dyn CallbackHandler>,
    peer_identity: Option<String>,
    complete: bool,
}

impl ExternalServer {
    pub fn new(verifier: Arc<dyn CallbackHandler>, peer_identity: Option<String>) -> Self {
        Self {
            verifier,
            peer_identity,
            complete: false,
        }
    }
}

impl MechanismServer for ExternalServer {
    fn mechanism(&self) -> Mechanism {
        Mechanism::External
    }

    fn evaluate(&mut self, response: &[u8]) -> Result<Step, NegotiationError> {
        if self.complete {
            return Err(NegotiationError::AlreadyComplete(Mechanism::External));
        }
        let peer = self
            .peer_identity
            .clone()
            .ok_or_else(|| NegotiationError::AuthenticationFailed("<no client certificate>".to_string()))?;
        let authz = utf8(response, "EXTERNAL")?;

        self.complete = true;
        let identity = authorize(self.verifier.as_ref(), Mechanism::External, peer.clone(), or_self(authz, &peer))?;
        Ok(Step::Complete(identity))
    }
}
