//! Hash helpers for the DIGEST-SHA-256 exchange.
//!
//! `a1 = H(user:realm:password)` is what pre-hashed realms store;
//! the client proves knowledge of it with `H(a1:nonce)`.

use rand::RngCore;
use sha2::{Digest, Sha256};

pub fn a1(user: &str, realm: &str, password: &str) -> String {
    hex::encode(Sha256::digest(format!("{user}:{realm}:{password}").as_bytes()))
}

pub fn response(a1: &str, nonce: &str) -> String {
    hex::encode(Sha256::digest(format!("{a1}:{nonce}").as_bytes()))
}

/// Compare two secrets without stopping at the first differing byte.
/// Only the length may leak.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Fresh random nonce, hex-encoded.
pub fn nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Parse `key=value,key=value` directives.
pub(crate) fn parse_directives(raw: &str) -> Vec<(&str, &str)> {
    raw.split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

pub(crate) fn directive<'a>(directives: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    directives.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a1_depends_on_every_part() {
        let base = a1("alice", "AppRealm", "secret");
        assert_eq!(base.len(), 64);
        assert_ne!(base, a1("alice", "OtherRealm", "secret"));
        assert_ne!(base, a1("alice", "AppRealm", "Secret"));
        assert_ne!(response(&base, "n1"), response(&base, "n2"));
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        let expected = response(&a1("alice", "AppRealm", "secret"), "n1");
        assert!(constant_time_eq(expected.as_bytes(), expected.as_bytes()));

        let mut flipped = expected.clone().into_bytes();
        flipped[63] = if flipped[63] == b'0' { b'1' } else { b'0' };
        assert!(!constant_time_eq(expected.as_bytes(), &flipped));
        assert!(!constant_time_eq(expected.as_bytes(), &expected.as_bytes()[..63]));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(nonce(), nonce());
    }

    #[test]
    fn directives_parse() {
        let d = parse_directives("realm=AppRealm, nonce=abc");
        assert_eq!(directive(&d, "realm"), Some("AppRealm"));
        assert_eq!(directive(&d, "nonce"), Some("abc"));
        assert_eq!(directive(&d, "missing"), None);
    }
}
