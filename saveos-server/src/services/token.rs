//! Agent bearer tokens.
//!
//! Tokens are 32 random bytes, URL-safe base64 encoded. Only the SHA-256 hex
//! digest is persisted; the plaintext is handed to the agent once.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

const TOKEN_BYTES: usize = 32;

/// A freshly generated token and the digest to store for it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub plaintext: String,
    pub hash: String,
}

pub fn issue() -> IssuedToken {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    let plaintext = URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash(&plaintext);
    IssuedToken { plaintext, hash }
}

pub fn hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Recomputes the digest of `presented` and compares it with `stored_hash`
/// without short-circuiting on the first differing byte.
pub fn verify(presented: &str, stored_hash: &str) -> bool {
    let computed = hash(presented);
    if computed.len() != stored_hash.len() {
        return false;
    }
    computed
        .bytes()
        .zip(stored_hash.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_against_its_hash() {
        let token = issue();
        assert!(verify(&token.plaintext, &token.hash));
        assert_eq!(token.hash, hash(&token.plaintext));
    }

    #[test]
    fn other_tokens_do_not_verify() {
        let token = issue();
        let other = issue();
        assert_ne!(token.plaintext, other.plaintext);
        assert!(!verify(&other.plaintext, &token.hash));
        assert!(!verify("", &token.hash));
        assert!(!verify(&token.plaintext, "short"));
    }

    #[test]
    fn token_is_url_safe_with_full_entropy() {
        let token = issue();
        // 32 bytes -> 43 base64 characters without padding
        assert_eq!(token.plaintext.len(), 43);
        assert!(token
            .plaintext
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(token.hash.len(), 64);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash("abc"), hash("abc"));
        assert_eq!(
            hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("bearer  abc "), Some("abc"));
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("abc"), None);
    }
}
