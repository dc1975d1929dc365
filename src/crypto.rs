//! Randomness, digests and credential formats shared by the panel and the agent.

use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Prefix carried by every API key.
pub const API_KEY_PREFIX: &str = "birdactyl_";

/// Random bytes behind the public half of a node token (16 hex chars).
pub const NODE_TOKEN_ID_BYTES: usize = 8;

/// Random bytes behind the secret half of a node token (64 hex chars).
pub const NODE_TOKEN_SECRET_BYTES: usize = 32;

/// Fill `len` bytes from the thread-local CSPRNG and hex-encode them (lowercase).
#[must_use]
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    hex::encode(bytes)
}

/// Lowercase hex SHA-256 of `input`.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare two byte strings without short-circuiting on the first difference.
///
/// Only equal-length inputs are compared in constant time. A length mismatch
/// returns false immediately, so callers compare fixed-length digests.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// A freshly minted `<token_id>.<secret>` pair.
#[derive(Debug, Clone)]
pub struct NodeToken {
    pub token_id: String,
    pub secret: String,
}

impl NodeToken {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            token_id: random_hex(NODE_TOKEN_ID_BYTES),
            secret: random_hex(NODE_TOKEN_SECRET_BYTES),
        }
    }

    /// Wire form: `<16 hex>.<64 hex>`.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        format!("{}.{}", self.token_id, self.secret)
    }

    #[must_use]
    pub fn secret_hash(&self) -> String {
        sha256_hex(&self.secret)
    }
}

/// Split a presented node credential on the first `.`.
#[must_use]
pub fn split_node_token(raw: &str) -> Option<(&str, &str)> {
    raw.split_once('.')
}

/// True when `value` is exactly `len` lowercase hex characters.
#[must_use]
pub fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_has_expected_length_and_alphabet() {
        let value = random_hex(32);
        assert!(is_lower_hex(&value, 64));
        assert_ne!(value, random_hex(32));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn node_token_wire_format() {
        let token = NodeToken::generate();
        let wire = token.to_header_value();
        assert_eq!(wire.len(), 81);
        let (id, secret) = split_node_token(&wire).unwrap();
        assert!(is_lower_hex(id, 16));
        assert!(is_lower_hex(secret, 64));
        assert_eq!(token.secret_hash(), sha256_hex(secret));
    }

    #[test]
    fn split_uses_first_separator() {
        assert_eq!(split_node_token("a.b.c"), Some(("a", "b.c")));
        assert_eq!(split_node_token("nodot"), None);
    }

    #[test]
    fn constant_time_eq_behaves_like_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"a"));
    }

    #[test]
    fn compared_digests_never_differ_in_length() {
        let short = sha256_hex("");
        let long = sha256_hex(&"x".repeat(4096));
        assert_eq!(short.len(), long.len());
        assert!(!constant_time_eq(short.as_bytes(), long.as_bytes()));
        assert!(constant_time_eq(long.as_bytes(), sha256_hex(&"x".repeat(4096)).as_bytes()));
    }
}
