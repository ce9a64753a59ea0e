//! Keyed SHA-256 body hash carried in the `HashSHA256` header.
//!
//! The hash is `sha256(key || body)` rendered as lowercase hex. Both agent
//! and server compute it over the exact bytes sent on the wire.

use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Header holding the body hash on requests and responses.
pub const HASH_HEADER: &str = "HashSHA256";

pub fn sign(body: &[u8], key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(body);
    let digest = hasher.finalize();

    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Checks `signature` against the hash of `body`, comparing every byte
/// regardless of where the first mismatch is.
pub fn verify(body: &[u8], key: &str, signature: &str) -> bool {
    let expected = sign(body, key);
    let given = signature.trim().to_ascii_lowercase();
    constant_time_eq(expected.as_bytes(), given.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
