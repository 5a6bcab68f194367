//! Scan and claim token generation.

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generates a 256-bit random token encoded as base64url (43 characters).
pub fn generate_token() -> String {
    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Hex SHA-256 of a raw claim token. Only the hash is ever persisted.
pub fn hash_claim_token(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}
