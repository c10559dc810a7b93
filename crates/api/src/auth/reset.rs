//! Password reset tokens
//!
//! Tokens are handed to the user once; the store only ever sees their SHA-256 digest.

use argon2::password_hash::rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use time::Duration;

/// How long a reset token stays usable
pub const RESET_TOKEN_TTL: Duration = Duration::hours(1);

/// 32 random bytes, hex encoded
pub fn new_reset_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn reset_token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
