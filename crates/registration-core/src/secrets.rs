//! Attempt-scoped secrets.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use secrecy::SecretString;

/// Entropy in the push server password.
pub const PASSWORD_BYTES: usize = 18;

/// Entropy in the signaling key.
pub const SIGNALING_KEY_BYTES: usize = 52;

/// Upper bound for registration ids.
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// `byte_len` random bytes, base64 encoded.
pub fn generate_secret(byte_len: usize) -> SecretString {
    let mut bytes = vec![0u8; byte_len];
    OsRng.fill_bytes(&mut bytes);
    SecretString::new(STANDARD.encode(&bytes))
}

/// Random registration id in `1..=16380`.
pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=MAX_REGISTRATION_ID)
}
