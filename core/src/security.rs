//! Password hashing and IP anonymisation.

use crate::{
    error::{NexoError, NexoResult},
    rng::CodeRng,
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use sha2::{Digest, Sha256};

/// Argon2id PHC string for `password`.
pub fn hash_password(rng: &mut CodeRng, password: &str) -> NexoResult<String> {
    let salt = SaltString::encode_b64(&rng.salt())
        .map_err(|e| NexoError::Internal(format!("salt encoding failed: {e}")))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| NexoError::Internal(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// False for a wrong password and for an unparsable stored hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            log::warn!("stored password hash is not a valid PHC string: {e}");
            false
        }
    }
}

/// `sha256("{salt}:{ip}")` as lowercase hex. An empty IP hashes to "".
pub fn hash_ip(salt: &str, ip: &str) -> String {
    if ip.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(format!("{salt}:{ip}").as_bytes());
    format!("{digest:x}")
}
