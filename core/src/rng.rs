//! Random identifiers and codes.
//!
//! All codes (affiliate codes, reset codes, salts) flow through CodeRng.
//! Production seeds it from the OS; tests seed it so generated codes are
//! reproducible.

use rand::{Rng, RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// Alphabet for affiliate codes.
pub const AFFILIATE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Alphabet for password reset codes.
pub const RESET_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub struct CodeRng {
    inner: Pcg64Mcg,
}

impl CodeRng {
    pub fn from_entropy() -> Self {
        Self { inner: Pcg64Mcg::from_entropy() }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { inner: Pcg64Mcg::seed_from_u64(seed) }
    }

    /// Draw `len` characters uniformly from `alphabet`.
    pub fn code(&mut self, alphabet: &[u8], len: usize) -> String {
        assert!(!alphabet.is_empty(), "alphabet must not be empty");
        (0..len)
            .map(|_| alphabet[self.inner.gen_range(0..alphabet.len())] as char)
            .collect()
    }

    /// A v4 uuid built from this stream, prefixed like `course_<uuid>`.
    pub fn prefixed_uuid(&mut self, prefix: &str) -> String {
        let mut bytes = [0u8; 16];
        self.inner.fill_bytes(&mut bytes);
        let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
        format!("{prefix}_{id}")
    }

    pub fn salt(&mut self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        self.inner.fill_bytes(&mut bytes);
        bytes
    }
}
