//! Password-based master key derivation for the repository format block.

use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;

use crate::error::Result;

pub const KDF_SALT_SIZE: usize = 32;
pub const MASTER_KEY_SIZE: usize = 32;

/// KDF algorithms a format block may record. `None` exists only for
/// unencrypted test-mode repositories; a real password always uses
/// `Pbkdf2Sha256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KdfAlgorithm {
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256,
    None,
}

impl Default for KdfAlgorithm {
    fn default() -> Self {
        KdfAlgorithm::Pbkdf2Sha256
    }
}

pub const DEFAULT_KDF_ITERATIONS: usize = 600_000;

/// Derives a fixed-size key from `password` and `salt` using the configured
/// KDF. Wrong password silently yields a different key; detecting that is
/// the job of the decrypt-then-checksum step in the format block, never
/// the KDF itself.
pub fn derive_key(
    algorithm: KdfAlgorithm,
    password: &[u8],
    salt: &[u8],
    iterations: usize,
    key_len: usize,
) -> Result<Vec<u8>> {
    match algorithm {
        KdfAlgorithm::None => {
            let mut key = vec![0u8; key_len];
            let n = password.len().min(key_len);
            key[..n].copy_from_slice(&password[..n]);
            Ok(key)
        }
        KdfAlgorithm::Pbkdf2Sha256 => {
            let mut key = vec![0u8; key_len];
            pbkdf2_hmac(password, salt, iterations, MessageDigest::sha256(), &mut key)?;
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic() {
        let salt = [1u8; KDF_SALT_SIZE];
        let a = derive_key(KdfAlgorithm::Pbkdf2Sha256, b"hunter2", &salt, 10_000, 32).unwrap();
        let b = derive_key(KdfAlgorithm::Pbkdf2Sha256, b"hunter2", &salt, 10_000, 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn derive_key_differs_by_password() {
        let salt = [1u8; KDF_SALT_SIZE];
        let a = derive_key(KdfAlgorithm::Pbkdf2Sha256, b"hunter2", &salt, 10_000, 32).unwrap();
        let b = derive_key(KdfAlgorithm::Pbkdf2Sha256, b"hunter3", &salt, 10_000, 32).unwrap();
        assert_ne!(a, b);
    }
}
