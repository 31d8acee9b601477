//! Encryption and content-addressing primitives shared by the content
//! block manager and the format block.
//!
//! Every on-disk block is AES-256-GCM sealed; the HMAC secret also keys
//! the content address, so deriving a block's id and encrypting its
//! payload both come from the same master secret.

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rand::rand_bytes;
use openssl::sign::Signer;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};

use crate::error::{KopiaError, Result};

pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const DIGEST_SIZE: usize = 32;

/// The repository's content-encryption secrets, kept separate from the
/// password so content never needs re-encrypting on a password change.
pub struct CryptConfig {
    master_key: [u8; 32],
    hmac_secret: [u8; 32],
    hmac_key: PKey<openssl::pkey::Private>,
}

impl CryptConfig {
    pub fn new(master_key: [u8; 32], hmac_secret: [u8; 32]) -> Result<Self> {
        let hmac_key = PKey::hmac(&hmac_secret)?;
        Ok(Self {
            master_key,
            hmac_secret,
            hmac_key,
        })
    }

    pub fn generate() -> Result<Self> {
        let mut master_key = [0u8; 32];
        let mut hmac_secret = [0u8; 32];
        rand_bytes(&mut master_key)?;
        rand_bytes(&mut hmac_secret)?;
        Self::new(master_key, hmac_secret)
    }

    pub fn master_key(&self) -> &[u8; 32] {
        &self.master_key
    }

    pub fn hmac_secret(&self) -> &[u8; 32] {
        &self.hmac_secret
    }

    pub fn cipher(&self) -> Cipher {
        Cipher::aes_256_gcm()
    }

    /// Seals `plaintext`, returning `(iv, tag, ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; IV_SIZE], [u8; TAG_SIZE], Vec<u8>)> {
        let mut iv = [0u8; IV_SIZE];
        rand_bytes(&mut iv)?;
        let mut tag = [0u8; TAG_SIZE];
        let ciphertext = encrypt_aead(self.cipher(), &self.master_key, Some(&iv), &[], plaintext, &mut tag)?;
        Ok((iv, tag, ciphertext))
    }

    /// Reverses [`CryptConfig::encrypt`].
    pub fn decrypt(&self, iv: &[u8], tag: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        decrypt_aead(self.cipher(), &self.master_key, Some(iv), &[], ciphertext, tag)
            .map_err(|_| KopiaError::InvalidChecksum)
    }

    /// HMAC-SHA256 signer keyed by the repository's HMAC secret, used both
    /// to compute content addresses and to sign/verify plaintext payloads.
    pub fn signer(&self) -> Result<Signer<'_>> {
        Ok(Signer::new(MessageDigest::sha256(), &self.hmac_key)?)
    }

    /// HMAC-SHA256 of `data` under the repository secret: equal content
    /// always yields equal address.
    pub fn content_address(&self, data: &[u8]) -> Result<[u8; DIGEST_SIZE]> {
        let mut signer = self.signer()?;
        signer.update(data)?;
        let mut out = [0u8; DIGEST_SIZE];
        let written = signer.sign(&mut out)?;
        debug_assert_eq!(written, DIGEST_SIZE);
        Ok(out)
    }
}
