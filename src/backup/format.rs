//! Format block.
//!
//! The format block is the repository's self-describing header: a
//! password-derived wrapping key protects a randomly generated master key
//! and HMAC secret (so changing the password never requires re-encrypting
//! content), framed with a length prefix and a SHA-256 checksum so a
//! corrupted or padded copy of the blob can still be located and verified.

use openssl::hash::{hash, MessageDigest};
use openssl::rand::rand_bytes;
use serde::{Deserialize, Serialize};

use crate::error::{KopiaError, Result};

use super::chunker::ChunkerConfig;
use super::crypt_config::CryptConfig;
use super::key_derivation::{derive_key, KdfAlgorithm, DEFAULT_KDF_ITERATIONS, KDF_SALT_SIZE};
use super::storage::Storage;

pub const FORMAT_BLOB_NAME: &str = "kopia.repository";
const MAGIC: [u8; 8] = *b"KOPIAFMT";
const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The encrypted payload carried by the format block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryOptions {
    pub hash_algorithm: String,
    pub encryption_algorithm: String,
    pub hmac_secret: [u8; 32],
    pub master_key: [u8; 32],
    pub max_pack_size: usize,
    pub chunker: ChunkerConfig,
}

impl RepositoryOptions {
    pub fn crypt_config(&self) -> Result<CryptConfig> {
        CryptConfig::new(self.master_key, self.hmac_secret)
    }
}

/// Parameters a caller may pin for deterministic tests; anything left as
/// `None` is generated randomly.
#[derive(Default)]
pub struct InitializeOptions {
    pub unique_id: Option<[u8; 32]>,
    pub master_key: Option<[u8; 32]>,
    pub hmac_secret: Option<[u8; 32]>,
    pub max_pack_size: usize,
    pub chunker: ChunkerConfig,
    pub kdf_iterations: usize,
}

fn random_32() -> Result<[u8; 32]> {
    let mut buf = [0u8; 32];
    rand_bytes(&mut buf)?;
    Ok(buf)
}

/// The non-secret part of the format block: enough to re-derive the
/// wrapping key and to locate/validate the encrypted payload that follows.
pub struct FormatBlock {
    pub unique_id: [u8; 32],
    pub kdf: KdfAlgorithm,
    pub kdf_salt: Vec<u8>,
    pub kdf_iterations: usize,
    pub build_version: String,
}

/// Serializes the full format block: header, then `length(u16 BE) ||
/// iv(12) || tag(16) || ciphertext`, then `sha256(plaintext)`.
fn encode_format_block(header: &FormatBlock, wrapping_key: [u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let wrap = CryptConfig::new(wrapping_key, [0u8; 32])?;
    let (iv, tag, ciphertext) = wrap.encrypt(plaintext)?;
    let checksum = hash(MessageDigest::sha256(), plaintext)?;

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&header.unique_id);
    out.push(match header.kdf {
        KdfAlgorithm::Pbkdf2Sha256 => 1,
        KdfAlgorithm::None => 0,
    });
    out.push(header.kdf_salt.len() as u8);
    out.extend_from_slice(&header.kdf_salt);
    out.extend_from_slice(&(header.kdf_iterations as u32).to_be_bytes());
    out.extend_from_slice(&(header.build_version.len() as u16).to_be_bytes());
    out.extend_from_slice(header.build_version.as_bytes());

    let sealed_len = (iv.len() + tag.len() + ciphertext.len()) as u16;
    out.extend_from_slice(&sealed_len.to_be_bytes());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&checksum);

    Ok(out)
}

/// Fails if a format block already exists; otherwise generates the
/// repository's secrets, wraps them under the derived password key, and
/// writes the well-known blob.
pub fn initialize(storage: &dyn Storage, password: &[u8], options: InitializeOptions) -> Result<(FormatBlock, RepositoryOptions)> {
    if !storage.list(FORMAT_BLOB_NAME)?.is_empty() {
        return Err(KopiaError::AlreadyInitialized);
    }

    let unique_id = options.unique_id.map_or_else(random_32, Ok)?;
    let master_key = options.master_key.map_or_else(random_32, Ok)?;
    let hmac_secret = options.hmac_secret.map_or_else(random_32, Ok)?;
    let kdf_iterations = if options.kdf_iterations == 0 {
        DEFAULT_KDF_ITERATIONS
    } else {
        options.kdf_iterations
    };

    let mut salt = vec![0u8; KDF_SALT_SIZE];
    rand_bytes(&mut salt)?;
    let wrapping_key_bytes = derive_key(KdfAlgorithm::Pbkdf2Sha256, password, &salt, kdf_iterations, 32)?;
    let mut wrapping_key = [0u8; 32];
    wrapping_key.copy_from_slice(&wrapping_key_bytes);

    let repo_options = RepositoryOptions {
        hash_algorithm: "hmac-sha256".to_string(),
        encryption_algorithm: "aes-256-gcm".to_string(),
        hmac_secret,
        master_key,
        max_pack_size: if options.max_pack_size == 0 {
            1 << 20
        } else {
            options.max_pack_size
        },
        chunker: options.chunker,
    };

    let header = FormatBlock {
        unique_id,
        kdf: KdfAlgorithm::Pbkdf2Sha256,
        kdf_salt: salt,
        kdf_iterations,
        build_version: BUILD_VERSION.to_string(),
    };

    let plaintext = serde_json::to_vec(&repo_options).map_err(|e| KopiaError::Malformed(e.to_string()))?;
    let blob = encode_format_block(&header, wrapping_key, &plaintext)?;
    storage.put(FORMAT_BLOB_NAME, &blob)?;

    Ok((header, repo_options))
}

/// Opens an existing repository: reads the well-known blob and parses it
/// from offset zero (no recovery scan).
pub fn open(storage: &dyn Storage, password: &[u8]) -> Result<(FormatBlock, RepositoryOptions)> {
    let raw = match storage.get(FORMAT_BLOB_NAME, 0, -1) {
        Ok(raw) => raw,
        Err(KopiaError::BlockNotFound(_)) => return Err(KopiaError::NotInitialized),
        Err(err) => return Err(err),
    };
    if raw.get(..8) != Some(&MAGIC[..]) {
        return Err(KopiaError::FormatBlockNotFound);
    }
    try_parse_at(&raw, password)
}

/// Tolerant scan for the format block pattern inside `raw`, which may
/// carry arbitrary prefix/suffix padding.
pub fn recover_format_block(raw: &[u8], password: &[u8]) -> Result<(FormatBlock, RepositoryOptions)> {
    if raw.len() < MAGIC.len() {
        return Err(KopiaError::FormatBlockNotFound);
    }
    for start in 0..=raw.len() - MAGIC.len() {
        if raw[start..start + MAGIC.len()] != MAGIC {
            continue;
        }
        if let Ok(parsed) = try_parse_at(&raw[start..], password) {
            return Ok(parsed);
        }
    }
    Err(KopiaError::FormatBlockNotFound)
}

fn try_parse_at(raw: &[u8], password: &[u8]) -> Result<(FormatBlock, RepositoryOptions)> {
    let mut cursor = 0usize;
    let need = |cursor: usize, n: usize| -> Result<()> {
        if raw.len() < cursor + n {
            Err(KopiaError::Malformed("format block truncated".into()))
        } else {
            Ok(())
        }
    };

    need(cursor, MAGIC.len())?;
    cursor += MAGIC.len();

    need(cursor, 32)?;
    let mut unique_id = [0u8; 32];
    unique_id.copy_from_slice(&raw[cursor..cursor + 32]);
    cursor += 32;

    need(cursor, 1)?;
    let kdf = match raw[cursor] {
        1 => KdfAlgorithm::Pbkdf2Sha256,
        0 => KdfAlgorithm::None,
        _ => return Err(KopiaError::Malformed("unknown kdf tag".into())),
    };
    cursor += 1;

    need(cursor, 1)?;
    let salt_len = raw[cursor] as usize;
    cursor += 1;
    need(cursor, salt_len)?;
    let kdf_salt = raw[cursor..cursor + salt_len].to_vec();
    cursor += salt_len;

    need(cursor, 4)?;
    let kdf_iterations = u32::from_be_bytes(raw[cursor..cursor + 4].try_into().unwrap()) as usize;
    cursor += 4;

    need(cursor, 2)?;
    let version_len = u16::from_be_bytes(raw[cursor..cursor + 2].try_into().unwrap()) as usize;
    cursor += 2;
    need(cursor, version_len)?;
    let build_version = String::from_utf8(raw[cursor..cursor + version_len].to_vec())
        .map_err(|_| KopiaError::Malformed("build version not utf8".into()))?;
    cursor += version_len;

    need(cursor, 2)?;
    let sealed_len = u16::from_be_bytes(raw[cursor..cursor + 2].try_into().unwrap()) as usize;
    cursor += 2;
    if sealed_len < 12 + 16 {
        return Err(KopiaError::Malformed("sealed payload too short".into()));
    }
    need(cursor, sealed_len)?;
    let iv = &raw[cursor..cursor + 12];
    let tag = &raw[cursor + 12..cursor + 28];
    let ciphertext = &raw[cursor + 28..cursor + sealed_len];
    cursor += sealed_len;

    need(cursor, 32)?;
    let checksum = &raw[cursor..cursor + 32];

    let wrapping_key_bytes = derive_key(kdf, password, &kdf_salt, kdf_iterations, 32)?;
    let mut wrapping_key = [0u8; 32];
    wrapping_key.copy_from_slice(&wrapping_key_bytes);
    let wrap = CryptConfig::new(wrapping_key, [0u8; 32])?;

    let plaintext = wrap
        .decrypt(iv, tag, ciphertext)
        .map_err(|_| KopiaError::InvalidChecksum)?;

    let actual_checksum = hash(MessageDigest::sha256(), &plaintext)?;
    if actual_checksum.as_ref() != checksum {
        return Err(KopiaError::InvalidChecksum);
    }

    let repo_options: RepositoryOptions =
        serde_json::from_slice(&plaintext).map_err(|e| KopiaError::Malformed(e.to_string()))?;

    Ok((
        FormatBlock {
            unique_id,
            kdf,
            kdf_salt,
            kdf_iterations,
            build_version,
        },
        repo_options,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::storage::MemoryStorage;

    #[test]
    fn initialize_then_open_round_trip() {
        let storage = MemoryStorage::new();
        let (_, written) = initialize(
            &storage,
            b"correct horse battery staple",
            InitializeOptions {
                kdf_iterations: 100,
                ..Default::default()
            },
        )
        .unwrap();

        let (_, read) = open(&storage, b"correct horse battery staple").unwrap();
        assert_eq!(read.master_key, written.master_key);
        assert_eq!(read.hmac_secret, written.hmac_secret);
    }

    #[test]
    fn double_initialize_fails() {
        let storage = MemoryStorage::new();
        initialize(
            &storage,
            b"pw",
            InitializeOptions {
                kdf_iterations: 100,
                ..Default::default()
            },
        )
        .unwrap();
        let err = initialize(
            &storage,
            b"pw",
            InitializeOptions {
                kdf_iterations: 100,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, KopiaError::AlreadyInitialized));
    }

    #[test]
    fn open_without_initialize_fails() {
        let storage = MemoryStorage::new();
        let err = open(&storage, b"pw").unwrap_err();
        assert!(matches!(err, KopiaError::NotInitialized));
    }

    #[test]
    fn wrong_password_fails_at_decrypt() {
        let storage = MemoryStorage::new();
        initialize(
            &storage,
            b"right password",
            InitializeOptions {
                kdf_iterations: 100,
                ..Default::default()
            },
        )
        .unwrap();
        let err = open(&storage, b"wrong password").unwrap_err();
        assert!(matches!(err, KopiaError::InvalidChecksum));
    }

    #[test]
    fn recover_locates_block_despite_padding() {
        let storage = MemoryStorage::new();
        initialize(
            &storage,
            b"pw",
            InitializeOptions {
                kdf_iterations: 100,
                ..Default::default()
            },
        )
        .unwrap();
        let clean = storage.get(FORMAT_BLOB_NAME, 0, -1).unwrap();

        let mut padded = vec![0xAAu8; 37];
        padded.extend_from_slice(&clean);
        padded.extend_from_slice(&[0xBBu8; 61]);

        let (_, recovered) = recover_format_block(&padded, b"pw").unwrap();
        let (_, direct) = open(&storage, b"pw").unwrap();
        assert_eq!(recovered.master_key, direct.master_key);
    }

    #[test]
    fn recover_with_wrong_password_not_found() {
        let storage = MemoryStorage::new();
        initialize(
            &storage,
            b"pw",
            InitializeOptions {
                kdf_iterations: 100,
                ..Default::default()
            },
        )
        .unwrap();
        let clean = storage.get(FORMAT_BLOB_NAME, 0, -1).unwrap();
        let err = recover_format_block(&clean, b"not pw").unwrap_err();
        assert!(matches!(err, KopiaError::FormatBlockNotFound));
    }
}
