//! On-disk framing for a single storage block.
//!
//! A small header (magic + CRC32), then optional zstd compression and
//! optional authenticated encryption over the payload. The header is
//! written out field by field with explicit little-endian encoding
//! rather than a packed-struct transmute.

use crc32fast::Hasher as Crc32;

use crate::error::{KopiaError, Result};

use super::crypt_config::CryptConfig;

const MAGIC_PLAIN: [u8; 8] = *b"KPBLOB00";
const MAGIC_COMPRESSED: [u8; 8] = *b"KPBLOB01";
const MAGIC_ENCRYPTED: [u8; 8] = *b"KPBLOB02";
const MAGIC_ENCRYPTED_COMPRESSED: [u8; 8] = *b"KPBLOB03";

/// Encodes `plaintext` as a framed block: `magic(8) || crc32(4) ||
/// [iv(12) || tag(16)]? || payload`.
pub fn encode(plaintext: &[u8], config: Option<&CryptConfig>, compress: bool) -> Result<Vec<u8>> {
    let (magic, payload, iv_tag): (_, Vec<u8>, Option<([u8; 12], [u8; 16])>) = match config {
        Some(config) => {
            let body = if compress {
                zstd::stream::encode_all(plaintext, 0).map_err(KopiaError::Io)?
            } else {
                plaintext.to_vec()
            };
            let (iv, tag, ciphertext) = config.encrypt(&body)?;
            let magic = if compress {
                MAGIC_ENCRYPTED_COMPRESSED
            } else {
                MAGIC_ENCRYPTED
            };
            (magic, ciphertext, Some((iv, tag)))
        }
        None => {
            if compress {
                let body = zstd::stream::encode_all(plaintext, 0).map_err(KopiaError::Io)?;
                (MAGIC_COMPRESSED, body, None)
            } else {
                (MAGIC_PLAIN, plaintext.to_vec(), None)
            }
        }
    };

    let mut out = Vec::with_capacity(8 + 4 + 28 + payload.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&[0u8; 4]); // crc placeholder
    if let Some((iv, tag)) = iv_tag {
        out.extend_from_slice(&iv);
        out.extend_from_slice(&tag);
    }
    out.extend_from_slice(&payload);

    let mut hasher = Crc32::new();
    let crc_covered_start = 8 + 4;
    hasher.update(&out[crc_covered_start..]);
    let crc = hasher.finalize();
    out[8..12].copy_from_slice(&crc.to_le_bytes());

    Ok(out)
}

/// Reverses [`encode`].
pub fn decode(raw: &[u8], config: Option<&CryptConfig>) -> Result<Vec<u8>> {
    if raw.len() < 12 {
        return Err(KopiaError::Malformed("block shorter than header".into()));
    }
    let magic: [u8; 8] = raw[0..8].try_into().unwrap();
    let expected_crc = u32::from_le_bytes(raw[8..12].try_into().unwrap());

    let mut hasher = Crc32::new();
    hasher.update(&raw[12..]);
    if hasher.finalize() != expected_crc {
        return Err(KopiaError::InvalidChecksum);
    }

    match magic {
        MAGIC_PLAIN => Ok(raw[12..].to_vec()),
        MAGIC_COMPRESSED => zstd::stream::decode_all(&raw[12..]).map_err(KopiaError::Io),
        MAGIC_ENCRYPTED | MAGIC_ENCRYPTED_COMPRESSED => {
            let config = config.ok_or_else(|| {
                KopiaError::Other(anyhow::anyhow!("encrypted block but no crypt config supplied"))
            })?;
            if raw.len() < 12 + 12 + 16 {
                return Err(KopiaError::Malformed("encrypted block too small".into()));
            }
            let iv = &raw[12..24];
            let tag = &raw[24..40];
            let ciphertext = &raw[40..];
            let plaintext = config.decrypt(iv, tag, ciphertext)?;
            if magic == MAGIC_ENCRYPTED_COMPRESSED {
                zstd::stream::decode_all(&plaintext[..]).map_err(KopiaError::Io)
            } else {
                Ok(plaintext)
            }
        }
        _ => Err(KopiaError::Malformed("unknown block magic".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_roundtrip() {
        let encoded = encode(b"hello world", None, false).unwrap();
        assert_eq!(decode(&encoded, None).unwrap(), b"hello world");
    }

    #[test]
    fn compressed_roundtrip() {
        let data = vec![7u8; 10_000];
        let encoded = encode(&data, None, true).unwrap();
        assert!(encoded.len() < data.len());
        assert_eq!(decode(&encoded, None).unwrap(), data);
    }

    #[test]
    fn encrypted_roundtrip() {
        let config = CryptConfig::generate().unwrap();
        let encoded = encode(b"secret payload", Some(&config), false).unwrap();
        assert_eq!(decode(&encoded, Some(&config)).unwrap(), b"secret payload");
    }

    #[test]
    fn encrypted_compressed_roundtrip() {
        let config = CryptConfig::generate().unwrap();
        let data = vec![3u8; 20_000];
        let encoded = encode(&data, Some(&config), true).unwrap();
        assert_eq!(decode(&encoded, Some(&config)).unwrap(), data);
    }

    #[test]
    fn corrupted_crc_fails() {
        let mut encoded = encode(b"abc", None, false).unwrap();
        *encoded.last_mut().unwrap() ^= 0xff;
        assert!(matches!(decode(&encoded, None), Err(KopiaError::InvalidChecksum)));
    }

    #[test]
    fn decrypt_without_config_fails() {
        let config = CryptConfig::generate().unwrap();
        let encoded = encode(b"abc", Some(&config), false).unwrap();
        assert!(decode(&encoded, None).is_err());
    }
}
