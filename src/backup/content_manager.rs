//! Content block manager.
//!
//! Writes are content-addressed: the block id is `prefix || hex(digest)`,
//! where `digest` is `HMAC-SHA256(hmac_secret, plaintext)` when the
//! repository is keyed, or an unkeyed `MD5(plaintext)` in the
//! no-encryption test mode (kept short and explicitly "test mode" so no
//! one mistakes it for the real scheme). Writing identical plaintext
//! twice therefore always yields the same id and performs at most one
//! storage `put`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use openssl::hash::{hash, MessageDigest};

use crate::error::{KopiaError, Result};

use super::block_codec;
use super::crypt_config::CryptConfig;
use super::storage::Storage;

pub const PACK_INDEX_BLOB: &str = "PACKINDEX";

#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub length: u64,
    pub pack_block_id: Option<String>,
    pub pack_offset: Option<u64>,
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct PackEntry {
    pack_id: String,
    offset: u64,
    length: u64,
}

struct PackBuilder {
    buffer: Vec<u8>,
    members: Vec<(String, u64, u64)>,
}

impl PackBuilder {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            members: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Encrypts, hashes, writes, reads, packs and indexes storage blocks.
pub struct ContentManager {
    storage: Arc<dyn Storage>,
    crypt: Option<Arc<CryptConfig>>,
    compress: bool,
    max_pack_size: usize,
    pack_builder: Mutex<PackBuilder>,
    pack_index: Mutex<HashMap<String, PackEntry>>,
}

impl ContentManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        crypt: Option<Arc<CryptConfig>>,
        compress: bool,
        max_pack_size: usize,
    ) -> Result<Self> {
        let pack_index = match storage.get(PACK_INDEX_BLOB, 0, -1) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| KopiaError::Malformed(format!("pack index: {}", e)))?,
            Err(KopiaError::BlockNotFound(_)) => HashMap::new(),
            Err(err) => return Err(err),
        };

        Ok(Self {
            storage,
            crypt,
            compress,
            max_pack_size,
            pack_builder: Mutex::new(PackBuilder::new()),
            pack_index: Mutex::new(pack_index),
        })
    }

    fn digest(&self, data: &[u8]) -> Result<String> {
        match &self.crypt {
            Some(crypt) => Ok(hex::encode(crypt.content_address(data)?)),
            None => {
                let digest = hash(MessageDigest::md5(), data)?;
                Ok(hex::encode(digest))
            }
        }
    }

    /// Stores `data`, returning `prefix || hex(digest)`. A second write of
    /// the same plaintext returns the same id and performs no extra I/O.
    pub fn write_block(&self, data: &[u8], prefix: &str) -> Result<String> {
        let block_id = format!("{}{}", prefix, self.digest(data)?);

        if self.block_info(&block_id)?.is_some() {
            return Ok(block_id);
        }

        let encoded = block_codec::encode(data, self.crypt.as_deref(), self.compress)?;

        if encoded.len() >= self.max_pack_size / 4 {
            // Large enough to stand on its own; skip the pack path.
            self.storage.put(&block_id, &encoded)?;
            return Ok(block_id);
        }

        let mut builder = self.pack_builder.lock().unwrap();
        let offset = builder.buffer.len() as u64;
        builder.buffer.extend_from_slice(&encoded);
        builder.members.push((block_id.clone(), offset, encoded.len() as u64));

        if builder.buffer.len() >= self.max_pack_size {
            self.flush_pack_locked(&mut builder)?;
        }

        Ok(block_id)
    }

    fn flush_pack_locked(&self, builder: &mut PackBuilder) -> Result<()> {
        if builder.is_empty() {
            return Ok(());
        }
        let pack_digest = hash(MessageDigest::sha256(), &builder.buffer)?;
        let pack_id = format!("P{}", hex::encode(pack_digest));
        self.storage.put(&pack_id, &builder.buffer)?;

        let mut index = self.pack_index.lock().unwrap();
        for (block_id, offset, length) in builder.members.drain(..) {
            index.insert(
                block_id,
                PackEntry {
                    pack_id: pack_id.clone(),
                    offset,
                    length,
                },
            );
        }
        drop(index);

        builder.buffer.clear();
        self.persist_pack_index()
    }

    fn persist_pack_index(&self) -> Result<()> {
        let index = self.pack_index.lock().unwrap();
        let serialized = serde_json::to_vec(&*index)
            .map_err(|e| KopiaError::Malformed(format!("pack index: {}", e)))?;
        drop(index);
        self.storage.put(PACK_INDEX_BLOB, &serialized)
    }

    /// Finalizes any pending pack.
    pub fn flush(&self) -> Result<()> {
        let mut builder = self.pack_builder.lock().unwrap();
        self.flush_pack_locked(&mut builder)
    }

    pub fn block_info(&self, block_id: &str) -> Result<Option<BlockInfo>> {
        {
            let builder = self.pack_builder.lock().unwrap();
            if let Some((_, _, length)) = builder.members.iter().find(|(id, _, _)| id == block_id) {
                return Ok(Some(BlockInfo {
                    length: *length,
                    pack_block_id: None,
                    pack_offset: None,
                }));
            }
        }

        if let Some(entry) = self.pack_index.lock().unwrap().get(block_id) {
            return Ok(Some(BlockInfo {
                length: entry.length,
                pack_block_id: Some(entry.pack_id.clone()),
                pack_offset: Some(entry.offset),
            }));
        }

        match self.storage.list(block_id) {
            Ok(listed) if listed.iter().any(|b| b.id == block_id) => {
                let meta = listed.into_iter().find(|b| b.id == block_id).unwrap();
                Ok(Some(BlockInfo {
                    length: meta.length,
                    pack_block_id: None,
                    pack_offset: None,
                }))
            }
            Ok(_) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Reads and decrypts a previously written block.
    pub fn get_block(&self, block_id: &str) -> Result<Vec<u8>> {
        let raw = {
            // A block not yet flushed out of the in-progress pack buffer is
            // still readable directly from the builder.
            let builder = self.pack_builder.lock().unwrap();
            let direct = builder
                .members
                .iter()
                .find(|(id, _, _)| id == block_id)
                .map(|(_, offset, length)| {
                    builder.buffer[*offset as usize..(*offset + *length) as usize].to_vec()
                });
            drop(builder);
            match direct {
                Some(bytes) => bytes,
                None => {
                    let entry = self.pack_index.lock().unwrap().get(block_id).cloned();
                    match entry {
                        Some(entry) => self.storage.get(
                            &entry.pack_id,
                            entry.offset as i64,
                            entry.length as i64,
                        )?,
                        None => self.storage.get(block_id, 0, -1)?,
                    }
                }
            }
        };

        block_codec::decode(&raw, self.crypt.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::storage::MemoryStorage;

    fn manager(crypt: Option<Arc<CryptConfig>>) -> ContentManager {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        ContentManager::new(storage, crypt, false, 1 << 20).unwrap()
    }

    #[test]
    fn scenario_tiny_blob_test_vector() {
        let mgr = manager(None);
        let id = mgr
            .write_block(b"the quick brown fox jumps over the lazy dog", "X")
            .unwrap();
        assert_eq!(id, "X77add1d5f41223d5582fca736a5cb335");
        assert_eq!(
            mgr.get_block(&id).unwrap(),
            b"the quick brown fox jumps over the lazy dog"
        );
    }

    #[test]
    fn dedup_on_second_write() {
        let mgr = manager(None);
        let id1 = mgr.write_block(b"duplicate payload", "D").unwrap();
        let id2 = mgr.write_block(b"duplicate payload", "D").unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn encrypted_roundtrip_and_packing() {
        let crypt = Arc::new(CryptConfig::generate().unwrap());
        let mgr = manager(Some(crypt));
        let mut ids = Vec::new();
        for i in 0..20u8 {
            let data = vec![i; 100];
            ids.push(mgr.write_block(&data, "D").unwrap());
        }
        mgr.flush().unwrap();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(mgr.get_block(id).unwrap(), vec![i as u8; 100]);
        }
    }

    #[test]
    fn missing_block_errors() {
        let mgr = manager(None);
        assert!(mgr.get_block("Dmissingmissingmissingmissingmis").is_err());
    }
}
