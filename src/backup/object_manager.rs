//! Object manager.
//!
//! Assembles a byte stream into content-addressed chunks via a [`Chunker`],
//! produces indirect index objects once a logical object spans more than
//! one chunk, and exposes a seekable reader that reverses the process —
//! recursively resolving `Indirect`/`Section` object ids down to the
//! storage blocks that back them.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{KopiaError, Result};

use super::chunker::{Chunker, ChunkerConfig};
use super::content_manager::ContentManager;

/// Default kind-prefix for ordinary data chunks.
pub const DATA_PREFIX: &str = "D";
/// Kind-prefix used for stored indirect-index chunks.
pub const INDEX_PREFIX: &str = "I";

/// A tagged object identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectId {
    /// A single storage block, referenced by its block id (which already
    /// carries its own storage kind-prefix character, e.g. `"Dabc123.."`).
    Direct(String),
    /// The concatenation, in order, of the objects listed by `inner`.
    Indirect(Box<ObjectId>),
    /// A byte-range view into `base` (legacy, parsed but never produced by
    /// this implementation's writer).
    Section { start: u64, length: u64, base: Box<ObjectId> },
}

impl ObjectId {
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix('I') {
            return Ok(ObjectId::Indirect(Box::new(ObjectId::parse(rest)?)));
        }
        if let Some(rest) = s.strip_prefix('S') {
            let mut parts = rest.splitn(3, ',');
            let start: u64 = parts
                .next()
                .ok_or_else(|| KopiaError::Malformed("section: missing start".into()))?
                .parse()
                .map_err(|_| KopiaError::Malformed("section: bad start".into()))?;
            let length: u64 = parts
                .next()
                .ok_or_else(|| KopiaError::Malformed("section: missing length".into()))?
                .parse()
                .map_err(|_| KopiaError::Malformed("section: bad length".into()))?;
            let base = parts
                .next()
                .ok_or_else(|| KopiaError::Malformed("section: missing base".into()))?;
            return Ok(ObjectId::Section {
                start,
                length,
                base: Box::new(ObjectId::parse(base)?),
            });
        }
        if s.is_empty() {
            return Err(KopiaError::Malformed("empty object id".into()));
        }
        Ok(ObjectId::Direct(s.to_string()))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectId::Direct(id) => write!(f, "{}", id),
            ObjectId::Indirect(inner) => write!(f, "I{}", inner),
            ObjectId::Section { start, length, base } => {
                write!(f, "S{},{},{}", start, length, base)
            }
        }
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// One record of an indirect index stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndirectIndexEntry {
    #[serde(rename = "s")]
    pub start: u64,
    #[serde(rename = "l")]
    pub length: u64,
    #[serde(rename = "o")]
    pub object: ObjectId,
}

#[derive(Serialize, Deserialize)]
struct IndirectStreamHeader {
    stream: String,
}

const INDIRECT_STREAM_TAG: &str = "kopia:indirect";

/// Chunk size used when storing an indirect index's own JSON-lines stream.
/// Deliberately small (not the data chunker's own block size): an index
/// covering many entries must itself be able to split into further index
/// levels, recursing until a level's entry list fits in one block. A size
/// in the tens of kilobytes would let almost any realistic index collapse
/// into a single block, producing flat two-level indirection regardless of
/// how large the object actually is.
const INDEX_CHUNK_SIZE: usize = 400;

/// Writer options; the chunker config and prefix used for freshly stored
/// data blocks.
#[derive(Clone)]
pub struct ObjectWriterOptions {
    pub chunker: ChunkerConfig,
    pub prefix: String,
    pub compress: bool,
}

impl Default for ObjectWriterOptions {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            prefix: DATA_PREFIX.to_string(),
            compress: true,
        }
    }
}

/// Streaming object writer.
pub struct ObjectWriter {
    content_manager: Arc<ContentManager>,
    chunker: Chunker,
    prefix: String,
    compress: bool,
    pending: Vec<u8>,
    entries: Vec<IndirectIndexEntry>,
    total_written: u64,
}

impl ObjectWriter {
    pub fn new(content_manager: Arc<ContentManager>, options: ObjectWriterOptions) -> Self {
        Self {
            content_manager,
            chunker: Chunker::new(options.chunker),
            prefix: options.prefix,
            compress: options.compress,
            pending: Vec::new(),
            entries: Vec::new(),
            total_written: 0,
        }
    }

    fn flush_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let start = self.total_written;
        let length = chunk.len() as u64;
        let block_id = self.content_manager.write_block(&chunk, &self.prefix)?;
        self.entries.push(IndirectIndexEntry {
            start,
            length,
            object: ObjectId::Direct(block_id),
        });
        self.total_written += length;
        Ok(())
    }

    /// Feeds `bytes` through the chunker, storing each completed chunk.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut remaining = bytes;
        loop {
            let boundary = self.chunker.scan(remaining);
            if boundary == 0 {
                self.pending.extend_from_slice(remaining);
                return Ok(());
            }
            let (head, tail) = remaining.split_at(boundary);
            self.pending.extend_from_slice(head);
            let chunk = std::mem::take(&mut self.pending);
            self.flush_chunk(chunk)?;
            remaining = tail;
            if remaining.is_empty() {
                return Ok(());
            }
        }
    }

    /// Finalizes the object. `force_stored` requires the result to be an
    /// actually-stored object id (always true for this implementation,
    /// which has no inline representation).
    pub fn result(mut self, _force_stored: bool) -> Result<ObjectId> {
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            self.flush_chunk(chunk)?;
        }

        if self.entries.is_empty() {
            // Empty write: a single empty block.
            let block_id = self.content_manager.write_block(&[], &self.prefix)?;
            return Ok(ObjectId::Direct(block_id));
        }

        if self.entries.len() == 1 {
            return Ok(self.entries.remove(0).object);
        }

        let mut index_writer = ObjectWriter::new(
            self.content_manager.clone(),
            ObjectWriterOptions {
                chunker: ChunkerConfig::Fixed(INDEX_CHUNK_SIZE),
                prefix: INDEX_PREFIX.to_string(),
                compress: self.compress,
            },
        );
        let header = serde_json::to_vec(&IndirectStreamHeader {
            stream: INDIRECT_STREAM_TAG.to_string(),
        })
        .map_err(|e| KopiaError::Malformed(e.to_string()))?;
        index_writer.write(&header)?;
        index_writer.write(b"\n")?;
        for entry in &self.entries {
            let line = serde_json::to_vec(entry).map_err(|e| KopiaError::Malformed(e.to_string()))?;
            index_writer.write(&line)?;
            index_writer.write(b"\n")?;
        }
        let inner_id = index_writer.result(true)?;
        Ok(ObjectId::Indirect(Box::new(inner_id)))
    }
}

struct SeekEntry {
    start: u64,
    length: u64,
    object: ObjectId,
}

enum Opened {
    Direct(Vec<u8>),
    Indirect {
        entries: Vec<SeekEntry>,
        total_length: u64,
    },
    Section {
        offset: u64,
        length: u64,
        base: Box<Opened>,
    },
}

impl Opened {
    fn total_length(&self) -> u64 {
        match self {
            Opened::Direct(data) => data.len() as u64,
            Opened::Indirect { total_length, .. } => *total_length,
            Opened::Section { length, .. } => *length,
        }
    }
}

/// Facade gluing the chunker and content manager together; also the entry
/// point for opening objects for reading.
pub struct ObjectManager {
    content_manager: Arc<ContentManager>,
}

impl ObjectManager {
    pub fn new(content_manager: Arc<ContentManager>) -> Self {
        Self { content_manager }
    }

    pub fn new_writer(&self, options: ObjectWriterOptions) -> ObjectWriter {
        ObjectWriter::new(self.content_manager.clone(), options)
    }

    fn read_whole(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let mut reader = self.open(id)?;
        let mut buf = Vec::with_capacity(reader.len() as usize);
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn open_inner(&self, id: &ObjectId) -> Result<Opened> {
        match id {
            ObjectId::Direct(block_id) => {
                let data = self.content_manager.get_block(block_id)?;
                Ok(Opened::Direct(data))
            }
            ObjectId::Indirect(inner) => {
                let index_bytes = self.read_whole(inner)?;
                let mut lines = index_bytes.split(|&b| b == b'\n').filter(|l| !l.is_empty());
                let header_line = lines
                    .next()
                    .ok_or_else(|| KopiaError::Malformed("empty indirect index".into()))?;
                let header: IndirectStreamHeader = serde_json::from_slice(header_line)
                    .map_err(|e| KopiaError::Malformed(format!("indirect header: {}", e)))?;
                if header.stream != INDIRECT_STREAM_TAG {
                    return Err(KopiaError::Malformed("unexpected indirect stream tag".into()));
                }
                let mut entries = Vec::new();
                let mut expected_start = 0u64;
                for line in lines {
                    let entry: IndirectIndexEntry = serde_json::from_slice(line)
                        .map_err(|e| KopiaError::Malformed(format!("indirect entry: {}", e)))?;
                    if entry.start != expected_start {
                        return Err(KopiaError::Malformed(
                            "indirect index entries are not contiguous".into(),
                        ));
                    }
                    expected_start += entry.length;
                    entries.push(SeekEntry {
                        start: entry.start,
                        length: entry.length,
                        object: entry.object,
                    });
                }
                Ok(Opened::Indirect {
                    entries,
                    total_length: expected_start,
                })
            }
            ObjectId::Section { start, length, base } => {
                let base_opened = self.open_inner(base)?;
                Ok(Opened::Section {
                    offset: *start,
                    length: *length,
                    base: Box::new(base_opened),
                })
            }
        }
    }

    /// Opens a seekable reader over the logical bytes of `id`.
    pub fn open(&self, id: &ObjectId) -> Result<ObjectReader<'_>> {
        let opened = self.open_inner(id)?;
        Ok(ObjectReader {
            manager: self,
            opened,
            pos: 0,
        })
    }

    /// Reads through all indirection levels, asserting every entry's
    /// declared length matches what its child actually yields, and
    /// reports every storage block id touched.
    pub fn verify_object(&self, id: &ObjectId) -> Result<(u64, Vec<String>)> {
        let mut blocks = Vec::new();
        let length = self.verify_inner(id, &mut blocks)?;
        Ok((length, blocks))
    }

    fn verify_inner(&self, id: &ObjectId, blocks: &mut Vec<String>) -> Result<u64> {
        match id {
            ObjectId::Direct(block_id) => {
                let data = self.content_manager.get_block(block_id)?;
                blocks.push(block_id.clone());
                Ok(data.len() as u64)
            }
            ObjectId::Indirect(inner) => {
                let opened = self.open_inner(&ObjectId::Indirect(inner.clone()))?;
                let entries = match &opened {
                    Opened::Indirect { entries, .. } => entries,
                    _ => unreachable!(),
                };
                let mut total = 0u64;
                for entry in entries {
                    let actual = self.verify_inner(&entry.object, blocks)?;
                    if actual != entry.length {
                        return Err(KopiaError::InconsistentSize(format!(
                            "entry at {} declares length {} but child yields {}",
                            entry.start, entry.length, actual
                        )));
                    }
                    total += actual;
                }
                Ok(total)
            }
            ObjectId::Section { length, base, .. } => {
                self.verify_inner(base, blocks)?;
                Ok(*length)
            }
        }
    }
}

/// Seekable reader over a logical object byte range.
pub struct ObjectReader<'a> {
    manager: &'a ObjectManager,
    opened: Opened,
    pos: u64,
}

impl<'a> ObjectReader<'a> {
    pub fn len(&self) -> u64 {
        self.opened.total_length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_at(opened: &Opened, manager: &ObjectManager, pos: u64, buf: &mut [u8]) -> Result<usize> {
        match opened {
            Opened::Direct(data) => {
                if pos >= data.len() as u64 {
                    return Ok(0);
                }
                let start = pos as usize;
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            Opened::Indirect { entries, total_length } => {
                if pos >= *total_length {
                    return Ok(0);
                }
                let idx = match entries.binary_search_by(|e| {
                    if pos < e.start {
                        std::cmp::Ordering::Greater
                    } else if pos >= e.start + e.length {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Equal
                    }
                }) {
                    Ok(idx) => idx,
                    Err(_) => return Ok(0),
                };
                let entry = &entries[idx];
                let child = manager.open_inner(&entry.object)?;
                let child_pos = pos - entry.start;
                let max_len = (entry.length - child_pos) as usize;
                let want = buf.len().min(max_len);
                Self::read_at(&child, manager, child_pos, &mut buf[..want])
            }
            Opened::Section { offset, length, base } => {
                if pos >= *length {
                    return Ok(0);
                }
                let want = buf.len().min((*length - pos) as usize);
                Self::read_at(base, manager, offset + pos, &mut buf[..want])
            }
        }
    }
}

impl<'a> Read for ObjectReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = Self::read_at(&self.opened, self.manager, self.pos, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<'a> Seek for ObjectReader<'a> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos: i64 = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => self.opened.total_length() as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::crypt_config::CryptConfig;
    use crate::backup::storage::MemoryStorage;
    use std::io::Read;

    fn manager() -> ObjectManager {
        let storage: Arc<dyn super::super::storage::Storage> = Arc::new(MemoryStorage::new());
        let crypt = Arc::new(CryptConfig::generate().unwrap());
        let cm = Arc::new(ContentManager::new(storage, Some(crypt), true, 1 << 20).unwrap());
        ObjectManager::new(cm)
    }

    #[test]
    fn object_id_printable_round_trip() {
        let id = ObjectId::Indirect(Box::new(ObjectId::Direct("Dabc123".to_string())));
        let printed = id.to_string();
        assert_eq!(printed, "IDabc123");
        assert_eq!(ObjectId::parse(&printed).unwrap(), id);

        let section = ObjectId::Section {
            start: 10,
            length: 20,
            base: Box::new(ObjectId::Direct("Dxyz".to_string())),
        };
        let printed = section.to_string();
        assert_eq!(ObjectId::parse(&printed).unwrap(), section);
    }

    #[test]
    fn round_trip_small_object() {
        let manager = manager();
        let mut writer = manager.new_writer(ObjectWriterOptions::default());
        writer.write(b"hello object store").unwrap();
        let id = writer.result(true).unwrap();
        assert!(matches!(id, ObjectId::Direct(_)));

        let mut reader = manager.open(&id).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello object store");
    }

    #[test]
    fn large_object_becomes_indirect_and_seeks() {
        let manager = manager();
        let mut writer = manager.new_writer(ObjectWriterOptions {
            chunker: ChunkerConfig::Fixed(200),
            ..Default::default()
        });
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        writer.write(&data).unwrap();
        let id = writer.result(true).unwrap();
        assert!(matches!(id, ObjectId::Indirect(_)));

        let mut reader = manager.open(&id).unwrap();
        assert_eq!(reader.len(), data.len() as u64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        let mut reader = manager.open(&id).unwrap();
        reader.seek(SeekFrom::Start(5000)).unwrap();
        let mut buf = [0u8; 100];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[5000..5100]);

        let (length, blocks) = manager.verify_object(&id).unwrap();
        assert_eq!(length, data.len() as u64);
        assert!(blocks.len() >= 50);
    }

    fn indirection_depth(id: &ObjectId) -> u32 {
        match id {
            ObjectId::Direct(_) => 1,
            ObjectId::Indirect(inner) => 1 + indirection_depth(inner),
            ObjectId::Section { base, .. } => indirection_depth(base),
        }
    }

    /// Every storage block physically holding bytes for `id`, including the
    /// index-stream blocks at every indirection level (unlike
    /// [`ObjectManager::verify_object`], which only reports the leaf blocks
    /// an index's entries point at, not the blocks the index itself is
    /// stored in).
    fn collect_all_blocks(manager: &ObjectManager, id: &ObjectId, out: &mut Vec<String>) -> Result<()> {
        match id {
            ObjectId::Direct(block_id) => {
                out.push(block_id.clone());
                Ok(())
            }
            ObjectId::Indirect(inner) => {
                collect_all_blocks(manager, inner, out)?;
                let opened = manager.open_inner(&ObjectId::Indirect(inner.clone()))?;
                if let Opened::Indirect { entries, .. } = opened {
                    for entry in &entries {
                        collect_all_blocks(manager, &entry.object, out)?;
                    }
                }
                Ok(())
            }
            ObjectId::Section { base, .. } => collect_all_blocks(manager, base, out),
        }
    }

    #[test]
    fn ten_thousand_bytes_at_200_produces_depth_four_and_66_blocks() {
        let manager = manager();
        let mut writer = manager.new_writer(ObjectWriterOptions {
            chunker: ChunkerConfig::Fixed(200),
            ..Default::default()
        });
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        writer.write(&data).unwrap();
        let id = writer.result(true).unwrap();

        // 10000 bytes at 200 bytes/chunk is exactly 50 data chunks with no
        // remainder. Those 50 entries, serialized as the indirect index's
        // JSON-lines stream and re-chunked at INDEX_CHUNK_SIZE, need two
        // further levels of index-of-index before a level's entry list
        // finally fits in one block, so the object id nests four deep:
        // Indirect(Indirect(Indirect(Direct))).
        assert_eq!(indirection_depth(&id), 4);

        let mut reader = manager.open(&id).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        let (length, leaf_blocks) = manager.verify_object(&id).unwrap();
        assert_eq!(length, data.len() as u64);
        assert_eq!(leaf_blocks.len(), 50);
        assert!(leaf_blocks.iter().all(|b| b.starts_with(DATA_PREFIX)));

        // 50 data chunks plus the 12 + 3 + 1 index blocks needed to encode
        // three levels of index-of-index: 66 storage blocks in total.
        let mut all_blocks = Vec::new();
        collect_all_blocks(&manager, &id, &mut all_blocks).unwrap();
        let data_count = all_blocks.iter().filter(|b| b.starts_with(DATA_PREFIX)).count();
        let index_count = all_blocks.iter().filter(|b| b.starts_with(INDEX_PREFIX)).count();
        assert_eq!(data_count, 50);
        assert_eq!(index_count, 16);
        assert_eq!(all_blocks.len(), 66);
    }

    #[test]
    fn empty_write_yields_single_empty_block() {
        let manager = manager();
        let writer = manager.new_writer(ObjectWriterOptions::default());
        let id = writer.result(true).unwrap();
        let mut reader = manager.open(&id).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn exact_multiple_of_max_has_no_spurious_trailing_chunk() {
        let manager = manager();
        let mut writer = manager.new_writer(ObjectWriterOptions {
            chunker: ChunkerConfig::Fixed(100),
            ..Default::default()
        });
        writer.write(&vec![9u8; 300]).unwrap();
        let id = writer.result(true).unwrap();
        if let ObjectId::Indirect(inner) = &id {
            let index_bytes = manager.read_whole(inner).unwrap();
            let entry_lines = index_bytes
                .split(|&b| b == b'\n')
                .filter(|l| !l.is_empty())
                .count()
                - 1; // minus header line
            assert_eq!(entry_lines, 3);
        } else {
            panic!("expected indirect object for 3 chunks");
        }
    }

    #[test]
    fn dedup_identical_content_shares_object_id() {
        let manager = manager();
        let mut w1 = manager.new_writer(ObjectWriterOptions::default());
        w1.write(b"same bytes").unwrap();
        let id1 = w1.result(true).unwrap();

        let mut w2 = manager.new_writer(ObjectWriterOptions::default());
        w2.write(b"same bytes").unwrap();
        let id2 = w2.result(true).unwrap();

        assert_eq!(id1, id2);
    }
}
