//! Hash cache.
//!
//! A streaming, sorted, append-only object: a literal `HASHCACHE:v1`
//! marker line, then one JSON line per entry, ordered by a path-aware
//! comparator so that a directory's trailing-slash marker always sorts
//! after its non-empty siblings at the same level.

use serde::{Deserialize, Serialize};

use crate::error::{KopiaError, Result};

use super::object_manager::{ObjectId, ObjectManager, ObjectWriter, ObjectWriterOptions};

pub const HASHCACHE_MARKER: &str = "HASHCACHE:v1";

/// One record of the hash cache stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashCacheEntry {
    /// Snapshot-relative path; directories end with `/`.
    pub name: String,
    pub hash: u64,
    pub object_id: ObjectId,
}

/// Path-aware ordering: split on `/`, compare segment by segment; an
/// empty trailing segment (i.e. a directory's `/`) sorts after any
/// non-empty sibling segment at the same depth.
pub fn path_compare(a: &str, b: &str) -> std::cmp::Ordering {
    let mut sa = a.split('/');
    let mut sb = b.split('/');
    loop {
        match (sa.next(), sb.next()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.is_empty(), y.is_empty()) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => std::cmp::Ordering::Greater,
                    (false, true) => std::cmp::Ordering::Less,
                    (false, false) => x.cmp(y),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Writer enforcing strictly increasing order under [`path_compare`].
pub struct HashCacheWriter {
    writer: ObjectWriter,
    last_name: Option<String>,
}

impl HashCacheWriter {
    pub fn new(object_manager: &ObjectManager, options: ObjectWriterOptions) -> Self {
        let mut writer = object_manager.new_writer(options);
        writer
            .write(HASHCACHE_MARKER.as_bytes())
            .expect("writing to a freshly created ObjectWriter cannot fail");
        writer.write(b"\n").expect("writing a single newline cannot fail");
        Self { writer, last_name: None }
    }

    pub fn write_entry(&mut self, entry: &HashCacheEntry) -> Result<()> {
        if let Some(last) = &self.last_name {
            if path_compare(&entry.name, last) != std::cmp::Ordering::Greater {
                return Err(KopiaError::Malformed(format!(
                    "hash cache entries out of order: {:?} after {:?}",
                    entry.name, last
                )));
            }
        }
        self.last_name = Some(entry.name.clone());
        let line = serde_json::to_vec(entry).map_err(|e| KopiaError::Malformed(e.to_string()))?;
        self.writer.write(&line)?;
        self.writer.write(b"\n")
    }

    pub fn finish(self) -> Result<ObjectId> {
        self.writer.result(true)
    }
}

/// Single-pass forward reader over a previously written hash cache.
/// Callers must query in sorted order — [`find_entry`](Self::find_entry)
/// advances the cursor and never looks backward.
pub struct HashCacheReader {
    entries: Vec<HashCacheEntry>,
    cursor: usize,
}

impl HashCacheReader {
    /// Opens a hash cache object. A missing or unreadable cache is
    /// reported by the caller via [`Self::open_or_empty`], which is the
    /// form the upload engine actually uses (a cold start is non-fatal).
    pub fn open(object_manager: &ObjectManager, id: &ObjectId) -> Result<Self> {
        let mut reader = object_manager.open(id)?;
        let mut buf = Vec::with_capacity(reader.len() as usize);
        std::io::Read::read_to_end(&mut reader, &mut buf)?;

        let mut lines = buf.split(|&b| b == b'\n').filter(|l| !l.is_empty());
        let marker = lines
            .next()
            .ok_or_else(|| KopiaError::Malformed("empty hash cache object".into()))?;
        if marker != HASHCACHE_MARKER.as_bytes() {
            return Err(KopiaError::Malformed("missing HASHCACHE:v1 marker".into()));
        }

        let mut entries = Vec::new();
        for line in lines {
            let entry: HashCacheEntry =
                serde_json::from_slice(line).map_err(|e| KopiaError::Malformed(format!("hash cache entry: {}", e)))?;
            entries.push(entry);
        }

        Ok(Self { entries, cursor: 0 })
    }

    /// Returns an empty reader in place of a missing prior cache — the
    /// cold-start case, where every entry is necessarily a cache miss.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
        }
    }

    /// Advances the forward cursor looking for `path`, returning its
    /// entry if found. `path` must be `>=` every previously queried path.
    pub fn find_entry(&mut self, path: &str) -> Option<&HashCacheEntry> {
        while self.cursor < self.entries.len() {
            match path_compare(&self.entries[self.cursor].name, path) {
                std::cmp::Ordering::Less => self.cursor += 1,
                std::cmp::Ordering::Equal => return Some(&self.entries[self.cursor]),
                std::cmp::Ordering::Greater => return None,
            }
        }
        None
    }
}

/// FNV-1a offset basis / prime (64-bit).
const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(acc: u64, bytes: &[u8]) -> u64 {
    let mut hash = acc;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Per-entry metadata hash consulted before re-reading file contents.
/// Files pass `size`; directories pass `None`.
pub fn metadata_hash(name: &str, mtime_ns: i64, mode: u32, size: Option<u64>, uid: u32, gid: u32) -> u64 {
    let mut hash = fnv1a(FNV_OFFSET_BASIS, name.as_bytes());
    hash = fnv1a(hash, &[0]);
    hash = fnv1a(hash, &mtime_ns.to_le_bytes());
    hash = fnv1a(hash, &mode.to_le_bytes());
    hash = fnv1a(hash, &size.unwrap_or(u64::MAX).to_le_bytes());
    hash = fnv1a(hash, &uid.to_le_bytes());
    hash = fnv1a(hash, &gid.to_le_bytes());
    hash
}

/// Directory-level hash: FNV-1a over the relative path, a null
/// terminator, and for each child `(name, null, child_hash)`.
pub fn directory_hash(relative_path: &str, children: &[(String, u64)]) -> u64 {
    let mut hash = fnv1a(FNV_OFFSET_BASIS, relative_path.as_bytes());
    hash = fnv1a(hash, &[0]);
    for (name, child_hash) in children {
        hash = fnv1a(hash, name.as_bytes());
        hash = fnv1a(hash, &[0]);
        hash = fnv1a(hash, &child_hash.to_le_bytes());
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::content_manager::ContentManager;
    use crate::backup::crypt_config::CryptConfig;
    use crate::backup::storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    fn manager() -> ObjectManager {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let crypt = Arc::new(CryptConfig::generate().unwrap());
        let cm = Arc::new(ContentManager::new(storage, Some(crypt), true, 1 << 20).unwrap());
        ObjectManager::new(cm)
    }

    #[test]
    fn directory_marker_sorts_after_siblings() {
        // "docs" (file) < "docs/" (directory marker) < "docs2"
        assert_eq!(path_compare("docs", "docs/"), std::cmp::Ordering::Less);
        assert_eq!(path_compare("docs/", "docs2"), std::cmp::Ordering::Less);
        assert_eq!(path_compare("a/b", "a/c"), std::cmp::Ordering::Less);
        assert_eq!(path_compare("a/", "a/b"), std::cmp::Ordering::Greater);
    }

    #[test]
    fn sample_path_set_sorts_as_expected() {
        let mut paths = vec![
            "src/".to_string(),
            "src/main.rs".to_string(),
            "src/lib.rs".to_string(),
            "src2/".to_string(),
            "README.md".to_string(),
            "docs/".to_string(),
            "docs/guide.md".to_string(),
        ];
        paths.sort_by(|a, b| path_compare(a, b));
        assert_eq!(
            paths,
            vec![
                "README.md",
                "docs/guide.md",
                "docs/",
                "src/lib.rs",
                "src/main.rs",
                "src/",
                "src2/",
            ]
        );
    }

    #[test]
    fn write_then_query_round_trip() {
        let manager = manager();
        let obj_a = {
            let mut w = manager.new_writer(ObjectWriterOptions::default());
            w.write(b"a").unwrap();
            w.result(true).unwrap()
        };
        let obj_dir = {
            let mut w = manager.new_writer(ObjectWriterOptions::default());
            w.write(b"dir-listing").unwrap();
            w.result(true).unwrap()
        };

        let mut writer = HashCacheWriter::new(&manager, ObjectWriterOptions::default());
        writer
            .write_entry(&HashCacheEntry {
                name: "alpha.txt".into(),
                hash: 42,
                object_id: obj_a.clone(),
            })
            .unwrap();
        writer
            .write_entry(&HashCacheEntry {
                name: "subdir/".into(),
                hash: 99,
                object_id: obj_dir.clone(),
            })
            .unwrap();
        let id = writer.finish().unwrap();

        let mut reader = HashCacheReader::open(&manager, &id).unwrap();
        let found = reader.find_entry("alpha.txt").unwrap();
        assert_eq!(found.object_id, obj_a);
        let found = reader.find_entry("subdir/").unwrap();
        assert_eq!(found.object_id, obj_dir);
        assert!(reader.find_entry("zzz").is_none());
    }

    #[test]
    fn out_of_order_write_rejected() {
        let manager = manager();
        let obj = {
            let mut w = manager.new_writer(ObjectWriterOptions::default());
            w.write(b"x").unwrap();
            w.result(true).unwrap()
        };
        let mut writer = HashCacheWriter::new(&manager, ObjectWriterOptions::default());
        writer
            .write_entry(&HashCacheEntry {
                name: "z".into(),
                hash: 1,
                object_id: obj.clone(),
            })
            .unwrap();
        let err = writer
            .write_entry(&HashCacheEntry {
                name: "a".into(),
                hash: 1,
                object_id: obj,
            })
            .unwrap_err();
        assert!(matches!(err, KopiaError::Malformed(_)));
    }

    #[test]
    fn metadata_hash_is_stable_and_sensitive_to_mtime() {
        let h1 = metadata_hash("file.txt", 1000, 0o644, Some(10), 1000, 1000);
        let h2 = metadata_hash("file.txt", 1000, 0o644, Some(10), 1000, 1000);
        let h3 = metadata_hash("file.txt", 1001, 0o644, Some(10), 1000, 1000);
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn directory_hash_is_order_sensitive() {
        let h1 = directory_hash("a/", &[("x".into(), 1), ("y".into(), 2)]);
        let h2 = directory_hash("a/", &[("y".into(), 2), ("x".into(), 1)]);
        assert_ne!(h1, h2);
        let h3 = directory_hash("a/", &[("x".into(), 1), ("y".into(), 2)]);
        assert_eq!(h1, h3);
    }

    #[test]
    fn empty_reader_always_misses() {
        let mut reader = HashCacheReader::empty();
        assert!(reader.find_entry("anything").is_none());
    }
}
