//! Directory cache.
//!
//! An in-memory LRU of decoded directory listings keyed by object id, with
//! both an entry-count cap and a per-directory-count cap, and a
//! 24-hour expiration. A single mutex guards the whole structure; the
//! loader runs with the lock held so two readers can never race to fill
//! the same key, which serializes cache misses but is fine for the
//! expected read-mostly workload.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Result;

use super::directory::{DirectoryEntry, DirectoryReader};
use super::object_manager::{ObjectId, ObjectManager};

const DEFAULT_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

struct CacheLine {
    entries: std::sync::Arc<Vec<DirectoryEntry>>,
    inserted_at: Instant,
}

struct Inner {
    lines: HashMap<ObjectId, CacheLine>,
    /// Insertion order, oldest first, for LRU eviction.
    order: Vec<ObjectId>,
    total_entries: usize,
}

/// LRU cache of decoded [`DirectoryEntry`] lists.
pub struct DirectoryCache {
    inner: Mutex<Inner>,
    max_directories: usize,
    max_total_entries: usize,
    expiration: Duration,
}

impl DirectoryCache {
    pub fn new(max_directories: usize, max_total_entries: usize) -> Self {
        Self::with_expiration(max_directories, max_total_entries, DEFAULT_EXPIRATION)
    }

    pub fn with_expiration(max_directories: usize, max_total_entries: usize, expiration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lines: HashMap::new(),
                order: Vec::new(),
                total_entries: 0,
            }),
            max_directories,
            max_total_entries,
            expiration,
        }
    }

    fn touch(inner: &mut Inner, id: &ObjectId) {
        if let Some(pos) = inner.order.iter().position(|o| o == id) {
            let id = inner.order.remove(pos);
            inner.order.push(id);
        }
    }

    fn evict_if_needed(&self, inner: &mut Inner) {
        while (inner.lines.len() > self.max_directories || inner.total_entries > self.max_total_entries)
            && !inner.order.is_empty()
        {
            let victim = inner.order.remove(0);
            if let Some(line) = inner.lines.remove(&victim) {
                inner.total_entries -= line.entries.len();
            }
        }
    }

    /// Fetches (or loads and fills) the listing for `directory`, then
    /// invokes `callback` once per entry. `wrapper_fn` post-processes a
    /// freshly loaded entry list before it's cached and shown to the
    /// callback (e.g. applying a path-prefix or filter).
    pub fn iterate(
        &self,
        directory: &ObjectId,
        object_manager: &ObjectManager,
        wrapper_fn: impl FnOnce(Vec<DirectoryEntry>) -> Vec<DirectoryEntry>,
        mut callback: impl FnMut(&DirectoryEntry),
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let fresh = match inner.lines.get(directory) {
            Some(line) if line.inserted_at.elapsed() < self.expiration => None,
            _ => Some(()),
        };

        let entries = if fresh.is_some() {
            let decoded = DirectoryReader::read(object_manager, directory)?.entries;
            let decoded = wrapper_fn(decoded);
            let arc = std::sync::Arc::new(decoded);

            if let Some(old) = inner.lines.remove(directory) {
                inner.total_entries -= old.entries.len();
                if let Some(pos) = inner.order.iter().position(|o| o == directory) {
                    inner.order.remove(pos);
                }
            }
            inner.total_entries += arc.len();
            inner.lines.insert(
                directory.clone(),
                CacheLine {
                    entries: arc.clone(),
                    inserted_at: Instant::now(),
                },
            );
            inner.order.push(directory.clone());
            self.evict_if_needed(&mut inner);
            arc
        } else {
            Self::touch(&mut inner, directory);
            inner.lines.get(directory).unwrap().entries.clone()
        };

        drop(inner);
        for entry in entries.iter() {
            callback(entry);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::content_manager::ContentManager;
    use crate::backup::crypt_config::CryptConfig;
    use crate::backup::directory::{DirectoryWriter, EntryRecord, EntryType};
    use crate::backup::object_manager::ObjectWriterOptions;
    use crate::backup::storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    fn manager() -> ObjectManager {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let crypt = Arc::new(CryptConfig::generate().unwrap());
        let cm = Arc::new(ContentManager::new(storage, Some(crypt), true, 1 << 20).unwrap());
        ObjectManager::new(cm)
    }

    fn make_directory(manager: &ObjectManager, names: &[&str]) -> ObjectId {
        let mut writer = DirectoryWriter::new(manager, ObjectWriterOptions::default());
        for name in names {
            writer
                .write_entry(EntryRecord {
                    name: name.to_string(),
                    etype: EntryType::File,
                    mode: 0o644,
                    mtime_ns: 0,
                    uid: 0,
                    gid: 0,
                    size: Some(0),
                    object: ObjectId::Direct("Dempty".into()),
                })
                .unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn fills_once_and_serves_from_cache() {
        let manager = manager();
        let cache = DirectoryCache::new(10, 1000);
        let dir = make_directory(&manager, &["a", "b", "c"]);

        let mut seen = Vec::new();
        cache
            .iterate(&dir, &manager, |e| e, |entry| seen.push(entry.name.clone()))
            .unwrap();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(cache.len(), 1);

        let mut seen_again = Vec::new();
        cache
            .iterate(&dir, &manager, |e| e, |entry| seen_again.push(entry.name.clone()))
            .unwrap();
        assert_eq!(seen_again, vec!["a", "b", "c"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_when_directory_cap_exceeded() {
        let manager = manager();
        let cache = DirectoryCache::new(2, 1000);
        let d1 = make_directory(&manager, &["a"]);
        let d2 = make_directory(&manager, &["b"]);
        let d3 = make_directory(&manager, &["c"]);

        cache.iterate(&d1, &manager, |e| e, |_| {}).unwrap();
        cache.iterate(&d2, &manager, |e| e, |_| {}).unwrap();
        cache.iterate(&d3, &manager, |e| e, |_| {}).unwrap();

        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entry_is_reloaded() {
        let manager = manager();
        let cache = DirectoryCache::with_expiration(10, 1000, Duration::from_millis(1));
        let dir = make_directory(&manager, &["a"]);

        cache.iterate(&dir, &manager, |e| e, |_| {}).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let mut seen = Vec::new();
        cache
            .iterate(&dir, &manager, |e| e, |entry| seen.push(entry.name.clone()))
            .unwrap();
        assert_eq!(seen, vec!["a"]);
    }
}
