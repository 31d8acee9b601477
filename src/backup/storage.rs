//! Blob storage abstraction.
//!
//! A [`Storage`] is a flat, content-agnostic put/get/list/delete store for
//! opaque byte blobs keyed by string name. Everything above this layer
//! (content blocks, objects, directories, manifests) is built purely in
//! terms of this trait, so swapping the backend (local directory today,
//! object storage elsewhere) never touches the rest of the crate.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::error::{KopiaError, Result};

/// Metadata returned by [`Storage::list`].
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub id: String,
    pub length: u64,
    pub timestamp: SystemTime,
}

/// The storage backend contract.
///
/// Implementations must provide durability and read-after-write visibility
/// for `put`, atomic "all or nothing" visibility (no partial blob is ever
/// observable), and listing by prefix. Concurrent `put`s of the *same* key
/// need not be serialized against each other — content addressing above
/// this layer guarantees identical payloads, so last-writer-wins is fine.
pub trait Storage: Send + Sync {
    fn put(&self, id: &str, data: &[u8]) -> Result<()>;

    /// `length < 0` reads the blob to the end.
    fn get(&self, id: &str, offset: i64, length: i64) -> Result<Vec<u8>>;

    fn delete(&self, id: &str) -> Result<()>;

    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory backend used by tests and ephemeral repositories.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, (Vec<u8>, SystemTime)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert(id.to_string(), (data.to_vec(), SystemTime::now()));
        Ok(())
    }

    fn get(&self, id: &str, offset: i64, length: i64) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap();
        let (data, _) = blobs
            .get(id)
            .ok_or_else(|| KopiaError::BlockNotFound(id.to_string()))?;
        Ok(slice_blob(data, offset, length))
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.blobs.lock().unwrap().remove(id);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let blobs = self.blobs.lock().unwrap();
        let mut result: Vec<BlobMeta> = blobs
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(id, (data, ts))| BlobMeta {
                id: id.clone(),
                length: data.len() as u64,
                timestamp: *ts,
            })
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }
}

fn slice_blob(data: &[u8], offset: i64, length: i64) -> Vec<u8> {
    let offset = offset.max(0) as usize;
    if offset >= data.len() {
        return Vec::new();
    }
    if length < 0 {
        data[offset..].to_vec()
    } else {
        let end = (offset + length as usize).min(data.len());
        data[offset..end].to_vec()
    }
}

/// Default shard widths for [`FilesystemStorage`].
pub const DEFAULT_SHARD_SPEC: &[usize] = &[1, 3, 3];

/// Local-directory backend with sharded naming.
///
/// Given a blob id and shard widths `[s1, s2, ...]` the relative path is
/// `s1-char/s2-char/.../remainder.f`. Writes go through a `.{pid}.{rand}.tmp`
/// file in the same directory, then an atomic rename, safe across both
/// processes and threads.
pub struct FilesystemStorage {
    base: PathBuf,
    shard_spec: Vec<usize>,
}

impl FilesystemStorage {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            shard_spec: DEFAULT_SHARD_SPEC.to_vec(),
        })
    }

    pub fn with_shard_spec(base: impl Into<PathBuf>, shard_spec: Vec<usize>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base, shard_spec })
    }

    /// Computes the sharded relative path for a blob id, not including the
    /// storage base directory.
    pub fn shard_path(&self, id: &str) -> PathBuf {
        let mut rest = id;
        let mut path = PathBuf::new();
        for &width in &self.shard_spec {
            if rest.len() <= width {
                break;
            }
            let (head, tail) = rest.split_at(width);
            path.push(head);
            rest = tail;
        }
        path.push(format!("{}.f", rest));
        path
    }

    fn full_path(&self, id: &str) -> PathBuf {
        self.base.join(self.shard_path(id))
    }
}

impl Storage for FilesystemStorage {
    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        let path = self.full_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let rand_suffix: u64 = rand::random();
        let tmp_path = path.with_extension(format!("{}.tmp", rand_suffix));

        let write_result = (|| -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            let mut perm = file.metadata()?.permissions();
            perm.set_mode(0o640);
            file.set_permissions(perm)?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }

        fs::rename(&tmp_path, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            KopiaError::Io(err)
        })?;

        Ok(())
    }

    fn get(&self, id: &str, offset: i64, length: i64) -> Result<Vec<u8>> {
        let path = self.full_path(id);
        let mut file = fs::File::open(&path)
            .map_err(|_| KopiaError::BlockNotFound(id.to_string()))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(slice_blob(&data, offset, length))
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.full_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let mut result = Vec::new();
        list_recursive(&self.base, &self.base, prefix, &mut result)?;
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }
}

fn list_recursive(
    base: &Path,
    dir: &Path,
    prefix: &str,
    out: &mut Vec<BlobMeta>,
) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            list_recursive(base, &path, prefix, out)?;
            continue;
        }
        let id = blob_id_from_path(base, &path);
        let id = match id {
            Some(id) => id,
            None => continue,
        };
        if !id.starts_with(prefix) {
            continue;
        }
        let meta = entry.metadata()?;
        out.push(BlobMeta {
            id,
            length: meta.len(),
            timestamp: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    Ok(())
}

fn blob_id_from_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let rel = rel.to_str()?;
    if !rel.ends_with(".f") {
        return None;
    }
    let rel = &rel[..rel.len() - 2];
    Some(rel.replace('/', "").replace(std::path::MAIN_SEPARATOR, ""))
}

/// Transparent decorator that logs every call, preserving the `Storage`
/// contract of whatever it wraps.
pub struct LoggingStorage<S> {
    inner: S,
    name: String,
}

impl<S: Storage> LoggingStorage<S> {
    pub fn new(inner: S, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }
}

impl<S: Storage> Storage for LoggingStorage<S> {
    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        log::debug!("[{}] put {} ({} bytes)", self.name, id, data.len());
        self.inner.put(id, data)
    }

    fn get(&self, id: &str, offset: i64, length: i64) -> Result<Vec<u8>> {
        log::debug!("[{}] get {} off={} len={}", self.name, id, offset, length);
        self.inner.get(id, offset, length)
    }

    fn delete(&self, id: &str) -> Result<()> {
        log::debug!("[{}] delete {}", self.name, id);
        self.inner.delete(id)
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        self.inner.list(prefix)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

enum WriteBackOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Buffers `put`/`delete` through a bounded worker queue; `flush` drains it
/// and surfaces the first error encountered.
pub struct WriteBackStorage {
    inner: Arc<dyn Storage>,
    sender: crossbeam_channel::Sender<WriteBackOp>,
    worker: Option<std::thread::JoinHandle<()>>,
    error: Arc<Mutex<Option<KopiaError>>>,
    pending: Arc<Mutex<u64>>,
    done: Arc<Mutex<()>>,
}

impl WriteBackStorage {
    pub fn new(inner: Arc<dyn Storage>, queue_depth: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded::<WriteBackOp>(queue_depth);
        let error = Arc::new(Mutex::new(None));
        let pending = Arc::new(Mutex::new(0u64));
        let done = Arc::new(Mutex::new(()));

        let worker_inner = inner.clone();
        let worker_error = error.clone();
        let worker_pending = pending.clone();
        let worker = std::thread::spawn(move || {
            for op in receiver {
                let result = match op {
                    WriteBackOp::Put(id, data) => worker_inner.put(&id, &data),
                    WriteBackOp::Delete(id) => worker_inner.delete(&id),
                };
                if let Err(err) = result {
                    let mut slot = worker_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
                *worker_pending.lock().unwrap() -= 1;
            }
        });

        Self {
            inner,
            sender,
            worker: Some(worker),
            error,
            pending,
            done,
        }
    }

    /// Waits for all queued operations to finish and returns the first
    /// error observed, if any.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.done.lock().unwrap();
        loop {
            if *self.pending.lock().unwrap() == 0 {
                break;
            }
            std::thread::yield_now();
        }
        let mut slot = self.error.lock().unwrap();
        if let Some(err) = slot.take() {
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for WriteBackStorage {
    fn drop(&mut self) {
        let _ = self.flush();
        if let Some(handle) = self.worker.take() {
            drop(std::mem::replace(&mut self.sender, crossbeam_channel::bounded(0).0));
            let _ = handle.join();
        }
    }
}

impl Storage for WriteBackStorage {
    fn put(&self, id: &str, data: &[u8]) -> Result<()> {
        *self.pending.lock().unwrap() += 1;
        self.sender
            .send(WriteBackOp::Put(id.to_string(), data.to_vec()))
            .map_err(|err| anyhow::anyhow!("write-back queue closed: {}", err))?;
        Ok(())
    }

    fn get(&self, id: &str, offset: i64, length: i64) -> Result<Vec<u8>> {
        self.inner.get(id, offset, length)
    }

    fn delete(&self, id: &str) -> Result<()> {
        *self.pending.lock().unwrap() += 1;
        self.sender
            .send(WriteBackOp::Delete(id.to_string()))
            .map_err(|err| anyhow::anyhow!("write-back queue closed: {}", err))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        self.inner.list(prefix)
    }

    fn close(&self) -> Result<()> {
        self.flush()?;
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.put("Dabc", b"hello world").unwrap();
        assert_eq!(storage.get("Dabc", 0, -1).unwrap(), b"hello world");
        assert_eq!(storage.get("Dabc", 6, 5).unwrap(), b"world");
    }

    #[test]
    fn memory_storage_missing_block() {
        let storage = MemoryStorage::new();
        match storage.get("Dmissing", 0, -1) {
            Err(KopiaError::BlockNotFound(id)) => assert_eq!(id, "Dmissing"),
            other => panic!("expected BlockNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn memory_storage_list_prefix() {
        let storage = MemoryStorage::new();
        storage.put("Dabc", b"1").unwrap();
        storage.put("Hxyz", b"2").unwrap();
        storage.put("Ddef", b"3").unwrap();
        let listed = storage.list("D").unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn memory_storage_delete_missing_is_noop() {
        let storage = MemoryStorage::new();
        storage.delete("Dnope").unwrap();
    }

    #[test]
    fn filesystem_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).unwrap();
        storage.put("Dabcdefgh", b"payload").unwrap();
        assert_eq!(storage.get("Dabcdefgh", 0, -1).unwrap(), b"payload");
        let listed = storage.list("D").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "Dabcdefgh");
        storage.delete("Dabcdefgh").unwrap();
        assert!(storage.get("Dabcdefgh", 0, -1).is_err());
    }

    #[test]
    fn filesystem_storage_shard_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).unwrap();
        let path = storage.shard_path("Dabcdefghijk");
        assert_eq!(path, PathBuf::from("D/abc/def/ghijk.f"));
    }

    #[test]
    fn write_back_storage_flushes() {
        let mem: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let wb = WriteBackStorage::new(mem.clone(), 16);
        wb.put("Dabc", b"hello").unwrap();
        wb.flush().unwrap();
        assert_eq!(mem.get("Dabc", 0, -1).unwrap(), b"hello");
    }
}
