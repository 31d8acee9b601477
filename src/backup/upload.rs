//! Upload engine.
//!
//! Walks a filesystem tree depth-first, consulting the hash cache at
//! every file and directory to decide between reuse and re-hashing, and
//! driving the object manager and directory serializer for anything that
//! changed. Bundles contiguous runs (in sorted-name order) of small,
//! changed regular files sharing a `year*100+month` bucket into one
//! storage object.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use walkdir::WalkDir;

use crate::error::{KopiaError, Result};

use super::chunker::ChunkerConfig;
use super::directory::{
    bundle_bucket, BundleRecord, BundledChild, DirectoryWriter, EntryRecord, EntryType, BUNDLE_SIZE_THRESHOLD,
};
use super::hash_cache::{directory_hash, metadata_hash, HashCacheEntry, HashCacheReader, HashCacheWriter};
use super::manifest::{SnapshotManifest, SnapshotSource, UploadStats};
use super::object_manager::{ObjectId, ObjectManager, ObjectWriterOptions};

const HASH_CACHE_PREFIX: &str = "H";

#[derive(Clone)]
pub struct UploadOptions {
    pub chunker: ChunkerConfig,
    pub bundle_threshold: u64,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            bundle_threshold: BUNDLE_SIZE_THRESHOLD,
        }
    }
}

fn mtime_ns(metadata: &std::fs::Metadata) -> i64 {
    match metadata.modified() {
        Ok(time) => time
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
        Err(_) => 0,
    }
}

#[cfg(unix)]
fn unix_owner(metadata: &std::fs::Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.mode(), metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn unix_owner(_metadata: &std::fs::Metadata) -> (u32, u32, u32) {
    (0o644, 0, 0)
}

struct PendingFile {
    name: String,
    mode: u32,
    mtime_ns: i64,
    uid: u32,
    gid: u32,
    data: Vec<u8>,
    metadata_hash: u64,
}

struct DirResult {
    object: ObjectId,
    hash: u64,
    reused: bool,
}

/// Walks and uploads a filesystem tree, emitting a fresh hash cache and a
/// snapshot manifest.
pub struct UploadEngine<'a> {
    object_manager: &'a ObjectManager,
    options: UploadOptions,
    cancel: Arc<AtomicBool>,
}

impl<'a> UploadEngine<'a> {
    pub fn new(object_manager: &'a ObjectManager, options: UploadOptions, cancel: Arc<AtomicBool>) -> Self {
        Self {
            object_manager,
            options,
            cancel,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(KopiaError::UploadCancelled)
        } else {
            Ok(())
        }
    }

    fn object_writer_options(&self) -> ObjectWriterOptions {
        ObjectWriterOptions {
            chunker: self.options.chunker,
            ..Default::default()
        }
    }

    pub fn upload(
        &self,
        root: &Path,
        source: SnapshotSource,
        prior_hash_cache: Option<&ObjectId>,
    ) -> Result<SnapshotManifest> {
        let start_time = Utc::now();

        let mut prior = match prior_hash_cache {
            Some(id) => HashCacheReader::open(self.object_manager, id).unwrap_or_else(|_| HashCacheReader::empty()),
            None => HashCacheReader::empty(),
        };

        let mut hash_cache_writer = HashCacheWriter::new(
            self.object_manager,
            ObjectWriterOptions {
                prefix: HASH_CACHE_PREFIX.to_string(),
                ..self.object_writer_options()
            },
        );
        let mut stats = UploadStats::default();

        let root_result = self.upload_directory(root, "", &mut prior, &mut hash_cache_writer, &mut stats)?;
        hash_cache_writer.write_entry(&HashCacheEntry {
            name: "/".to_string(),
            hash: root_result.hash,
            object_id: root_result.object.clone(),
        })?;
        let hash_cache_id = hash_cache_writer.finish()?;

        Ok(SnapshotManifest {
            source,
            start_time,
            end_time: Utc::now(),
            description: String::new(),
            root_object_id: root_result.object,
            hash_cache_id,
            stats,
        })
    }

    fn relative_join(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent, name)
        }
    }

    fn upload_directory(
        &self,
        path: &Path,
        relative: &str,
        prior: &mut HashCacheReader,
        hash_cache: &mut HashCacheWriter,
        stats: &mut UploadStats,
    ) -> Result<DirResult> {
        self.check_cancelled()?;

        let mut children: Vec<walkdir::DirEntry> = WalkDir::new(path)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| KopiaError::Other(anyhow::anyhow!("reading directory {}: {}", path.display(), e)))?;
        children.sort_by(|a, b| a.file_name().cmp(b.file_name()));

        let mut writer = DirectoryWriter::new(self.object_manager, self.object_writer_options());
        let mut child_hashes: Vec<(String, u64)> = Vec::new();
        let mut all_children_cached = true;
        let mut run: Vec<PendingFile> = Vec::new();
        let mut run_bucket: Option<u32> = None;

        for entry in &children {
            self.check_cancelled()?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child_relative = Self::relative_join(relative, &name);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                self.flush_run(&mut run, run_bucket.take(), &mut writer, hash_cache, &mut child_hashes, stats)?;
                let sub = self.upload_directory(entry.path(), &child_relative, prior, hash_cache, stats)?;
                if !sub.reused {
                    all_children_cached = false;
                }
                hash_cache.write_entry(&HashCacheEntry {
                    name: format!("{}/", child_relative),
                    hash: sub.hash,
                    object_id: sub.object.clone(),
                })?;
                writer.write_entry(EntryRecord {
                    name: name.clone(),
                    etype: EntryType::Dir,
                    mode: 0o755,
                    mtime_ns: 0,
                    uid: 0,
                    gid: 0,
                    size: None,
                    object: sub.object,
                })?;
                child_hashes.push((name, sub.hash));
                continue;
            }

            let metadata = entry
                .metadata()
                .map_err(|e| KopiaError::Other(anyhow::anyhow!("stat {}: {}", entry.path().display(), e)))?;
            let (mode, uid, gid) = unix_owner(&metadata);
            let mt = mtime_ns(&metadata);

            if file_type.is_symlink() {
                self.flush_run(&mut run, run_bucket.take(), &mut writer, hash_cache, &mut child_hashes, stats)?;
                let target = std::fs::read_link(entry.path())
                    .map_err(|e| KopiaError::Other(anyhow::anyhow!("readlink {}: {}", entry.path().display(), e)))?;
                let target_bytes = target.to_string_lossy().into_owned().into_bytes();
                let mh = metadata_hash(&child_relative, mt, mode, None, uid, gid);
                let object = match prior.find_entry(&child_relative) {
                    Some(e) if e.hash == mh => {
                        stats.cached_files += 1;
                        e.object_id.clone()
                    }
                    _ => {
                        stats.non_cached_files += 1;
                        stats.bytes_read += target_bytes.len() as u64;
                        let mut w = self.object_manager.new_writer(self.object_writer_options());
                        w.write(&target_bytes)?;
                        let object = w.result(true)?;
                        stats.bytes_written += target_bytes.len() as u64;
                        object
                    }
                };
                hash_cache.write_entry(&HashCacheEntry {
                    name: child_relative.clone(),
                    hash: mh,
                    object_id: object.clone(),
                })?;
                writer.write_entry(EntryRecord {
                    name: name.clone(),
                    etype: EntryType::Symlink,
                    mode,
                    mtime_ns: mt,
                    uid,
                    gid,
                    size: None,
                    object: object.clone(),
                })?;
                child_hashes.push((name, mh));
                continue;
            }

            if !file_type.is_file() {
                // socket / device / pipe: no content to store.
                self.flush_run(&mut run, run_bucket.take(), &mut writer, hash_cache, &mut child_hashes, stats)?;
                let mh = metadata_hash(&child_relative, mt, mode, None, uid, gid);
                let object = self.object_manager.new_writer(self.object_writer_options()).result(true)?;
                hash_cache.write_entry(&HashCacheEntry {
                    name: child_relative.clone(),
                    hash: mh,
                    object_id: object.clone(),
                })?;
                writer.write_entry(EntryRecord {
                    name: name.clone(),
                    etype: EntryType::Pipe,
                    mode,
                    mtime_ns: mt,
                    uid,
                    gid,
                    size: None,
                    object,
                })?;
                child_hashes.push((name, mh));
                continue;
            }

            let size = metadata.len();
            let mh = metadata_hash(&child_relative, mt, mode, Some(size), uid, gid);

            if let Some(e) = prior.find_entry(&child_relative) {
                if e.hash == mh {
                    self.flush_run(&mut run, run_bucket.take(), &mut writer, hash_cache, &mut child_hashes, stats)?;
                    stats.cached_files += 1;
                    let object = e.object_id.clone();
                    hash_cache.write_entry(&HashCacheEntry {
                        name: child_relative.clone(),
                        hash: mh,
                        object_id: object.clone(),
                    })?;
                    writer.write_entry(EntryRecord {
                        name: name.clone(),
                        etype: EntryType::File,
                        mode,
                        mtime_ns: mt,
                        uid,
                        gid,
                        size: Some(size),
                        object,
                    })?;
                    child_hashes.push((name, mh));
                    continue;
                }
            }

            // Cache miss.
            if size <= self.options.bundle_threshold {
                let bucket = bundle_bucket(mt);
                if run_bucket.is_some() && run_bucket != Some(bucket) {
                    self.flush_run(&mut run, run_bucket.take(), &mut writer, hash_cache, &mut child_hashes, stats)?;
                }
                run_bucket = Some(bucket);
                let data = std::fs::read(entry.path())
                    .map_err(|e| KopiaError::Other(anyhow::anyhow!("read {}: {}", entry.path().display(), e)))?;
                stats.bytes_read += data.len() as u64;
                run.push(PendingFile {
                    name,
                    mode,
                    mtime_ns: mt,
                    uid,
                    gid,
                    data,
                    metadata_hash: mh,
                });
            } else {
                self.flush_run(&mut run, run_bucket.take(), &mut writer, hash_cache, &mut child_hashes, stats)?;
                let data = std::fs::read(entry.path())
                    .map_err(|e| KopiaError::Other(anyhow::anyhow!("read {}: {}", entry.path().display(), e)))?;
                stats.bytes_read += data.len() as u64;
                let mut w = self.object_manager.new_writer(self.object_writer_options());
                w.write(&data)?;
                let object = w.result(true)?;
                stats.bytes_written += data.len() as u64;
                stats.non_cached_files += 1;
                hash_cache.write_entry(&HashCacheEntry {
                    name: child_relative.clone(),
                    hash: mh,
                    object_id: object.clone(),
                })?;
                writer.write_entry(EntryRecord {
                    name: name.clone(),
                    etype: EntryType::File,
                    mode,
                    mtime_ns: mt,
                    uid,
                    gid,
                    size: Some(size),
                    object,
                })?;
                child_hashes.push((name, mh));
            }
        }

        self.flush_run(&mut run, run_bucket.take(), &mut writer, hash_cache, &mut child_hashes, stats)?;

        let dir_hash = directory_hash(relative, &child_hashes);
        let prior_dir_entry = prior.find_entry(&format!("{}/", relative)).cloned();

        if all_children_cached {
            if let Some(prior_entry) = &prior_dir_entry {
                if prior_entry.hash == dir_hash {
                    stats.cached_directories += 1;
                    return Ok(DirResult {
                        object: prior_entry.object_id.clone(),
                        hash: dir_hash,
                        reused: true,
                    });
                }
            }
        }

        stats.non_cached_directories += 1;
        let object = writer.finish()?;
        Ok(DirResult {
            object,
            hash: dir_hash,
            reused: false,
        })
    }

    /// Flushes a pending run of small cache-miss files as either a single
    /// entry (run of one) or a bundle (run of more than one).
    fn flush_run(
        &self,
        run: &mut Vec<PendingFile>,
        _bucket: Option<u32>,
        writer: &mut DirectoryWriter,
        hash_cache: &mut HashCacheWriter,
        child_hashes: &mut Vec<(String, u64)>,
        stats: &mut UploadStats,
    ) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }

        if run.len() == 1 {
            let file = run.remove(0);
            let mut w = self.object_manager.new_writer(self.object_writer_options());
            w.write(&file.data)?;
            let object = w.result(true)?;
            stats.bytes_written += file.data.len() as u64;
            stats.non_cached_files += 1;
            hash_cache.write_entry(&HashCacheEntry {
                name: file.name.clone(),
                hash: file.metadata_hash,
                object_id: object.clone(),
            })?;
            writer.write_entry(EntryRecord {
                name: file.name.clone(),
                etype: EntryType::File,
                mode: file.mode,
                mtime_ns: file.mtime_ns,
                uid: file.uid,
                gid: file.gid,
                size: Some(file.data.len() as u64),
                object,
            })?;
            child_hashes.push((file.name, file.metadata_hash));
            return Ok(());
        }

        let bucket = bundle_bucket(run[0].mtime_ns);
        let mut concatenated = Vec::new();
        let mut bundled_children = Vec::with_capacity(run.len());
        for file in run.drain(..) {
            let offset = concatenated.len() as u64;
            let length = file.data.len() as u64;
            concatenated.extend_from_slice(&file.data);
            bundled_children.push((
                BundledChild {
                    name: file.name.clone(),
                    mode: file.mode,
                    mtime_ns: file.mtime_ns,
                    uid: file.uid,
                    gid: file.gid,
                    offset,
                    length,
                },
                file.metadata_hash,
            ));
        }

        let declared_size = concatenated.len() as u64;
        stats.bytes_written += declared_size;
        let mut w = self.object_manager.new_writer(self.object_writer_options());
        w.write(&concatenated)?;
        let bundle_object = w.result(true)?;

        for (child, mh) in &bundled_children {
            let section = ObjectId::Section {
                start: child.offset,
                length: child.length,
                base: Box::new(bundle_object.clone()),
            };
            hash_cache.write_entry(&HashCacheEntry {
                name: child.name.clone(),
                hash: *mh,
                object_id: section,
            })?;
            child_hashes.push((child.name.clone(), *mh));
            stats.non_cached_files += 1;
        }

        writer.write_bundle(BundleRecord {
            bucket,
            object: bundle_object,
            declared_size,
            children: bundled_children.into_iter().map(|(c, _)| c).collect(),
        })?;

        Ok(())
    }
}
