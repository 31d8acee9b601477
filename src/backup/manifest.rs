//! Snapshot manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::object_manager::ObjectId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSource {
    pub host: String,
    pub user: String,
    pub path: String,
}

/// Per-run counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadStats {
    pub cached_files: u64,
    pub non_cached_files: u64,
    pub cached_directories: u64,
    pub non_cached_directories: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub source: SnapshotSource,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub description: String,
    pub root_object_id: ObjectId,
    pub hash_cache_id: ObjectId,
    pub stats: UploadStats,
}
