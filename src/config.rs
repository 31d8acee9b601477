//! Persisted repository-client configuration: which storage backend to
//! use and the local directory-listing cache limits.
//!
//! A flat `serde_json` document rather than a schema-registry-backed
//! section config, since this crate has no CLI/API layer to validate
//! against.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KopiaError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Filesystem { path: String },
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingConfig {
    pub cache_directory: String,
    pub content_cache_size_limit_bytes: u64,
    pub metadata_cache_size_limit_bytes: u64,
    pub max_cached_directories: usize,
    pub max_cached_directory_entries: usize,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            cache_directory: String::new(),
            content_cache_size_limit_bytes: 512 << 20,
            metadata_cache_size_limit_bytes: 64 << 20,
            max_cached_directories: 1000,
            max_cached_directory_entries: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryClientConfig {
    pub storage: StorageConfig,
    pub caching: CachingConfig,
}

impl RepositoryClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&data).map_err(|e| KopiaError::Malformed(format!("config: {}", e)))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(|e| KopiaError::Malformed(e.to_string()))?;
        std::fs::write(path.as_ref(), data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let config = RepositoryClientConfig {
            storage: StorageConfig::Filesystem {
                path: "/var/lib/kopia-core".to_string(),
            },
            caching: CachingConfig::default(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repository.config");
        config.save(&path).unwrap();
        let loaded = RepositoryClientConfig::load(&path).unwrap();
        assert_eq!(loaded.caching.max_cached_directories, 1000);
        match loaded.storage {
            StorageConfig::Filesystem { path } => assert_eq!(path, "/var/lib/kopia-core"),
            _ => panic!("expected filesystem storage config"),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RepositoryClientConfig::load("/nonexistent/repository.config").unwrap_err();
        assert!(matches!(err, KopiaError::Io(_)));
    }
}
