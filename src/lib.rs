//! A client-side, end-to-end-encrypted, deduplicating backup repository
//! storage engine: content-addressable object store, content-defined
//! chunker, indirect-object indexing, hash-cache-driven incremental
//! upload, and the blob-storage abstraction underneath all of it.

pub mod backup;
pub mod config;
pub mod error;

pub use error::{KopiaError, Result};
