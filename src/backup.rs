//! This module implements the repository storage engine.
//!
//! # Data formats
//!
//! A repository splits file and directory data into content-addressed
//! chunks, deduplicated by hash. Snapshots are stored as an object graph
//! rooted at a manifest: the manifest references a root directory object
//! and a hash-cache object, both themselves built from storage blocks.
//!
//! A storage block is a binary blob, addressed by a keyed digest of its
//! plaintext and stored inside a [`storage::Storage`] rather than any
//! particular directory layout of its own.
//!
//! # Layering
//!
//! * [`storage`] — flat put/get/list/delete of opaque blobs.
//! * [`format`] — the repository header blob and its secrets.
//! * [`chunker`] — fixed, never, or content-defined splitting.
//! * [`block_codec`] + [`content_manager`] — block framing, packing,
//!   dedup.
//! * [`object_manager`] — chunked objects, indirect indices, seekable
//!   reads.
//! * [`directory`] — sorted directory listings and file bundling.
//! * [`hash_cache`] — the incremental-upload metadata cache.
//! * [`upload`] — the tree walker tying the hash cache, object manager,
//!   and directory serializer together.
//! * [`directory_cache`] — the in-memory LRU used by readers.
//! * [`manifest`] — the snapshot manifest these all feed into.

pub mod block_codec;
pub mod chunker;
pub mod content_manager;
pub mod crypt_config;
pub mod directory;
pub mod directory_cache;
pub mod format;
pub mod hash_cache;
pub mod key_derivation;
pub mod manifest;
pub mod object_manager;
pub mod storage;
pub mod upload;
