//! Crate-wide error kinds.
//!
//! The storage and object layers need to distinguish a handful of
//! conditions from generic I/O failure (e.g. a caller probing whether a
//! block exists, or a decrypt failure that should not poison the whole
//! manager). Everything else is wrapped in [`KopiaError::Other`] with
//! `anyhow`'s context chaining, the way the rest of the crate propagates
//! backend errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KopiaError {
    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("format block not found")]
    FormatBlockNotFound,

    #[error("invalid checksum")]
    InvalidChecksum,

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("inconsistent size: {0}")]
    InconsistentSize(String),

    #[error("upload cancelled")]
    UploadCancelled,

    #[error("write limit exceeded")]
    WriteLimitExceeded,

    #[error("repository not initialized")]
    NotInitialized,

    #[error("repository already initialized")]
    AlreadyInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<openssl::error::ErrorStack> for KopiaError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        KopiaError::Other(anyhow::Error::from(err))
    }
}

pub type Result<T> = std::result::Result<T, KopiaError>;
