//! Errors returned by the registry driver.
//!
//! [`Error::PathNotFound`] and [`Error::BlobNotFound`] are the two "not found"
//! kinds; callers that only care about existence should use
//! [`Error::is_not_found`].  Failures of the backing store keep the underlying
//! [`StorageError`] as their source.

use std::{fmt, io};

use thiserror::Error;

use crate::{digest::Digest, storage::StorageError};

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Every lookup that was tried while resolving a blob, and why it failed.
#[derive(Debug, Default)]
pub struct LookupErrors(pub Vec<String>);

impl LookupErrors {
    pub fn push(&mut self, err: impl fmt::Display) {
        self.0.push(err.to_string());
    }
}

impl fmt::Display for LookupErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("blob {digest} not found: {attempts}")]
    BlobNotFound {
        digest: Digest,
        attempts: LookupErrors,
    },
    #[error("{0}: is a directory")]
    IsADirectory(String),
    #[error("{0}: not a directory")]
    NotADirectory(String),
    #[error("operation {0} is unsupported by a read-only driver")]
    Unsupported(&'static str),
    #[error("{context}")]
    Store {
        context: String,
        #[source]
        source: StorageError,
    },
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("driver is shut down")]
    Closed(#[from] tokio::sync::AcquireError),
    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PathNotFound(_) | Error::BlobNotFound { .. })
    }

    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        Error::PathNotFound(path.into())
    }
}

/// Attaches a description of what was being looked up to a [`StorageError`].
pub(crate) trait StoreContext<T> {
    fn store_context<C: fmt::Display>(self, f: impl FnOnce() -> C) -> Result<T>;
}

impl<T> StoreContext<T> for std::result::Result<T, StorageError> {
    fn store_context<C: fmt::Display>(self, f: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|source| Error::Store {
            context: f().to_string(),
            source,
        })
    }
}
