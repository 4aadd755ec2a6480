//! Failures reading a containers-storage root.
//!
//! [`StorageError::is_not_found`] separates "the store has no such image,
//! layer or big-data item" from a store that can't be read.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage root not found at {0}")]
    RootNotFound(PathBuf),

    /// The root exists but isn't laid out like an overlay store.
    #[error("invalid storage: {0}")]
    InvalidStorage(String),

    #[error("layer not known: {0}")]
    LayerNotFound(String),

    #[error("image not known: {0}")]
    ImageNotFound(String),

    #[error("image {image} has no big data item {key:?}")]
    BigDataNotFound { image: String, key: String },

    /// An `overlay/l/` short link is missing or points somewhere unexpected.
    #[error("bad layer link: {0}")]
    LinkRead(String),

    #[error("tar-split: {0}")]
    TarSplit(String),

    /// Layers pulled with this compression can't be reproduced.
    #[error("unsupported layer compression: {0}")]
    UnsupportedCompression(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::LayerNotFound(_)
                | StorageError::ImageNotFound(_)
                | StorageError::BigDataNotFound { .. }
        )
    }
}
