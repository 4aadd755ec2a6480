//! sha256 digests as they appear in registry paths and containers-storage metadata.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// The only algorithm the registry layout is populated for.
pub const ALGORITHM: &str = "sha256";

/// Length of the hex-encoded part of a sha256 digest.
pub const HEX_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("unsupported digest algorithm in {0:?}")]
    Algorithm(String),
    #[error("invalid sha256 hex {0:?}")]
    Hex(String),
}

/// A sha256 digest, stored as 64 lowercase hex characters.
///
/// Formats as `sha256:<hex>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Accepts exactly 64 lowercase hex characters; uppercase is rejected.
    pub fn from_hex(hex: impl AsRef<str>) -> Result<Self, DigestError> {
        let hex = hex.as_ref();
        if hex.len() != HEX_LEN || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::Hex(hex.to_string()));
        }
        Ok(Digest(hex.to_string()))
    }

    /// Parses `sha256:<hex>`.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        match s.split_once(':') {
            Some((ALGORITHM, hex)) => Self::from_hex(hex),
            _ => Err(DigestError::Algorithm(s.to_string())),
        }
    }

    /// Digest of a byte slice.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    pub fn from_hasher(hasher: Sha256) -> Self {
        Digest(hex::encode(hasher.finalize()))
    }

    /// The hex-encoded part, without the algorithm.
    pub fn hex(&self) -> &str {
        &self.0
    }

    /// First two hex characters: the blob directory this digest lives under.
    pub fn prefix(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ALGORITHM}:{}", self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> String {
        digest.to_string()
    }
}
