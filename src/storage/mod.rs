//! Read-only access to containers-storage image and layer metadata.
//!
//! [`ImageStore`] is the query surface the rest of the crate needs from
//! containers-storage: images and their names, layers and their compressed
//! digests, image big-data items and layer diffs.  Two implementations are
//! provided:
//!
//! - [`OverlayStorage`] reads the overlay driver's on-disk layout through
//!   `cap_std::fs::Dir` handles
//! - [`MemoryStore`] holds everything in memory
//!
//! Nothing is cached.  Every query reads the current state of the store.

pub mod error;
pub mod memory;
pub mod overlay;
pub mod tar_split;

use std::{collections::HashMap, fmt, io::Read};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;

use crate::digest::Digest;

pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use overlay::OverlayStorage;

/// Big-data key under which an image's manifest is stored.
pub const MANIFEST_BIG_DATA_KEY: &str = "manifest";

/// Which representation of a layer's content to produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffCompression {
    /// Compressed the way the layer was compressed when it was pulled.
    Native,
    /// The plain tar stream.
    Uncompressed,
}

/// Compression recorded for a layer in `layers.json`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LayerCompression {
    #[default]
    Uncompressed,
    Bzip2,
    Gzip,
    Xz,
    Zstd,
    Unknown(u8),
}

impl From<u8> for LayerCompression {
    fn from(value: u8) -> Self {
        match value {
            0 => LayerCompression::Uncompressed,
            1 => LayerCompression::Bzip2,
            2 => LayerCompression::Gzip,
            3 => LayerCompression::Xz,
            4 => LayerCompression::Zstd,
            other => LayerCompression::Unknown(other),
        }
    }
}

/// The parts of an image record this crate uses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    /// The image's primary manifest digest.
    pub digest: Option<Digest>,
    /// Every manifest digest the image is known by, primary first.
    pub digests: Vec<Digest>,
    /// Repository names (`registry/name:tag` or bare repository names).
    pub names: Vec<String>,
    pub top_layer: Option<String>,
}

impl ImageRecord {
    /// Rebuilds `digest`/`digests` from the stored digest and the digests of
    /// the manifest big-data items, the way containers-storage does.
    fn with_digests(mut self, names: &[String], big_data_digests: &HashMap<String, String>) -> Self {
        let mut digests = Vec::new();
        digests.extend(self.digest.clone());
        let manifests = names
            .iter()
            .filter(|name| name.starts_with(MANIFEST_BIG_DATA_KEY))
            .filter_map(|name| big_data_digests.get(name))
            .filter_map(|digest| parse_digest(digest));
        for digest in manifests {
            if !digests.contains(&digest) {
                digests.push(digest);
            }
        }
        if self.digest.is_none() {
            self.digest = digests.first().cloned();
        }
        self.digests = digests;
        self
    }
}

/// The parts of a layer record this crate uses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerRecord {
    pub id: String,
    pub parent: Option<String>,
    /// Digest of the layer blob as it was pulled.
    pub compressed_digest: Option<Digest>,
    pub compressed_size: Option<u64>,
    pub uncompressed_digest: Option<Digest>,
    pub uncompressed_size: Option<u64>,
    pub compression: LayerCompression,
}

/// Query surface over containers-storage.
///
/// Lookups that find nothing fail with one of the not-found variants of
/// [`StorageError`] (see [`StorageError::is_not_found`]).
pub trait ImageStore: Send + Sync + fmt::Debug {
    fn images(&self) -> Result<Vec<ImageRecord>>;

    fn layers(&self) -> Result<Vec<LayerRecord>>;

    /// Raw content of an image big-data item.
    fn image_big_data(&self, image_id: &str, key: &str) -> Result<Vec<u8>>;

    /// A fresh stream of the layer's content.
    fn diff(&self, layer_id: &str, compression: DiffCompression) -> Result<Box<dyn Read + Send>>;

    fn image(&self, id: &str) -> Result<ImageRecord> {
        self.images()?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| StorageError::ImageNotFound(id.to_string()))
    }

    fn images_by_digest(&self, digest: &Digest) -> Result<Vec<ImageRecord>> {
        let images: Vec<_> = self
            .images()?
            .into_iter()
            .filter(|i| i.digests.contains(digest))
            .collect();
        if images.is_empty() {
            return Err(StorageError::ImageNotFound(digest.to_string()));
        }
        Ok(images)
    }

    fn layer(&self, id: &str) -> Result<LayerRecord> {
        self.layers()?
            .into_iter()
            .find(|l| l.id == id)
            .ok_or_else(|| StorageError::LayerNotFound(id.to_string()))
    }

    fn layers_by_compressed_digest(&self, digest: &Digest) -> Result<Vec<LayerRecord>> {
        let layers: Vec<_> = self
            .layers()?
            .into_iter()
            .filter(|l| l.compressed_digest.as_ref() == Some(digest))
            .collect();
        if layers.is_empty() {
            return Err(StorageError::LayerNotFound(digest.to_string()));
        }
        Ok(layers)
    }
}

/// File name a big-data item is stored under inside the image directory.
///
/// Keys made only of `[.0-9a-z]` are used as-is; anything else is stored as
/// `=` followed by the base64 of the key.
pub fn big_data_file_name(key: &str) -> String {
    if key
        .bytes()
        .all(|b| matches!(b, b'.' | b'0'..=b'9' | b'a'..=b'z'))
    {
        key.to_string()
    } else {
        format!("={}", STANDARD.encode(key))
    }
}

/// Stored digests may use algorithms other than sha256; those are ignored.
fn parse_digest(s: &str) -> Option<Digest> {
    match Digest::parse(s) {
        Ok(digest) => Some(digest),
        Err(err) => {
            if !s.is_empty() {
                log::debug!("ignoring stored digest: {err}");
            }
            None
        }
    }
}

/// Entry in `overlay-images/images.json`.
#[derive(Debug, Deserialize)]
struct ImageJsonEntry {
    id: String,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    names: Option<Vec<String>>,
    #[serde(default)]
    layer: Option<String>,
    #[serde(default, rename = "big-data-names")]
    big_data_names: Option<Vec<String>>,
    #[serde(default, rename = "big-data-digests")]
    big_data_digests: Option<HashMap<String, String>>,
}

impl From<ImageJsonEntry> for ImageRecord {
    fn from(entry: ImageJsonEntry) -> Self {
        ImageRecord {
            id: entry.id,
            digest: entry.digest.as_deref().and_then(parse_digest),
            digests: Vec::new(),
            names: entry.names.unwrap_or_default(),
            top_layer: entry.layer.filter(|l| !l.is_empty()),
        }
        .with_digests(
            &entry.big_data_names.unwrap_or_default(),
            &entry.big_data_digests.unwrap_or_default(),
        )
    }
}

/// Entry in `overlay-layers/layers.json`.
#[derive(Debug, Deserialize)]
struct LayerJsonEntry {
    id: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default, rename = "compressed-diff-digest")]
    compressed_diff_digest: Option<String>,
    #[serde(default, rename = "compressed-size")]
    compressed_size: Option<u64>,
    #[serde(default, rename = "diff-digest")]
    diff_digest: Option<String>,
    #[serde(default, rename = "diff-size")]
    diff_size: Option<u64>,
    #[serde(default)]
    compression: u8,
}

impl From<LayerJsonEntry> for LayerRecord {
    fn from(entry: LayerJsonEntry) -> Self {
        LayerRecord {
            id: entry.id,
            parent: entry.parent.filter(|p| !p.is_empty()),
            compressed_digest: entry.compressed_diff_digest.as_deref().and_then(parse_digest),
            compressed_size: entry.compressed_size,
            uncompressed_digest: entry.diff_digest.as_deref().and_then(parse_digest),
            uncompressed_size: entry.diff_size,
            compression: entry.compression.into(),
        }
    }
}

/// Parses the contents of `images.json`.
pub fn parse_images_json(data: &[u8]) -> Result<Vec<ImageRecord>> {
    let entries: Vec<ImageJsonEntry> = serde_json::from_slice(data)?;
    Ok(entries.into_iter().map(ImageRecord::from).collect())
}

/// Parses the contents of `layers.json`.
pub fn parse_layers_json(data: &[u8]) -> Result<Vec<LayerRecord>> {
    let entries: Vec<LayerJsonEntry> = serde_json::from_slice(data)?;
    Ok(entries.into_iter().map(LayerRecord::from).collect())
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    const A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const C: &str = "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    #[test]
    fn test_big_data_file_name() {
        assert_eq!(big_data_file_name("manifest"), "manifest");
        assert_eq!(big_data_file_name("manifest-1.0"), "=bWFuaWZlc3QtMS4w");
        assert_eq!(
            big_data_file_name(&format!("sha256:{A}")),
            format!("={}", STANDARD.encode(format!("sha256:{A}")))
        );
        assert_eq!(big_data_file_name("Manifest"), "=TWFuaWZlc3Q=");
    }

    #[test]
    fn test_parse_images_json() {
        let json = format!(
            r#"[{{
                "id": "{C}",
                "digest": "sha256:{A}",
                "names": ["localhost/foo/bar:latest"],
                "layer": "top",
                "big-data-names": ["manifest-sha256:{B}", "manifest", "sha256:{C}"],
                "big-data-digests": {{
                    "manifest-sha256:{B}": "sha256:{B}",
                    "manifest": "sha256:{A}",
                    "sha256:{C}": "sha256:{C}"
                }},
                "created": "2024-01-01T00:00:00Z"
            }},
            {{"id": "dangling", "layer": ""}}]"#
        );
        let images = parse_images_json(json.as_bytes()).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].digest, Some(Digest::from_hex(A).unwrap()));
        assert_eq!(
            images[0].digests,
            vec![Digest::from_hex(A).unwrap(), Digest::from_hex(B).unwrap()]
        );
        assert_eq!(images[0].names, vec!["localhost/foo/bar:latest"]);
        assert_eq!(images[0].top_layer.as_deref(), Some("top"));
        assert_eq!(images[1].digests, vec![]);
        assert_eq!(images[1].top_layer, None);
    }

    #[test]
    fn test_digest_from_manifest_only() {
        let json = format!(
            r#"[{{"id": "x", "big-data-names": ["manifest"], "big-data-digests": {{"manifest": "sha256:{B}"}}}}]"#
        );
        let images = parse_images_json(json.as_bytes()).unwrap();
        assert_eq!(images[0].digest, Some(Digest::from_hex(B).unwrap()));
    }

    #[test]
    fn test_parse_layers_json() {
        let json = format!(
            r#"[{{
                "id": "base",
                "compressed-diff-digest": "sha256:{A}",
                "compressed-size": 1234,
                "diff-digest": "sha256:{B}",
                "diff-size": 10240,
                "compression": 2
            }},
            {{"id": "top", "parent": "base", "compressed-diff-digest": "sha512:abcd", "compression": 4}}]"#
        );
        let layers = parse_layers_json(json.as_bytes()).unwrap();
        assert_eq!(layers[0].compressed_digest, Some(Digest::from_hex(A).unwrap()));
        assert_eq!(layers[0].compressed_size, Some(1234));
        assert_eq!(layers[0].compression, LayerCompression::Gzip);
        assert_eq!(layers[0].parent, None);
        assert_eq!(layers[1].parent.as_deref(), Some("base"));
        assert_eq!(layers[1].compressed_digest, None);
        assert_eq!(layers[1].compression, LayerCompression::Zstd);
        assert!(parse_layers_json(b"{}").is_err());
    }
}
