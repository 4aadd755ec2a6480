//! containers-storage overlay driver layout, read through `cap_std` handles.
//!
//! ```text
//! /var/lib/containers/storage/
//! +-- overlay/            # Layer data
//! |   +-- <layer-id>/
//! |   |   +-- diff/       # Layer file contents
//! |   |   +-- link        # Short link ID
//! |   |   +-- lower       # Parent layer references
//! |   +-- l/              # Short link directory (symlinks)
//! +-- overlay-layers/
//! |   +-- layers.json
//! |   +-- <layer-id>.tar-split.gz
//! +-- overlay-images/
//!     +-- images.json
//!     +-- <image-id>/
//!         +-- manifest    # Image manifest
//!         +-- =<base64>   # Other big-data items
//! ```

use std::{
    env,
    io::{self, Read},
    path::{Path, PathBuf},
};

use cap_std::{ambient_authority, fs::Dir};
use flate2::{read::GzEncoder, Compression};

use super::{
    big_data_file_name, parse_images_json, parse_layers_json,
    tar_split::TarSplitReader,
    DiffCompression, ImageRecord, ImageStore, LayerCompression, LayerRecord, Result, StorageError,
};

/// Read-only handle on an overlay storage root.
#[derive(Debug)]
pub struct OverlayStorage {
    root_dir: Dir,
}

impl OverlayStorage {
    /// Opens storage at `root`, checking that it looks like an overlay store.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root_path = root.as_ref();
        let root_dir = Dir::open_ambient_dir(root_path, ambient_authority()).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::RootNotFound(root_path.to_path_buf())
            } else {
                StorageError::Io(e)
            }
        })?;
        Self::from_root_dir(root_dir)
    }

    /// Wraps an already-open storage root.
    pub fn from_root_dir(root_dir: Dir) -> Result<Self> {
        for dir_name in ["overlay", "overlay-layers", "overlay-images"] {
            if !root_dir.try_exists(dir_name)? {
                return Err(StorageError::InvalidStorage(format!(
                    "missing required directory: {dir_name}"
                )));
            }
        }
        Ok(Self { root_dir })
    }

    /// Opens the first usable storage root from [`Self::default_search_paths`].
    pub fn discover() -> Result<Self> {
        for path in Self::default_search_paths() {
            match Self::open(&path) {
                Ok(storage) => return Ok(storage),
                Err(err) => log::debug!("skipping {}: {err}", path.display()),
            }
        }
        Err(StorageError::InvalidStorage(
            "no valid storage location found in the default locations".to_string(),
        ))
    }

    /// Rootless locations first, then the system store.
    pub fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(xdg_data) = env::var("XDG_DATA_HOME") {
            paths.push(PathBuf::from(xdg_data).join("containers/storage"));
        }
        if let Ok(home) = env::var("HOME") {
            paths.push(PathBuf::from(home).join(".local/share/containers/storage"));
        }
        paths.push(PathBuf::from("/var/lib/containers/storage"));
        paths
    }

    pub fn root_dir(&self) -> &Dir {
        &self.root_dir
    }

    /// Contents of an index file, or `None` if the store has never written one.
    fn read_index(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.root_dir.read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

impl ImageStore for OverlayStorage {
    fn images(&self) -> Result<Vec<ImageRecord>> {
        match self.read_index("overlay-images/images.json")? {
            Some(data) => parse_images_json(&data),
            None => Ok(Vec::new()),
        }
    }

    fn layers(&self) -> Result<Vec<LayerRecord>> {
        match self.read_index("overlay-layers/layers.json")? {
            Some(data) => parse_layers_json(&data),
            None => Ok(Vec::new()),
        }
    }

    fn image_big_data(&self, image_id: &str, key: &str) -> Result<Vec<u8>> {
        let image_dir = self
            .root_dir
            .open_dir(format!("overlay-images/{image_id}"))
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StorageError::ImageNotFound(image_id.to_string()),
                _ => StorageError::Io(e),
            })?;
        image_dir.read(big_data_file_name(key)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::BigDataNotFound {
                image: image_id.to_string(),
                key: key.to_string(),
            },
            _ => StorageError::Io(e),
        })
    }

    fn diff(&self, layer_id: &str, compression: DiffCompression) -> Result<Box<dyn Read + Send>> {
        let tar = TarSplitReader::open(&self.root_dir, layer_id)?;
        if compression == DiffCompression::Uncompressed {
            return Ok(Box::new(tar));
        }
        match self.layer(layer_id)?.compression {
            LayerCompression::Uncompressed => Ok(Box::new(tar)),
            LayerCompression::Gzip => Ok(Box::new(GzEncoder::new(tar, Compression::fast()))),
            LayerCompression::Zstd => Ok(Box::new(zstd::stream::read::Encoder::new(tar, 0)?)),
            LayerCompression::Bzip2 => Err(StorageError::UnsupportedCompression("bzip2")),
            LayerCompression::Xz => Err(StorageError::UnsupportedCompression("xz")),
            LayerCompression::Unknown(_) => Err(StorageError::UnsupportedCompression("unknown")),
        }
    }
}
