//! An [`ImageStore`] kept entirely in memory.

use std::{
    collections::HashMap,
    io::{self, Cursor, Read},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use super::{DiffCompression, ImageRecord, ImageStore, LayerRecord, Result, StorageError};

#[derive(Debug)]
struct LayerData {
    native: Arc<[u8]>,
    uncompressed: Arc<[u8]>,
    broken: bool,
}

/// Images, layers and their content, held in memory.
///
/// Every [`ImageStore`] call is counted; see [`MemoryStore::queries`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    images: Vec<ImageRecord>,
    layers: Vec<LayerRecord>,
    big_data: HashMap<(String, String), Arc<[u8]>>,
    content: HashMap<String, LayerData>,
    queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, image: ImageRecord) -> &mut Self {
        self.images.push(image);
        self
    }

    pub fn set_big_data(&mut self, image_id: &str, key: &str, data: impl Into<Arc<[u8]>>) -> &mut Self {
        self.big_data
            .insert((image_id.to_string(), key.to_string()), data.into());
        self
    }

    /// Adds a layer with its native (as-pulled) and uncompressed content.
    pub fn add_layer(
        &mut self,
        layer: LayerRecord,
        native: impl Into<Arc<[u8]>>,
        uncompressed: impl Into<Arc<[u8]>>,
    ) -> &mut Self {
        self.content.insert(
            layer.id.clone(),
            LayerData {
                native: native.into(),
                uncompressed: uncompressed.into(),
                broken: false,
            },
        );
        self.layers.push(layer);
        self
    }

    /// Makes every diff of the layer fail after its content instead of ending.
    pub fn break_layer(&mut self, layer_id: &str) -> &mut Self {
        if let Some(data) = self.content.get_mut(layer_id) {
            data.broken = true;
        }
        self
    }

    /// Number of [`ImageStore`] calls made so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }
}

impl ImageStore for MemoryStore {
    fn images(&self) -> Result<Vec<ImageRecord>> {
        self.count();
        Ok(self.images.clone())
    }

    fn layers(&self) -> Result<Vec<LayerRecord>> {
        self.count();
        Ok(self.layers.clone())
    }

    fn image_big_data(&self, image_id: &str, key: &str) -> Result<Vec<u8>> {
        self.count();
        if !self.images.iter().any(|i| i.id == image_id) {
            return Err(StorageError::ImageNotFound(image_id.to_string()));
        }
        self.big_data
            .get(&(image_id.to_string(), key.to_string()))
            .map(|data| data.to_vec())
            .ok_or_else(|| StorageError::BigDataNotFound {
                image: image_id.to_string(),
                key: key.to_string(),
            })
    }

    fn diff(&self, layer_id: &str, compression: DiffCompression) -> Result<Box<dyn Read + Send>> {
        self.count();
        let data = self
            .content
            .get(layer_id)
            .ok_or_else(|| StorageError::LayerNotFound(layer_id.to_string()))?;
        let bytes = match compression {
            DiffCompression::Native => data.native.clone(),
            DiffCompression::Uncompressed => data.uncompressed.clone(),
        };
        if data.broken {
            return Ok(Box::new(Cursor::new(bytes).chain(BrokenReader)));
        }
        Ok(Box::new(Cursor::new(bytes)))
    }
}

struct BrokenReader;

impl Read for BrokenReader {
    fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::other("layer content is corrupt"))
    }
}
