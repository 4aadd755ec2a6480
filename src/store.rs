//! The narrow, read-only view of the image store that the registry layout is
//! built from.

use std::{collections::BTreeSet, sync::Arc};

use crate::{
    context::Context,
    digest::Digest,
    error::{Error, Result, StoreContext},
    reconcile::{reconcile, BlobSource},
    storage::{ImageStore, StorageError},
};

/// Layer chains deeper than this are treated as corrupt.
const MAX_DEPTH: usize = 500;

/// What the registry layout needs to know about the store.
///
/// Every call reflects the store's state at the time of the call.
pub trait Store: Send + Sync + 'static {
    /// Repository names.
    fn list_repos(&self) -> Result<Vec<String>>;

    /// Manifest digests of the images named `repo`.
    fn list_repo_revisions(&self, repo: &str) -> Result<Vec<Digest>>;

    /// Compressed digests of the layers of the images named `repo`, topmost first.
    fn list_repo_layers(&self, repo: &str) -> Result<Vec<Digest>>;

    /// Every digest that can be served as a blob listing entry.
    fn list_blobs(&self) -> Result<Vec<Digest>>;

    /// The content of a blob and its exact size.  May block.
    fn get_blob(&self, ctx: &Context, digest: &Digest) -> Result<(BlobSource, u64)>;
}

/// [`Store`] over containers-storage.
#[derive(Clone, Debug)]
pub struct ContainerStore {
    store: Arc<dyn ImageStore>,
}

impl ContainerStore {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        ContainerStore { store }
    }

    pub fn image_store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    fn layer_chain(&self, image_id: &str, top_layer: &str) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        let mut next = Some(top_layer.to_string());
        while let Some(layer_id) = next {
            if digests.len() >= MAX_DEPTH {
                return Err(Error::Store {
                    context: format!("walking layers of image {image_id}"),
                    source: StorageError::InvalidStorage(format!(
                        "layer chain exceeds maximum depth of {MAX_DEPTH}"
                    )),
                });
            }
            let layer = self
                .store
                .layer(&layer_id)
                .store_context(|| format!("walking layers of image {image_id}"))?;
            match layer.compressed_digest {
                Some(digest) => digests.push(digest),
                None => log::debug!("layer {layer_id} has no compressed digest"),
            }
            next = layer.parent;
        }
        Ok(digests)
    }
}

impl Store for ContainerStore {
    fn list_repos(&self) -> Result<Vec<String>> {
        let images = self
            .store
            .images()
            .store_context(|| "listing repositories")?;
        let names: BTreeSet<String> = images.into_iter().flat_map(|i| i.names).collect();
        Ok(names.into_iter().collect())
    }

    fn list_repo_revisions(&self, repo: &str) -> Result<Vec<Digest>> {
        let images = self
            .store
            .images()
            .store_context(|| format!("listing revisions of {repo}"))?;
        Ok(images
            .into_iter()
            .filter(|i| i.names.iter().any(|n| n == repo))
            .flat_map(|i| i.digests)
            .collect())
    }

    fn list_repo_layers(&self, repo: &str) -> Result<Vec<Digest>> {
        let images = self
            .store
            .images()
            .store_context(|| format!("listing layers of {repo}"))?;
        let mut digests = Vec::new();
        for image in images.iter().filter(|i| i.names.iter().any(|n| n == repo)) {
            if let Some(top) = &image.top_layer {
                digests.extend(self.layer_chain(&image.id, top)?);
            }
        }
        Ok(digests)
    }

    fn list_blobs(&self) -> Result<Vec<Digest>> {
        let images = self.store.images().store_context(|| "listing blobs")?;
        let layers = self.store.layers().store_context(|| "listing blobs")?;
        let mut digests: Vec<Digest> = images.into_iter().flat_map(|i| i.digests).collect();
        digests.extend(layers.into_iter().filter_map(|l| l.compressed_digest));
        Ok(digests)
    }

    fn get_blob(&self, ctx: &Context, digest: &Digest) -> Result<(BlobSource, u64)> {
        reconcile(ctx, &self.store, digest)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::storage::{ImageRecord, LayerRecord, MemoryStore};

    fn digest(n: u8) -> Digest {
        Digest::of([n])
    }

    fn layer(id: &str, parent: Option<&str>, n: u8) -> LayerRecord {
        LayerRecord {
            id: id.into(),
            parent: parent.map(Into::into),
            compressed_digest: Some(digest(n)),
            ..Default::default()
        }
    }

    fn image(id: &str, names: &[&str], top: &str, manifests: &[u8]) -> ImageRecord {
        ImageRecord {
            id: id.into(),
            digest: manifests.first().map(|n| digest(*n)),
            digests: manifests.iter().map(|n| digest(*n)).collect(),
            names: names.iter().map(|n| n.to_string()).collect(),
            top_layer: Some(top.into()),
        }
    }

    fn fixture() -> ContainerStore {
        let mut store = MemoryStore::new();
        store
            .add_layer(layer("base", None, 1), Vec::<u8>::new(), Vec::<u8>::new())
            .add_layer(layer("mid", Some("base"), 2), Vec::<u8>::new(), Vec::<u8>::new())
            .add_layer(layer("top", Some("mid"), 3), Vec::<u8>::new(), Vec::<u8>::new())
            .add_layer(
                LayerRecord {
                    id: "local".into(),
                    parent: Some("base".into()),
                    ..Default::default()
                },
                Vec::<u8>::new(),
                Vec::<u8>::new(),
            )
            .add_image(image("i1", &["foo/bar", "foo/baz"], "top", &[10, 11]))
            .add_image(image("i2", &["foo/bar"], "local", &[12]));
        ContainerStore::new(Arc::new(store))
    }

    #[test]
    fn test_listings() {
        let store = fixture();
        assert_eq!(store.list_repos().unwrap(), vec!["foo/bar", "foo/baz"]);
        assert_eq!(
            store.list_repo_revisions("foo/bar").unwrap(),
            vec![digest(10), digest(11), digest(12)]
        );
        assert_eq!(store.list_repo_revisions("foo/baz").unwrap(), vec![digest(10), digest(11)]);
        assert_eq!(store.list_repo_revisions("nope").unwrap(), vec![]);
        assert_eq!(
            store.list_repo_layers("foo/baz").unwrap(),
            vec![digest(3), digest(2), digest(1)]
        );
        // layers without a compressed digest are skipped
        assert_eq!(
            store.list_repo_layers("foo/bar").unwrap(),
            vec![digest(3), digest(2), digest(1), digest(1)]
        );
        assert_eq!(
            store.list_blobs().unwrap(),
            vec![digest(10), digest(11), digest(12), digest(1), digest(2), digest(3)]
        );
    }

    #[test]
    fn test_layer_cycle() {
        let mut store = MemoryStore::new();
        store
            .add_layer(layer("a", Some("b"), 1), Vec::<u8>::new(), Vec::<u8>::new())
            .add_layer(layer("b", Some("a"), 2), Vec::<u8>::new(), Vec::<u8>::new())
            .add_image(image("i", &["loop"], "a", &[3]));
        let store = ContainerStore::new(Arc::new(store));
        assert!(matches!(
            store.list_repo_layers("loop"),
            Err(Error::Store { .. })
        ));
    }

    #[test]
    fn test_missing_layer() {
        let mut store = MemoryStore::new();
        store.add_image(image("i", &["dangling"], "gone", &[3]));
        let store = ContainerStore::new(Arc::new(store));
        let err = store.list_repo_layers("dangling").unwrap_err();
        assert!(matches!(err, Error::Store { source: StorageError::LayerNotFound(_), .. }));
    }
}
