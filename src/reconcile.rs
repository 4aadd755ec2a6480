//! Producing blob content that hashes to the digest it is requested by.
//!
//! A registry names layer blobs by the digest of the compressed tarball it was
//! pulled as, but containers-storage only keeps the unpacked layer plus enough
//! metadata to rebuild the uncompressed tar.  Its "native" diff recompresses
//! that tar with whatever compression the layer was pulled with, which matches
//! the original blob only if the same compressor produced it.  When it doesn't,
//! the tar is compressed again with the canonical gzip settings and checked
//! against the digest.  A layer that reproduces neither way is reported as a
//! missing blob.
//!
//! Manifests and image configurations are served from image big data.

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use flate2::{write::GzEncoder, Compression};
use log::debug;
use sha2::{Digest as _, Sha256};

use crate::{
    context::Context,
    digest::Digest,
    error::{Error, LookupErrors, Result, StoreContext},
    pipe::{spawn_producer, BlobReader, ContextReader, CHUNK_SIZE},
    storage::{DiffCompression, ImageStore, StorageError, MANIFEST_BIG_DATA_KEY},
};

/// Everything needed to produce a blob's content, as many times as asked.
///
/// A source never holds an open stream: each [`BlobSource::open`] starts over.
#[derive(Clone)]
pub enum BlobSource {
    /// Content already in memory.
    Memory(Arc<[u8]>),
    /// The layer's native diff, which hashes to the digest as-is.
    LayerDiff {
        store: Arc<dyn ImageStore>,
        layer_id: String,
    },
    /// The layer's uncompressed diff, compressed with [`canonical_encoder`].
    Recompressed {
        store: Arc<dyn ImageStore>,
        layer_id: String,
    },
}

impl fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobSource::Memory(data) => write!(f, "Memory({} bytes)", data.len()),
            BlobSource::LayerDiff { layer_id, .. } => write!(f, "LayerDiff({layer_id})"),
            BlobSource::Recompressed { layer_id, .. } => write!(f, "Recompressed({layer_id})"),
        }
    }
}

impl BlobSource {
    /// Starts a new, independent stream of the blob's content.
    pub fn open(&self, ctx: &Context) -> Result<BlobReader> {
        ctx.check()?;
        match self {
            BlobSource::Memory(data) => Ok(BlobReader::memory(Arc::clone(data))),
            BlobSource::LayerDiff { store, layer_id } => {
                let diff = store
                    .diff(layer_id, DiffCompression::Native)
                    .store_context(|| format!("could not get diff for layer {layer_id}"))?;
                let mut diff = ContextReader::new(ctx, diff);
                let reader = spawn_producer(ctx, "blob-diff", move |w| {
                    io::copy(&mut diff, w).map(drop)
                })?;
                Ok(BlobReader::Pipe(reader))
            }
            BlobSource::Recompressed { store, layer_id } => {
                let diff = store
                    .diff(layer_id, DiffCompression::Uncompressed)
                    .store_context(|| format!("could not get diff for layer {layer_id}"))?;
                let mut diff = ContextReader::new(ctx, diff);
                let reader = spawn_producer(ctx, "blob-recompress", move |w| {
                    let mut encoder = canonical_encoder(w);
                    let result = io::copy(&mut diff, &mut encoder).and_then(|_| encoder.try_finish());
                    if result.is_err() {
                        // dropping the encoder would still write a trailer
                        encoder.get_mut().abort();
                    }
                    result
                })?;
                Ok(BlobReader::Pipe(reader))
            }
        }
    }
}

/// The gzip settings layers are recompressed with: flate2 at its default
/// level, no file name, zero modification time.
///
/// Other gzip implementations (Go's `compress/gzip` among them) emit different
/// deflate streams, so only blobs that flate2 compressed with these settings
/// are reproduced byte for byte.
pub fn canonical_encoder<W: Write>(writer: W) -> GzEncoder<W> {
    GzEncoder::new(writer, Compression::default())
}

/// Reads `reader` to the end, hashing it.
fn measure(ctx: &Context, mut reader: impl Read) -> Result<(Digest, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        ctx.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // a cancelled producer reports it in-band
                ctx.check()?;
                return Err(Error::Io(e));
            }
        };
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((Digest::from_hasher(hasher), size))
}

/// [`measure`], reporting stream failures as failures of the layer's store.
fn measure_layer(ctx: &Context, reader: impl Read, layer_id: &str) -> Result<(Digest, u64)> {
    measure(ctx, reader).map_err(|e| match e {
        Error::Io(e) => Error::Store {
            context: format!("could not read diff of layer {layer_id}"),
            source: StorageError::Io(e),
        },
        other => other,
    })
}

/// Sizes the layer's content for `digest`, or records why it can't be served.
fn from_layer(
    ctx: &Context,
    store: &Arc<dyn ImageStore>,
    digest: &Digest,
    layer_id: &str,
    attempts: &mut LookupErrors,
) -> Result<Option<(BlobSource, u64)>> {
    ctx.check()?;
    let native = store
        .diff(layer_id, DiffCompression::Native)
        .store_context(|| format!("could not get diff for blob {digest} (layer {layer_id})"))?;
    let (actual, size) = measure_layer(ctx, native, layer_id)?;
    if actual == *digest {
        debug!("blob {digest}: native diff of layer {layer_id} matches ({size} bytes)");
        let source = BlobSource::LayerDiff {
            store: Arc::clone(store),
            layer_id: layer_id.to_string(),
        };
        return Ok(Some((source, size)));
    }

    debug!("blob {digest}: native diff of layer {layer_id} is {actual}, recompressing");
    let source = BlobSource::Recompressed {
        store: Arc::clone(store),
        layer_id: layer_id.to_string(),
    };
    let (actual, size) = measure_layer(ctx, source.open(ctx)?, layer_id)?;
    if actual != *digest {
        debug!("blob {digest}: recompressed layer {layer_id} is {actual}");
        attempts.push(format_args!(
            "layer {layer_id} does not reproduce blob {digest} (recompressed to {actual})"
        ));
        return Ok(None);
    }
    debug!("blob {digest}: recompressed layer {layer_id} matches ({size} bytes)");
    Ok(Some((source, size)))
}

fn from_memory(data: Vec<u8>) -> (BlobSource, u64) {
    let size = data.len() as u64;
    (BlobSource::Memory(data.into()), size)
}

/// Finds the content for `digest` and its exact size.
///
/// Tried in order: a layer with that compressed digest, the manifest of an
/// image with that digest, and the configuration of the image whose ID is the
/// digest.  Must run on a thread that may block.
pub fn reconcile(
    ctx: &Context,
    store: &Arc<dyn ImageStore>,
    digest: &Digest,
) -> Result<(BlobSource, u64)> {
    let mut attempts = LookupErrors::default();

    ctx.check()?;
    match store.layers_by_compressed_digest(digest) {
        Ok(layers) => {
            if let Some(layer) = layers.first() {
                if let Some(found) = from_layer(ctx, store, digest, &layer.id, &mut attempts)? {
                    return Ok(found);
                }
            }
        }
        Err(err) => attempts.push(err),
    }

    ctx.check()?;
    match store.images_by_digest(digest) {
        Ok(images) => {
            for image in images {
                ctx.check()?;
                match store.image_big_data(&image.id, MANIFEST_BIG_DATA_KEY) {
                    Ok(data) => {
                        debug!("blob {digest}: manifest of image {}", image.id);
                        return Ok(from_memory(data));
                    }
                    Err(err) => attempts.push(format_args!(
                        "could not get manifest data for blob {digest}: {err}"
                    )),
                }
            }
        }
        Err(err) => attempts.push(err),
    }

    ctx.check()?;
    match store.image(digest.hex()) {
        Ok(image) => {
            ctx.check()?;
            match store.image_big_data(&image.id, &digest.to_string()) {
                Ok(data) => {
                    debug!("blob {digest}: configuration of image {}", image.id);
                    return Ok(from_memory(data));
                }
                Err(err) => attempts.push(format_args!(
                    "could not get config data for blob {digest}: {err}"
                )),
            }
        }
        Err(err) => attempts.push(err),
    }

    Err(Error::BlobNotFound {
        digest: digest.clone(),
        attempts,
    })
}

#[cfg(test)]
mod test {
    use std::{
        io::{Cursor, Write},
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::{Duration, Instant},
    };

    use flate2::GzBuilder;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        storage::{ImageRecord, LayerRecord, MemoryStore},
        test::canonical_gzip,
    };

    fn tarball() -> Vec<u8> {
        b"pretend this is a tar stream\n".repeat(10_000)
    }

    fn layer(id: &str, compressed_digest: &Digest) -> LayerRecord {
        LayerRecord {
            id: id.into(),
            compressed_digest: Some(compressed_digest.clone()),
            ..Default::default()
        }
    }

    fn read_all(source: &BlobSource) -> Vec<u8> {
        let mut out = vec![];
        source
            .open(&Context::new())
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn as_dyn(store: &Arc<MemoryStore>) -> Arc<dyn ImageStore> {
        Arc::clone(store) as Arc<dyn ImageStore>
    }

    #[test]
    fn test_native_match() {
        let tar = tarball();
        let native = canonical_gzip(&tar);
        let digest = Digest::of(&native);
        let mut store = MemoryStore::new();
        store.add_layer(layer("l1", &digest), native.clone(), tar);
        let store = Arc::new(store);

        let (source, size) = reconcile(&Context::new(), &as_dyn(&store), &digest).unwrap();
        assert!(matches!(source, BlobSource::LayerDiff { .. }));
        assert_eq!(size, native.len() as u64);
        assert_eq!(read_all(&source), native);
    }

    #[test]
    fn test_recompressed() {
        let tar = tarball();
        let canonical = canonical_gzip(&tar);
        let digest = Digest::of(&canonical);

        // same deflate stream, different header: the native diff won't match
        let mut encoder = GzBuilder::new().mtime(1).write(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let native = encoder.finish().unwrap();
        assert!(Digest::of(&native) != digest);

        let mut store = MemoryStore::new();
        store.add_layer(layer("l1", &digest), native, tar);
        let store = Arc::new(store);

        let (source, size) = reconcile(&Context::new(), &as_dyn(&store), &digest).unwrap();
        assert!(matches!(source, BlobSource::Recompressed { .. }));
        assert_eq!(size, canonical.len() as u64);

        // every open starts over and yields the same bytes
        let first = read_all(&source);
        let second = read_all(&source);
        assert_eq!(Digest::of(&first), digest);
        assert_eq!(first, second);
    }

    #[test]
    fn test_irreproducible() {
        let tar = tarball();
        let digest = Digest::of(b"something else entirely");
        let mut store = MemoryStore::new();
        store.add_layer(layer("l1", &digest), canonical_gzip(&tar), tar);
        let store = Arc::new(store);

        let err = reconcile(&Context::new(), &as_dyn(&store), &digest).unwrap_err();
        assert!(err.is_not_found(), "{err:?}");
        let Error::BlobNotFound { attempts, .. } = err else {
            panic!("expected BlobNotFound");
        };
        assert!(attempts.0[0].starts_with("layer l1 does not reproduce"), "{attempts}");
    }

    #[test]
    fn test_broken_layer() {
        let tar = tarball();
        let digest = Digest::of(b"needs recompression");
        let mut store = MemoryStore::new();
        store
            .add_layer(layer("l1", &digest), canonical_gzip(&tar), tar)
            .break_layer("l1");
        let store = Arc::new(store);

        let err = reconcile(&Context::new(), &as_dyn(&store), &digest).unwrap_err();
        assert!(matches!(err, Error::Store { .. }), "{err:?}");
    }

    #[test]
    fn test_manifest_and_config() {
        let manifest = br#"{"schemaVersion":2}"#.to_vec();
        let manifest_digest = Digest::of(&manifest);
        let config = br#"{"os":"linux"}"#.to_vec();
        let config_digest = Digest::of(&config);

        let mut store = MemoryStore::new();
        store
            .add_image(ImageRecord {
                id: config_digest.hex().to_string(),
                digest: Some(manifest_digest.clone()),
                digests: vec![manifest_digest.clone()],
                names: vec!["foo/bar".into()],
                top_layer: None,
            })
            .set_big_data(config_digest.hex(), "manifest", manifest.clone())
            .set_big_data(config_digest.hex(), &config_digest.to_string(), config.clone());
        let store = as_dyn(&Arc::new(store));

        let (source, size) = reconcile(&Context::new(), &store, &manifest_digest).unwrap();
        assert_eq!(size, manifest.len() as u64);
        assert_eq!(read_all(&source), manifest);

        let (source, size) = reconcile(&Context::new(), &store, &config_digest).unwrap();
        assert_eq!(size, config.len() as u64);
        assert_eq!(read_all(&source), config);
    }

    #[test]
    fn test_not_found_aggregates() {
        let store = as_dyn(&Arc::new(MemoryStore::new()));
        let digest = Digest::of(b"missing");
        let err = reconcile(&Context::new(), &store, &digest).unwrap_err();
        assert!(err.is_not_found());
        let Error::BlobNotFound { attempts, .. } = err else {
            panic!("expected BlobNotFound");
        };
        assert_eq!(attempts.0.len(), 3);
    }

    /// One layer whose uncompressed diff never ends.
    #[derive(Debug)]
    struct EndlessStore {
        digest: Digest,
        dropped: Arc<AtomicBool>,
    }

    struct EndlessDiff(Arc<AtomicBool>);

    impl Read for EndlessDiff {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(1));
            out.fill(0);
            Ok(out.len())
        }
    }

    impl Drop for EndlessDiff {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl ImageStore for EndlessStore {
        fn images(&self) -> crate::storage::Result<Vec<ImageRecord>> {
            Ok(vec![])
        }

        fn layers(&self) -> crate::storage::Result<Vec<LayerRecord>> {
            Ok(vec![layer("l1", &self.digest)])
        }

        fn image_big_data(&self, image_id: &str, _: &str) -> crate::storage::Result<Vec<u8>> {
            Err(StorageError::ImageNotFound(image_id.to_string()))
        }

        fn diff(
            &self,
            _: &str,
            compression: DiffCompression,
        ) -> crate::storage::Result<Box<dyn Read + Send>> {
            Ok(match compression {
                DiffCompression::Native => Box::new(Cursor::new(b"not the blob".to_vec())),
                DiffCompression::Uncompressed => Box::new(EndlessDiff(Arc::clone(&self.dropped))),
            })
        }
    }

    #[test]
    fn test_cancel_while_sizing() {
        let dropped = Arc::new(AtomicBool::new(false));
        let digest = Digest::of(b"never produced");
        let store: Arc<dyn ImageStore> = Arc::new(EndlessStore {
            digest: digest.clone(),
            dropped: Arc::clone(&dropped),
        });
        let ctx = Context::new();
        let canceller = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                ctx.cancel();
                Instant::now()
            })
        };

        let err = reconcile(&ctx, &store, &digest).unwrap_err();
        let cancelled_at = canceller.join().unwrap();
        assert!(matches!(err, Error::Cancelled), "{err:?}");
        assert!(cancelled_at.elapsed() < Duration::from_millis(250));

        // the producer lets go of the diff promptly, too
        while !dropped.load(Ordering::SeqCst) {
            assert!(cancelled_at.elapsed() < Duration::from_millis(250));
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_cancelled_before_queries() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Context::new();
        ctx.cancel();
        let err = reconcile(&ctx, &as_dyn(&store), &Digest::of(b"x")).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(store.queries(), 0);
    }
}
