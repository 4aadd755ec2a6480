//! The storage driver interface and its containers-storage implementation.
//!
//! Every operation resolves its path, then does the store work on tokio's
//! blocking pool.  Only reading is supported: every mutating operation fails
//! with [`Error::Unsupported`] without looking at the store.

use std::{io, pin::Pin, sync::Arc};

use log::{info, trace};
use tokio::io::{AsyncReadExt, AsyncWrite};

use crate::{
    context::Context,
    error::{Error, Result},
    node::FileInfo,
    path::Node,
    pipe::BlobReader,
    store::Store,
};

/// Name the driver registers under.
pub const DRIVER_NAME: &str = "containerstorage";

/// Returned by a walk visitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Don't descend into this directory.  For a file, skip its remaining siblings.
    SkipDir,
}

/// A registry storage backend.
#[allow(async_fn_in_trait)]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// The whole content of a file.
    async fn get_content(&self, ctx: &Context, path: &str) -> Result<Vec<u8>>;

    async fn put_content(&self, ctx: &Context, path: &str, content: &[u8]) -> Result<()>;

    /// A stream of a file's content starting `offset` bytes in.
    async fn reader(&self, ctx: &Context, path: &str, offset: u64) -> Result<BlobReader>;

    async fn writer(
        &self,
        ctx: &Context,
        path: &str,
        append: bool,
    ) -> Result<Pin<Box<dyn AsyncWrite + Send>>>;

    async fn stat(&self, ctx: &Context, path: &str) -> Result<FileInfo>;

    /// Full paths of a directory's children.
    async fn list(&self, ctx: &Context, path: &str) -> Result<Vec<String>>;

    async fn move_path(&self, ctx: &Context, source: &str, dest: &str) -> Result<()>;

    async fn delete(&self, ctx: &Context, path: &str) -> Result<()>;

    async fn url_for(&self, ctx: &Context, path: &str) -> Result<String>;

    /// Visits everything below `path`; see [`walk_fallback`].
    async fn walk<F>(&self, ctx: &Context, path: &str, visitor: F) -> Result<()>
    where
        F: FnMut(&FileInfo) -> Result<WalkControl> + Send;
}

/// Walks a tree using only `list` and `stat`.
///
/// Children are visited in sorted order, depth first, parents before their
/// children.  A child that disappears between being listed and being looked
/// at is skipped.
pub async fn walk_fallback<D, F>(driver: &D, ctx: &Context, path: &str, mut visitor: F) -> Result<()>
where
    D: StorageDriver + ?Sized,
    F: FnMut(&FileInfo) -> Result<WalkControl>,
{
    let mut stack = vec![sorted(driver.list(ctx, path).await?).into_iter()];
    while let Some(level) = stack.last_mut() {
        let Some(child) = level.next() else {
            stack.pop();
            continue;
        };
        let info = match driver.stat(ctx, &child).await {
            Ok(info) => info,
            Err(err) if err.is_not_found() => {
                info!("ignoring deleted path {child}");
                continue;
            }
            Err(err) => return Err(err),
        };
        match visitor(&info)? {
            WalkControl::Continue if info.is_dir => {
                stack.push(sorted(driver.list(ctx, &child).await?).into_iter());
            }
            WalkControl::Continue => {}
            WalkControl::SkipDir if info.is_dir => {}
            WalkControl::SkipDir => {
                stack.pop();
            }
        }
    }
    Ok(())
}

fn sorted(mut paths: Vec<String>) -> Vec<String> {
    paths.sort();
    paths
}

/// Serves a [`Store`] as a read-only registry storage tree.
#[derive(Debug)]
pub struct ContainerStorageDriver<S: Store + ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized> Clone for ContainerStorageDriver<S> {
    fn clone(&self) -> Self {
        ContainerStorageDriver {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store + ?Sized> ContainerStorageDriver<S> {
    pub fn new(store: Arc<S>) -> Self {
        ContainerStorageDriver { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Resolves `path` and runs `op` on the blocking pool.
    async fn run<T, F>(&self, ctx: &Context, path: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Context, &S, Node) -> Result<T> + Send + 'static,
    {
        ctx.check()?;
        let node = Node::resolve(path)?;
        let store = Arc::clone(&self.store);
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || op(&ctx, &*store, node)).await?
    }
}

impl<S: Store + ?Sized> StorageDriver for ContainerStorageDriver<S> {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn get_content(&self, ctx: &Context, path: &str) -> Result<Vec<u8>> {
        let mut reader = self.reader(ctx, path, 0).await?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        Ok(content)
    }

    async fn put_content(&self, _ctx: &Context, _path: &str, _content: &[u8]) -> Result<()> {
        Err(Error::Unsupported("PutContent"))
    }

    async fn reader(&self, ctx: &Context, path: &str, offset: u64) -> Result<BlobReader> {
        trace!("reader {path} at {offset}");
        self.run(ctx, path, move |ctx, store, node| {
            let mut reader = node.read(ctx, store)?;
            if offset > 0 {
                let mut skipped = io::Read::take(io::Read::by_ref(&mut reader), offset);
                io::copy(&mut skipped, &mut io::sink())?;
            }
            Ok(reader)
        })
        .await
    }

    async fn writer(
        &self,
        _ctx: &Context,
        _path: &str,
        _append: bool,
    ) -> Result<Pin<Box<dyn AsyncWrite + Send>>> {
        Err(Error::Unsupported("Writer"))
    }

    async fn stat(&self, ctx: &Context, path: &str) -> Result<FileInfo> {
        trace!("stat {path}");
        self.run(ctx, path, |ctx, store, node| node.stat(ctx, store))
            .await
    }

    async fn list(&self, ctx: &Context, path: &str) -> Result<Vec<String>> {
        trace!("list {path}");
        self.run(ctx, path, |ctx, store, node| node.list(ctx, store))
            .await
    }

    async fn move_path(&self, _ctx: &Context, _source: &str, _dest: &str) -> Result<()> {
        Err(Error::Unsupported("Move"))
    }

    async fn delete(&self, _ctx: &Context, _path: &str) -> Result<()> {
        Err(Error::Unsupported("Delete"))
    }

    async fn url_for(&self, _ctx: &Context, _path: &str) -> Result<String> {
        Err(Error::Unsupported("URLFor"))
    }

    async fn walk<F>(&self, ctx: &Context, path: &str, visitor: F) -> Result<()>
    where
        F: FnMut(&FileInfo) -> Result<WalkControl> + Send,
    {
        walk_fallback(self, ctx, path, visitor).await
    }
}
