//! Bounds how many operations reach a [`StorageDriver`] at once.

use std::pin::Pin;

use tokio::{
    io::AsyncWrite,
    sync::{Semaphore, SemaphorePermit},
};

use crate::{
    context::Context,
    driver::{StorageDriver, WalkControl},
    error::Result,
    node::FileInfo,
    pipe::BlobReader,
};

/// Wraps a driver so that at most `limit` operations run on it concurrently.
///
/// A permit is held for the whole of each operation, and waiting for one
/// stops as soon as the caller's context ends.  Streams returned by
/// [`StorageDriver::reader`] are read after the permit is released.
#[derive(Debug)]
pub struct Regulator<D> {
    inner: D,
    available: Semaphore,
}

impl<D: StorageDriver> Regulator<D> {
    pub fn new(inner: D, limit: usize) -> Self {
        Regulator {
            inner,
            available: Semaphore::new(limit.max(1)),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    async fn enter(&self, ctx: &Context) -> Result<SemaphorePermit<'_>> {
        ctx.check()?;
        tokio::select! {
            biased;
            permit = self.available.acquire() => Ok(permit?),
            err = ctx.done() => Err(err),
        }
    }
}

impl<D: StorageDriver> StorageDriver for Regulator<D> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get_content(&self, ctx: &Context, path: &str) -> Result<Vec<u8>> {
        let _permit = self.enter(ctx).await?;
        self.inner.get_content(ctx, path).await
    }

    async fn put_content(&self, ctx: &Context, path: &str, content: &[u8]) -> Result<()> {
        let _permit = self.enter(ctx).await?;
        self.inner.put_content(ctx, path, content).await
    }

    async fn reader(&self, ctx: &Context, path: &str, offset: u64) -> Result<BlobReader> {
        let _permit = self.enter(ctx).await?;
        self.inner.reader(ctx, path, offset).await
    }

    async fn writer(
        &self,
        ctx: &Context,
        path: &str,
        append: bool,
    ) -> Result<Pin<Box<dyn AsyncWrite + Send>>> {
        let _permit = self.enter(ctx).await?;
        self.inner.writer(ctx, path, append).await
    }

    async fn stat(&self, ctx: &Context, path: &str) -> Result<FileInfo> {
        let _permit = self.enter(ctx).await?;
        self.inner.stat(ctx, path).await
    }

    async fn list(&self, ctx: &Context, path: &str) -> Result<Vec<String>> {
        let _permit = self.enter(ctx).await?;
        self.inner.list(ctx, path).await
    }

    async fn move_path(&self, ctx: &Context, source: &str, dest: &str) -> Result<()> {
        let _permit = self.enter(ctx).await?;
        self.inner.move_path(ctx, source, dest).await
    }

    async fn delete(&self, ctx: &Context, path: &str) -> Result<()> {
        let _permit = self.enter(ctx).await?;
        self.inner.delete(ctx, path).await
    }

    async fn url_for(&self, ctx: &Context, path: &str) -> Result<String> {
        let _permit = self.enter(ctx).await?;
        self.inner.url_for(ctx, path).await
    }

    async fn walk<F>(&self, ctx: &Context, path: &str, visitor: F) -> Result<()>
    where
        F: FnMut(&FileInfo) -> Result<WalkControl> + Send,
    {
        let _permit = self.enter(ctx).await?;
        self.inner.walk(ctx, path, visitor).await
    }
}
