//! A bounded in-process pipe with the producer running on its own thread.
//!
//! Blob content is produced by blocking code (reading layer files, running a
//! compressor) and consumed either by blocking readers or by async ones.  The
//! producer pushes chunks into a bounded channel; once it stops, for whatever
//! reason, its end of the channel is dropped.  A failure is sent down the
//! channel before that, so the reader sees it as an error and never as a short
//! read followed by EOF.

use std::{
    io::{self, Cursor, Read, Write},
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{ready, Context as TaskContext, Poll},
};

use tokio::{
    io::{AsyncRead, ReadBuf},
    sync::mpsc,
};

use crate::context::Context;

/// Size of the chunks handed from producer to consumer.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks in flight before the producer blocks.
const PIPE_DEPTH: usize = 4;

type Chunk = io::Result<Vec<u8>>;

/// The producer's end.  Buffers up to [`CHUNK_SIZE`] bytes before each send.
pub struct PipeWriter {
    tx: mpsc::Sender<Chunk>,
    ctx: Context,
    buf: Vec<u8>,
    aborted: bool,
}

impl PipeWriter {
    /// Makes every following write fail and discards anything still buffered.
    ///
    /// Encoders that finish themselves on drop would otherwise append a valid
    /// trailer to a truncated stream.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.buf.clear();
    }

    fn send(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "blob reader went away"))
    }

    fn check(&self) -> io::Result<()> {
        if self.aborted {
            return Err(io::Error::other("blob producer aborted"));
        }
        self.ctx.check().map_err(io::Error::other)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check()?;
        if data.is_empty() {
            return Ok(0);
        }
        let n = data.len().min(CHUNK_SIZE - self.buf.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == CHUNK_SIZE {
            let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
            self.send(chunk)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.send(chunk)?;
        }
        Ok(())
    }
}

/// Runs `produce` on a new thread and returns the reading end of its output.
///
/// The stream ends cleanly only if `produce` returns `Ok`.  An error or a panic
/// is delivered to the reader as an I/O error.  If the reader is dropped, the
/// producer's next write fails with [`io::ErrorKind::BrokenPipe`].
pub fn spawn_producer<F>(ctx: &Context, name: &str, produce: F) -> io::Result<PipeReader>
where
    F: FnOnce(&mut PipeWriter) -> io::Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
    let mut writer = PipeWriter {
        tx,
        ctx: ctx.clone(),
        buf: Vec::with_capacity(CHUNK_SIZE),
        aborted: false,
    };

    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = match catch_unwind(AssertUnwindSafe(|| produce(&mut writer))) {
                Ok(result) => result.and_then(|()| writer.flush()),
                Err(_) => Err(io::Error::other("blob producer panicked")),
            };
            if let Err(err) = result {
                log::debug!("blob producer failed: {err}");
                writer.abort();
                // the reader may already be gone, in which case nobody cares
                let _ = writer.tx.blocking_send(Err(err));
            }
        })?;

    Ok(PipeReader {
        rx,
        chunk: Vec::new(),
        pos: 0,
        done: false,
    })
}

/// The consumer's end of [`spawn_producer`].
pub struct PipeReader {
    rx: mpsc::Receiver<Chunk>,
    chunk: Vec<u8>,
    pos: usize,
    done: bool,
}

impl PipeReader {
    fn copy_out(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.chunk.len() - self.pos);
        out[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// Takes a received item; `Ok(false)` means the stream is over.
    fn accept(&mut self, item: Option<Chunk>) -> io::Result<bool> {
        match item {
            Some(Ok(chunk)) => {
                self.chunk = chunk;
                self.pos = 0;
                Ok(true)
            }
            Some(Err(err)) => {
                self.done = true;
                Err(err)
            }
            None => {
                self.done = true;
                Ok(false)
            }
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.chunk.len() || out.is_empty() {
                return Ok(self.copy_out(out));
            }
            if self.done {
                return Ok(0);
            }
            let item = self.rx.blocking_recv();
            if !self.accept(item)? {
                return Ok(0);
            }
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.chunk.len() || buf.remaining() == 0 {
                let n = this.copy_out(buf.initialize_unfilled());
                buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            let item = ready!(this.rx.poll_recv(cx));
            if !this.accept(item)? {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

/// Fails the next read once the context has ended.
///
/// Wraps what a producer reads from, so it stops even while its writes are
/// still being buffered.
pub struct ContextReader<R> {
    inner: R,
    ctx: Context,
}

impl<R: Read> ContextReader<R> {
    pub fn new(ctx: &Context, inner: R) -> Self {
        ContextReader {
            inner,
            ctx: ctx.clone(),
        }
    }
}

impl<R: Read> Read for ContextReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.ctx.check().map_err(io::Error::other)?;
        self.inner.read(out)
    }
}

/// The stream handed out for file reads.
pub enum BlobReader {
    Pipe(PipeReader),
    Memory(Cursor<Arc<[u8]>>),
}

impl BlobReader {
    pub fn memory(data: Arc<[u8]>) -> Self {
        BlobReader::Memory(Cursor::new(data))
    }
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobReader::Pipe(_) => f.write_str("BlobReader::Pipe"),
            BlobReader::Memory(c) => write!(f, "BlobReader::Memory({} bytes)", c.get_ref().len()),
        }
    }
}

impl Read for BlobReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            BlobReader::Pipe(r) => r.read(out),
            BlobReader::Memory(r) => r.read(out),
        }
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BlobReader::Pipe(r) => Pin::new(r).poll_read(cx, buf),
            BlobReader::Memory(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;
    use tokio::io::AsyncReadExt;

    use super::*;

    fn read_all(mut r: impl Read) -> io::Result<Vec<u8>> {
        let mut out = vec![];
        r.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_large() {
        let data: Vec<u8> = (0..3 * CHUNK_SIZE + 17).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let reader = spawn_producer(&Context::new(), "test", move |w| {
            for piece in data.chunks(1000) {
                w.write_all(piece)?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(read_all(reader).unwrap(), expected);
    }

    #[test]
    fn test_error_is_not_eof() {
        let reader = spawn_producer(&Context::new(), "test", |w| {
            w.write_all(b"partial")?;
            Err(io::Error::other("diff went away"))
        })
        .unwrap();
        let err = read_all(reader).unwrap_err();
        assert_eq!(err.to_string(), "diff went away");
    }

    #[test]
    fn test_panic_is_reported() {
        let reader = spawn_producer(&Context::new(), "test", |_| panic!("boom")).unwrap();
        assert!(read_all(reader).is_err());
    }

    #[test]
    fn test_abort_discards_trailer() {
        let reader = spawn_producer(&Context::new(), "test", |w| {
            w.write_all(b"body")?;
            w.abort();
            assert!(w.write_all(b"trailer").is_err());
            Err(io::Error::other("failed"))
        })
        .unwrap();
        assert!(read_all(reader).is_err());
    }

    #[test]
    fn test_reader_dropped() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let reader = spawn_producer(&Context::new(), "test", move |w| {
            let chunk = vec![0u8; CHUNK_SIZE];
            let result = (0..1000).try_for_each(|_| w.write_all(&chunk));
            done_tx.send(result.map_err(|e| e.kind())).unwrap();
            Ok(())
        })
        .unwrap();
        drop(reader);
        assert_eq!(done_rx.recv().unwrap(), Err(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_cancelled_producer() {
        let ctx = Context::new();
        ctx.cancel();
        let reader = spawn_producer(&ctx, "test", |w| w.write_all(b"never")).unwrap();
        assert!(read_all(reader).is_err());
    }

    #[test]
    fn test_context_reader() {
        let ctx = Context::new();
        let mut reader = ContextReader::new(&ctx, io::repeat(7));
        let mut buf = [0u8; 4];
        Read::read_exact(&mut reader, &mut buf).unwrap();
        assert_eq!(buf, [7; 4]);
        ctx.cancel();
        assert!(Read::read(&mut reader, &mut buf).is_err());
    }

    #[tokio::test]
    async fn test_async_read() {
        let mut reader = BlobReader::Pipe(
            spawn_producer(&Context::new(), "test", |w| w.write_all(b"Hello, World!")).unwrap(),
        );
        let mut out = String::new();
        AsyncReadExt::read_to_string(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, "Hello, World!");

        let mut reader = BlobReader::memory(Arc::from(&b"sha256:abc"[..]));
        let mut out = vec![];
        AsyncReadExt::read_to_end(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, b"sha256:abc");
    }
}
