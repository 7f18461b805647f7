//! Chunked byte sources
//!
//! A [`Source`] is any stream of sized byte chunks. Producers may emit
//! chunks of arbitrary length; zero-length chunks are legal and treated as
//! "try again". The codecs in this crate never require a source to be
//! seekable or rewindable — buffering is the [`BlockReader`] concern.
//!
//! [`BlockReader`]: crate::block::BlockReader

use {
    futures_lite::{io::AsyncRead, Stream},
    std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    },
};

/// Any producer of sized byte chunks.
///
/// Blanket-implemented for every `Stream` of `io::Result<Vec<u8>>`.
/// Cancellation is dropping the stream.
pub trait Source: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin {}

impl<T> Source for T where T: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin {}

/// Adapts an [`AsyncRead`] into a chunk source.
pub fn reader<R: AsyncRead + Send + Unpin>(reader: R) -> ReaderSource<R> {
    ReaderSource {
        reader,
        done: false,
    }
}

/// Splits a byte buffer into chunks of at most `chunk` bytes.
///
/// The workhorse of the chunk-seam tests: the same payload can be replayed
/// at any chunking without touching the codec under test.
pub fn chunks(data: impl Into<Vec<u8>>, chunk: usize) -> Chunks {
    assert!(chunk > 0, "chunk size must be nonzero");
    Chunks {
        data: data.into(),
        pos: 0,
        chunk,
    }
}

/// Yields a byte buffer as a single chunk.
pub fn once(data: impl Into<Vec<u8>>) -> Chunks {
    let data = data.into();
    let chunk = data.len().max(1);
    chunks(data, chunk)
}

pub struct ReaderSource<R> {
    reader: R,
    done: bool,
}

impl<R: AsyncRead + Send + Unpin> Stream for ReaderSource<R> {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        const CHUNK: usize = 8 * 1024;
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let mut buf = vec![0u8; CHUNK];
        match Pin::new(&mut this.reader).poll_read(ctx, &mut buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Ok(0)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Ok(n)) => {
                buf.truncate(n);
                Poll::Ready(Some(Ok(buf)))
            }
        }
    }
}

pub struct Chunks {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl Stream for Chunks {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, _ctx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.pos >= this.data.len() {
            return Poll::Ready(None);
        }
        let end = (this.pos + this.chunk).min(this.data.len());
        let chunk = this.data[this.pos..end].to_vec();
        this.pos = end;
        Poll::Ready(Some(Ok(chunk)))
    }
}
