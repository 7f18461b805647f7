//! Block-wise reading over a chunked byte source
//!
//! [`BlockReader`] pages an arbitrary [`Source`] into fixed-size blocks and
//! adds the two affordances the codecs need and plain streams lack: reading
//! *up to* N bytes without copying, and handing already-seen bytes back to
//! the front of the logical stream. Bytes drain strictly in order: the
//! pushback tail, then the current chunk, then the next source chunk.
//!
//! Every slice returned from this type is a view into a buffer that is
//! reused by the next call; callers that retain bytes must copy them.

use {
    crate::{error::Result, source::Source},
    std::{
        pin::Pin,
        task::{Context, Poll},
    },
};

macro_rules! ready {
    ($e:expr $(,)?) => {
        match $e {
            std::task::Poll::Ready(t) => t,
            std::task::Poll::Pending => return std::task::Poll::Pending,
        }
    };
}

/// Provenance of the most recently returned slice, for [`BlockReader::rewind`].
enum Last {
    None,
    /// Served as a subview of the current input chunk.
    Chunk,
    /// Served from the pushback tail of the block buffer.
    Pushback,
    /// Served from the front of the block buffer; the value is the slice length.
    Block(usize),
}

/// Fixed-blocksize paged reader with pushback and rewind.
pub struct BlockReader<S> {
    source: S,
    /// Block buffer of size `B`; partial reads fill it from the front,
    /// pushed-back bytes live at its tail.
    block: Box<[u8]>,
    /// Number of pushed-back bytes, stored at `block[B - pb..]`.
    pb: usize,
    chunk: Option<Vec<u8>>,
    pos: usize,
    /// Fill progress of an in-flight `poll_block` that returned `Pending`.
    filled: usize,
    eof: bool,
    last: Last,
}

enum Fetched {
    Chunk,
    Eof,
}

impl<S: Source> BlockReader<S> {
    pub fn new(source: S, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be nonzero");
        Self {
            source,
            block: vec![0u8; block_size].into_boxed_slice(),
            pb: 0,
            chunk: None,
            pos: 0,
            filled: 0,
            eof: false,
            last: Last::None,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block.len()
    }

    /// Pulls the next chunk out of the source. Zero-length chunks are
    /// dropped on the floor; `Fetched::Eof` is sticky.
    fn poll_fetch(&mut self, ctx: &mut Context<'_>) -> Poll<Result<Fetched>> {
        debug_assert!(self.chunk.is_none());
        if self.eof {
            return Poll::Ready(Ok(Fetched::Eof));
        }
        match Pin::new(&mut self.source).poll_next(ctx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Err(err))) => Poll::Ready(Err(err.into())),
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    self.chunk = Some(chunk);
                    self.pos = 0;
                }
                Poll::Ready(Ok(Fetched::Chunk))
            }
            Poll::Ready(None) => {
                self.eof = true;
                Poll::Ready(Ok(Fetched::Eof))
            }
        }
    }

    /// Reads exactly one block, or (with `allow_partial`) a shorter trailing
    /// block at the end of the source, or `None` once no bytes remain.
    ///
    /// When a full block was required but the source ended mid-block, the
    /// partial bytes are pushed back so a subsequent [`poll_pull`] still
    /// sees them.
    ///
    /// [`poll_pull`]: BlockReader::poll_pull
    pub fn poll_block(
        &mut self,
        ctx: &mut Context<'_>,
        allow_partial: bool,
    ) -> Poll<Result<Option<&[u8]>>> {
        let b = self.block.len();
        enum Out {
            Block(usize),
            Chunk(usize),
            Empty,
        }
        let out = loop {
            // Fast path: the current chunk alone can satisfy the block.
            if self.filled == 0 && self.pb == 0 {
                if let Some(chunk) = &self.chunk {
                    if chunk.len() - self.pos >= b {
                        let start = self.pos;
                        self.pos += b;
                        break Out::Chunk(start);
                    }
                }
            }
            if self.pb > 0 {
                let n = self.pb.min(b - self.filled);
                let src = b - self.pb;
                self.block.copy_within(src..src + n, self.filled);
                self.pb -= n;
                self.filled += n;
                continue;
            }
            if let Some(chunk) = &self.chunk {
                let avail = chunk.len() - self.pos;
                let take = avail.min(b - self.filled);
                if take > 0 {
                    self.block[self.filled..self.filled + take]
                        .copy_from_slice(&chunk[self.pos..self.pos + take]);
                    self.pos += take;
                    self.filled += take;
                }
                if self.pos == chunk.len() {
                    self.chunk = None;
                    self.pos = 0;
                }
                if self.filled == b {
                    break Out::Block(b);
                }
                if take > 0 {
                    continue;
                }
            }
            match ready!(self.poll_fetch(ctx))? {
                Fetched::Chunk => continue,
                Fetched::Eof => {
                    if self.filled == 0 {
                        break Out::Empty;
                    }
                    if allow_partial {
                        break Out::Block(self.filled);
                    }
                    // Not enough for a full block: hand the bytes back.
                    let n = self.filled;
                    self.block.copy_within(0..n, b - n);
                    self.pb = n;
                    self.filled = 0;
                    break Out::Empty;
                }
            }
        };
        Poll::Ready(Ok(match out {
            Out::Block(n) => {
                self.filled = 0;
                self.last = Last::Block(n);
                Some(&self.block[..n])
            }
            Out::Chunk(start) => {
                self.last = Last::Chunk;
                Some(&self.chunk.as_ref().expect("current chunk")[start..start + b])
            }
            Out::Empty => {
                self.last = Last::None;
                None
            }
        }))
    }

    /// Returns up to `max` bytes without copying when possible, or `None`
    /// at the end of the source.
    pub fn poll_pull(
        &mut self,
        ctx: &mut Context<'_>,
        max: usize,
    ) -> Poll<Result<Option<&[u8]>>> {
        debug_assert!(max > 0, "pull of zero bytes");
        debug_assert!(self.filled == 0, "pull during a partially filled block read");
        let b = self.block.len();
        enum Out {
            Pushback(usize, usize),
            Chunk(usize, usize),
            Eof,
        }
        let out = loop {
            if self.pb > 0 {
                let n = self.pb.min(max);
                let start = b - self.pb;
                self.pb -= n;
                break Out::Pushback(start, n);
            }
            if let Some(chunk) = &self.chunk {
                let avail = chunk.len() - self.pos;
                if avail > 0 {
                    let n = avail.min(max);
                    let start = self.pos;
                    self.pos += n;
                    break Out::Chunk(start, n);
                }
                self.chunk = None;
                self.pos = 0;
            }
            if let Fetched::Eof = ready!(self.poll_fetch(ctx))? {
                break Out::Eof;
            }
        };
        Poll::Ready(Ok(match out {
            Out::Pushback(start, n) => {
                self.last = Last::Pushback;
                Some(&self.block[start..start + n])
            }
            Out::Chunk(start, n) => {
                self.last = Last::Chunk;
                Some(&self.chunk.as_ref().expect("current chunk")[start..start + n])
            }
            Out::Eof => {
                self.last = Last::None;
                None
            }
        }))
    }

    /// Discards up to `*amount` bytes, decrementing `amount` as it goes so
    /// that progress survives `Poll::Pending`. Resolves to the number of
    /// bytes that could **not** be skipped: 0 on success, more when the
    /// source ended first.
    pub fn poll_skip(&mut self, ctx: &mut Context<'_>, amount: &mut u64) -> Poll<Result<u64>> {
        debug_assert!(self.filled == 0, "skip during a partially filled block read");
        loop {
            if *amount == 0 {
                self.last = Last::None;
                return Poll::Ready(Ok(0));
            }
            if self.pb > 0 {
                let n = (self.pb as u64).min(*amount) as usize;
                self.pb -= n;
                *amount -= n as u64;
                continue;
            }
            if let Some(chunk) = &self.chunk {
                let avail = chunk.len() - self.pos;
                if avail > 0 {
                    let n = (avail as u64).min(*amount) as usize;
                    self.pos += n;
                    *amount -= n as u64;
                    continue;
                }
                self.chunk = None;
                self.pos = 0;
            }
            if let Fetched::Eof = ready!(self.poll_fetch(ctx))? {
                self.last = Last::None;
                return Poll::Ready(Ok(*amount));
            }
        }
    }

    /// Re-inserts the last `k` bytes of the most recently returned slice at
    /// the front of the logical stream.
    ///
    /// Slices served from the current chunk are rewound by moving the
    /// cursor; slices served from the block buffer are copied into its
    /// reserved tail. Rewinding more than the last read returned, or
    /// without a preceding read, is a programmer error and panics.
    pub fn rewind(&mut self, k: usize) {
        if k == 0 {
            self.last = Last::None;
            return;
        }
        let b = self.block.len();
        match std::mem::replace(&mut self.last, Last::None) {
            Last::Chunk => {
                assert!(k <= self.pos, "rewind past the start of the current chunk");
                self.pos -= k;
            }
            Last::Pushback => {
                assert!(self.pb + k <= b, "rewind beyond pushback capacity");
                self.pb += k;
            }
            Last::Block(len) => {
                assert!(
                    k <= len && self.pb == 0,
                    "rewind beyond the last returned block"
                );
                self.block.copy_within(len - k..len, b - k);
                self.pb = k;
            }
            Last::None => panic!("rewind without a preceding read"),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::source,
        futures_lite::future::{block_on, poll_fn},
    };

    fn reader(data: &[u8], chunk: usize, block: usize) -> BlockReader<source::Chunks> {
        BlockReader::new(source::chunks(data.to_vec(), chunk), block)
    }

    fn read_block(r: &mut BlockReader<source::Chunks>, partial: bool) -> Option<Vec<u8>> {
        block_on(poll_fn(|ctx| {
            r.poll_block(ctx, partial)
                .map(|res| res.unwrap().map(|s| s.to_vec()))
        }))
    }

    fn pull(r: &mut BlockReader<source::Chunks>, max: usize) -> Option<Vec<u8>> {
        block_on(poll_fn(|ctx| {
            r.poll_pull(ctx, max)
                .map(|res| res.unwrap().map(|s| s.to_vec()))
        }))
    }

    fn skip(r: &mut BlockReader<source::Chunks>, n: u64) -> u64 {
        let mut amount = n;
        block_on(poll_fn(|ctx| {
            r.poll_skip(ctx, &mut amount).map(|res| res.unwrap())
        }))
    }

    #[test]
    fn blocks_across_chunkings() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        for chunk in [1, 3, 7, 500, 512, 1024] {
            let mut r = reader(&data, chunk, 512);
            assert_eq!(read_block(&mut r, false).unwrap(), &data[..512]);
            assert_eq!(read_block(&mut r, false).unwrap(), &data[512..]);
            assert_eq!(read_block(&mut r, false), None);
            assert_eq!(read_block(&mut r, false), None);
        }
    }

    #[test]
    fn partial_trailing_block() {
        let data = vec![7u8; 700];
        let mut r = reader(&data, 128, 512);
        assert_eq!(read_block(&mut r, true).unwrap().len(), 512);
        assert_eq!(read_block(&mut r, true).unwrap(), &data[512..]);
        assert_eq!(read_block(&mut r, true), None);
    }

    #[test]
    fn failed_full_block_is_pushed_back() {
        let data = b"short tail".to_vec();
        let mut r = reader(&data, 4, 512);
        assert_eq!(read_block(&mut r, false), None);
        // The bytes must still be visible to a pull.
        let mut got = Vec::new();
        while let Some(s) = pull(&mut r, 512) {
            got.extend(s);
        }
        assert_eq!(got, data);
    }

    #[test]
    fn pull_is_bounded_and_ordered() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut r = reader(&data, 9, 16);
        let mut got = Vec::new();
        while let Some(s) = pull(&mut r, 5) {
            assert!(s.len() <= 5);
            got.extend(s);
        }
        assert_eq!(got, data);
    }

    #[test]
    fn skip_reports_shortfall_at_eof() {
        let data = vec![1u8; 40];
        let mut r = reader(&data, 7, 16);
        assert_eq!(skip(&mut r, 25), 0);
        // the pull is capped by what is left of the current 7-byte chunk
        assert_eq!(pull(&mut r, 100).unwrap(), &data[25..28]);
        assert_eq!(skip(&mut r, 100), 88);
        assert_eq!(pull(&mut r, 1), None);
    }

    #[test]
    fn rewind_after_pull() {
        let data: Vec<u8> = (0..50u8).collect();
        let mut r = reader(&data, 50, 16);
        let s = pull(&mut r, 10).unwrap();
        assert_eq!(s, &data[..10]);
        r.rewind(4);
        assert_eq!(pull(&mut r, 4).unwrap(), &data[6..10]);
    }

    #[test]
    fn rewind_after_block() {
        let data: Vec<u8> = (0..32u8).collect();
        // chunk smaller than the block, so the block is assembled in the
        // block buffer and rewind has to copy into the pushback tail
        let mut r = reader(&data, 5, 16);
        let blk = read_block(&mut r, false).unwrap();
        assert_eq!(blk, &data[..16]);
        r.rewind(6);
        assert_eq!(pull(&mut r, 6).unwrap(), &data[10..16]);
        assert_eq!(pull(&mut r, 16).unwrap()[0], 16);
    }

    #[test]
    #[should_panic(expected = "rewind without a preceding read")]
    fn rewind_without_read_panics() {
        let mut r = reader(b"abc", 1, 4);
        r.rewind(1);
    }
}
