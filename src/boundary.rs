//! Literal boundary search over a block reader
//!
//! [`BoundaryScan`] yields every byte strictly before the first occurrence
//! of a pattern, then reports [`Scan::Found`] with the reader positioned
//! exactly past the pattern. The pattern may straddle any number of chunk
//! or block seams and may overlap itself (`--x--x\r\n` after a `--x--`
//! prefix), so a failed window verification advances the scan by one byte,
//! never by the pattern length.

use {
    crate::{
        block::BlockReader,
        error::{Error, Result},
        source::Source,
    },
    std::task::{Context, Poll},
};

macro_rules! ready {
    ($e:expr $(,)?) => {
        match $e {
            std::task::Poll::Ready(t) => t,
            std::task::Poll::Pending => return std::task::Poll::Pending,
        }
    };
}

/// A literal byte pattern with its bad-character skip table.
///
/// The table maps each of the 256 byte values to the Boyer–Moore shift:
/// the pattern length for bytes the pattern does not contain, otherwise
/// the distance from the byte's last occurrence in `P[..m-1]` to the end.
/// A pattern is built once per pipeline and reused for every search.
pub struct Pattern {
    bytes: Box<[u8]>,
    skip: [u16; 256],
}

impl Pattern {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        let bytes = bytes.into();
        assert!(!bytes.is_empty(), "empty boundary pattern");
        assert!(bytes.len() <= u16::MAX as usize, "boundary pattern too long");
        let m = bytes.len();
        let mut skip = [m as u16; 256];
        for (i, &b) in bytes[..m - 1].iter().enumerate() {
            skip[b as usize] = (m - 1 - i) as u16;
        }
        Self { bytes, skip }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// First occurrence of the pattern in `hay`, if any.
    fn find(&self, hay: &[u8]) -> Option<usize> {
        let m = self.bytes.len();
        let n = hay.len();
        if n < m {
            return None;
        }
        let last = self.bytes[m - 1];
        let mut i = m - 1;
        while i < n {
            let c = hay[i];
            if c == last && hay[i + 1 - m..=i] == *self.bytes {
                return Some(i + 1 - m);
            }
            i += if c == last { 1 } else { self.skip[c as usize] as usize };
        }
        None
    }
}

/// One step of a boundary scan.
#[derive(Debug, PartialEq, Eq)]
pub enum Scan {
    /// Bytes preceding the boundary; always a fresh copy, safe to retain.
    Data(Vec<u8>),
    /// The boundary was consumed; the reader stands just past it.
    Found,
    /// The source ended before the boundary appeared.
    Eof,
}

enum State {
    Running,
    Pending(Scan),
    Done,
}

/// Lazy search for a boundary pattern over a [`BlockReader`].
///
/// Blocks are fetched one at a time; up to `m - 1` trailing bytes are
/// carried over to the next round so a boundary split across the seam is
/// still seen whole. Bytes of the final block that follow the boundary are
/// rewound into the reader.
pub struct BoundaryScan {
    pat: Pattern,
    carry: Vec<u8>,
    scratch: Vec<u8>,
    state: State,
}

impl BoundaryScan {
    pub fn new(pattern: impl Into<Box<[u8]>>, block_size: usize) -> Result<Self> {
        let pat = Pattern::new(pattern);
        if pat.len() > block_size {
            return Err(Error::BadPrecondition(format!(
                "boundary of {} bytes does not fit a {} byte block",
                pat.len(),
                block_size
            )));
        }
        let carry = Vec::with_capacity(pat.len());
        Ok(Self {
            pat,
            carry,
            scratch: Vec::new(),
            state: State::Running,
        })
    }

    /// Advances the scan by one step. After `Found` or `Eof` the scan is
    /// finished and must not be polled again.
    pub fn poll_scan<S: Source>(
        &mut self,
        reader: &mut BlockReader<S>,
        ctx: &mut Context<'_>,
    ) -> Poll<Result<Scan>> {
        loop {
            match std::mem::replace(&mut self.state, State::Running) {
                State::Pending(step) => {
                    self.state = State::Done;
                    return Poll::Ready(Ok(step));
                }
                State::Done => {
                    debug_assert!(false, "boundary scan polled after completion");
                    return Poll::Ready(Ok(Scan::Eof));
                }
                State::Running => {}
            }
            let m = self.pat.len();
            let (found, scratch_len) = {
                let block = match ready!(reader.poll_block(ctx, true))? {
                    Some(block) => block,
                    None => {
                        // EOF without a boundary: flush the carry, then the
                        // terminal sentinel.
                        if self.carry.is_empty() {
                            self.state = State::Done;
                            return Poll::Ready(Ok(Scan::Eof));
                        }
                        self.state = State::Pending(Scan::Eof);
                        return Poll::Ready(Ok(Scan::Data(std::mem::take(&mut self.carry))));
                    }
                };
                // The block buffer is reused by the next read, so the seam
                // window is assembled in an owned scratch buffer.
                self.scratch.clear();
                self.scratch.extend_from_slice(&self.carry);
                self.scratch.extend_from_slice(block);
                self.carry.clear();
                (self.pat.find(&self.scratch), self.scratch.len())
            };
            match found {
                Some(p) => {
                    // Everything past the boundary belongs to the caller's
                    // next read; it all came from the current block.
                    reader.rewind(scratch_len - (p + m));
                    self.state = State::Pending(Scan::Found);
                    if p > 0 {
                        return Poll::Ready(Ok(Scan::Data(self.scratch[..p].to_vec())));
                    }
                }
                None => {
                    let keep = (m - 1).min(scratch_len);
                    self.carry.extend_from_slice(&self.scratch[scratch_len - keep..]);
                    if scratch_len > keep {
                        return Poll::Ready(Ok(Scan::Data(
                            self.scratch[..scratch_len - keep].to_vec(),
                        )));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::source,
        futures_lite::future::{block_on, poll_fn},
        rand::{rngs::StdRng, Rng, SeedableRng},
    };

    fn scan_all(data: &[u8], pattern: &[u8], chunk: usize, block: usize) -> (Vec<u8>, Scan, Vec<u8>) {
        let mut reader = BlockReader::new(source::chunks(data.to_vec(), chunk), block);
        let mut scan = BoundaryScan::new(pattern.to_vec(), block).unwrap();
        let mut pre = Vec::new();
        let outcome = loop {
            match block_on(poll_fn(|ctx| scan.poll_scan(&mut reader, ctx))).unwrap() {
                Scan::Data(d) => pre.extend(d),
                step => break step,
            }
        };
        let mut rest = Vec::new();
        while let Some(s) = block_on(poll_fn(|ctx| {
            reader
                .poll_pull(ctx, block)
                .map(|r| r.map(|o| o.map(|s| s.to_vec())))
        }))
        .unwrap()
        {
            rest.extend(s);
        }
        (pre, outcome, rest)
    }

    #[test]
    fn boundary_at_every_seam() {
        let pattern = b"--boundary\r\n";
        let a = b"some preamble text";
        let b = b"the rest of the body";
        let mut data = Vec::new();
        data.extend_from_slice(a);
        data.extend_from_slice(pattern);
        data.extend_from_slice(b);
        for chunk in 1..=data.len() {
            // a 16-byte block forces the boundary across block seams too
            let (pre, outcome, rest) = scan_all(&data, pattern, chunk, 16);
            assert_eq!(pre, a, "chunk size {}", chunk);
            assert_eq!(outcome, Scan::Found);
            assert_eq!(rest, b);
        }
    }

    #[test]
    fn self_overlapping_pattern() {
        let pattern = b"--x--x\r\n";
        // "--x--" primes a false partial match right before the real one
        let data = b"--x--x--x\r\nTAIL".to_vec();
        for chunk in 1..=data.len() {
            let (pre, outcome, rest) = scan_all(&data, pattern, chunk, 16);
            assert_eq!(pre, b"--x", "chunk size {}", chunk);
            assert_eq!(outcome, Scan::Found);
            assert_eq!(rest, b"TAIL");
        }
    }

    #[test]
    fn eof_without_boundary() {
        let data = b"no boundary in here";
        let (pre, outcome, rest) = scan_all(data, b"--boundary\r\n", 5, 16);
        assert_eq!(pre, data);
        assert_eq!(outcome, Scan::Eof);
        assert_eq!(rest, b"");
    }

    #[test]
    fn empty_input_is_immediate_eof() {
        let (pre, outcome, _) = scan_all(b"", b"--b\r\n", 1, 16);
        assert_eq!(pre, b"");
        assert_eq!(outcome, Scan::Eof);
    }

    #[test]
    fn boundary_longer_than_block_is_rejected() {
        assert!(matches!(
            BoundaryScan::new(vec![b'x'; 20], 16),
            Err(Error::BadPrecondition(_))
        ));
    }

    #[test]
    fn random_trials() {
        let pattern = b"--boundary\r\n";
        let mut rng = StdRng::seed_from_u64(0x746172666f726d);
        for trial in 0..500 {
            // the prefix alphabet excludes '-' so the pattern cannot occur in it
            let a: Vec<u8> = (0..rng.gen_range(0..=100))
                .map(|_| rng.gen_range(b'a'..=b'z'))
                .collect();
            let b: Vec<u8> = (0..rng.gen_range(0..=100)).map(|_| rng.gen()).collect();
            let mut data = a.clone();
            data.extend_from_slice(pattern);
            data.extend_from_slice(&b);
            let chunk = rng.gen_range(1..=64);
            let (pre, outcome, rest) = scan_all(&data, pattern, chunk, 64);
            assert_eq!(pre, a, "trial {} chunk {}", trial, chunk);
            assert_eq!(outcome, Scan::Found, "trial {}", trial);
            assert_eq!(rest, b, "trial {}", trial);
        }
    }
}
