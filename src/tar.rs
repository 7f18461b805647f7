//! Streaming tar codec
//!
//! [`TarReader`] turns a chunked byte source into a sequence of archive
//! entries; [`TarWriter`] is the inverse sink. Both understand USTAR
//! blocks plus the GNU long-name (`L`/`N`/`K`) and PAX (`x`/`g`)
//! extensions, run in memory bounded by a single block regardless of
//! entry sizes, and never require the source or sink to be seekable.

use {
    crate::{
        block::BlockReader,
        error::{Error, Result},
        source::Source,
    },
    futures_lite::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite},
        Stream,
    },
    futures::Sink,
    std::{
        io,
        pin::Pin,
        sync::{Arc, Mutex, MutexGuard},
        task::{Context, Poll},
        time::{SystemTime, UNIX_EPOCH},
    },
};

pub(crate) const BLOCK_SIZE: usize = 512;
/// Cap on a single PAX or long-name payload.
const EXTENSION_MAX: usize = 16 * 1024;

const TYPE_FILE0: u8 = 0;
const TYPE_FILE: u8 = b'0';
const TYPE_LINK: u8 = b'1';
const TYPE_SYMLINK: u8 = b'2';
const TYPE_DIRECTORY: u8 = b'5';
const TYPE_CONTIGUOUS: u8 = b'7';
const TYPE_GNU_LONG_LINK: u8 = b'K';
const TYPE_GNU_LONG_NAME: u8 = b'L';
const TYPE_GNU_LONG_NAME_OLD: u8 = b'N';
const TYPE_PAX_LOCAL: u8 = b'x';
const TYPE_PAX_GLOBAL: u8 = b'g';

macro_rules! ready {
    ($e:expr $(,)?) => {
        match $e {
            Poll::Ready(Ok(t)) => t,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Pending => return Poll::Pending,
        }
    };
}

macro_rules! ready_opt {
    ($e:expr $(,)?) => {
        match $e {
            Poll::Ready(Ok(t)) => t,
            Poll::Ready(Err(err)) => return Poll::Ready(Some(Err(err.into()))),
            Poll::Pending => return Poll::Pending,
        }
    };
}

const fn padding(size: u64) -> u64 {
    (BLOCK_SIZE as u64 - size % BLOCK_SIZE as u64) % BLOCK_SIZE as u64
}

/// Entry category surfaced to the caller.
///
/// Typeflags outside this set but inside a checksum-valid USTAR block are
/// surfaced as [`EntryKind::File`] with the raw flag preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Link,
    Symlink,
    Directory,
}

// ---------------------------------------------------------------------------
// header block codec

struct HeaderBlock {
    record: [u8; BLOCK_SIZE],
}

impl HeaderBlock {
    const NAME: std::ops::Range<usize> = 0..100;
    const MODE: std::ops::Range<usize> = 100..108;
    const UID: std::ops::Range<usize> = 108..116;
    const GID: std::ops::Range<usize> = 116..124;
    const SIZE: std::ops::Range<usize> = 124..136;
    const MTIME: std::ops::Range<usize> = 136..148;
    const CHKSUM: std::ops::Range<usize> = 148..156;
    const TYPEFLAG: usize = 156;
    const LINKNAME: std::ops::Range<usize> = 157..257;
    const MAGIC: std::ops::Range<usize> = 257..263;
    const VERSION: std::ops::Range<usize> = 263..265;
    const UNAME: std::ops::Range<usize> = 265..297;
    const GNAME: std::ops::Range<usize> = 297..329;
    const DEVMAJOR: std::ops::Range<usize> = 329..337;
    const DEVMINOR: std::ops::Range<usize> = 337..345;
    const PREFIX: std::ops::Range<usize> = 345..500;

    fn new() -> Self {
        Self {
            record: [0u8; BLOCK_SIZE],
        }
    }

    fn is_zero(&self) -> bool {
        self.record.iter().all(|b| *b == 0)
    }

    /// `ustar` at 257 with byte 262 NUL or space: "this looks like a header".
    fn has_magic(&self) -> bool {
        &self.record[257..262] == b"ustar" && matches!(self.record[262], 0 | b' ')
    }

    fn typeflag(&self) -> u8 {
        self.record[Self::TYPEFLAG]
    }

    fn str_field(&self, range: std::ops::Range<usize>) -> String {
        let field = &self.record[range];
        let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    fn num_field(&self, range: std::ops::Range<usize>) -> i64 {
        parse_numeric(&self.record[range])
    }

    fn size(&self) -> u64 {
        self.num_field(Self::SIZE).max(0) as u64
    }

    fn path_name(&self) -> String {
        let name = self.str_field(Self::NAME);
        if self.record[Self::PREFIX.start] != 0 {
            let mut path = self.str_field(Self::PREFIX);
            path.push('/');
            path.push_str(&name);
            path
        } else {
            name
        }
    }

    /// 8-bit sum of the whole block with the checksum field read as spaces.
    fn compute_checksum(&self) -> i64 {
        let mut sum: i64 = 8 * 0x20;
        sum += self.record[..Self::CHKSUM.start]
            .iter()
            .map(|b| *b as i64)
            .sum::<i64>();
        sum += self.record[Self::CHKSUM.end..]
            .iter()
            .map(|b| *b as i64)
            .sum::<i64>();
        sum
    }

    fn verify_checksum(&self) -> bool {
        self.num_field(Self::CHKSUM) == self.compute_checksum()
    }

    fn write_str(&mut self, range: std::ops::Range<usize>, value: &str) {
        let field = &mut self.record[range];
        let bytes = truncate_utf8(value, field.len());
        field[..bytes.len()].copy_from_slice(bytes);
    }

    fn write_num(&mut self, range: std::ops::Range<usize>, value: u64) {
        write_numeric(&mut self.record[range], value);
    }

    fn write_checksum(&mut self) {
        self.record[Self::CHKSUM].fill(b' ');
        let sum = self.compute_checksum();
        let field = &mut self.record[Self::CHKSUM];
        // the classic layout: six octal digits, NUL, space
        let mut v = sum as u64;
        for slot in field[..6].iter_mut().rev() {
            *slot = b'0' + (v % 8) as u8;
            v /= 8;
        }
        field[6] = 0;
        field[7] = b' ';
    }
}

/// Accepts classic padded octal and both GNU base-256 encodings; parse
/// failures yield 0.
fn parse_numeric(field: &[u8]) -> i64 {
    let Some(&first) = field.first() else {
        return 0;
    };
    if first & 0x80 != 0 {
        // base-256: 0x80 positive big-endian, 0xFF two's complement
        let mut acc: i64 = if first == 0xff {
            -1
        } else {
            (first & 0x7f) as i64
        };
        for &b in &field[1..] {
            acc = match acc.checked_mul(256).and_then(|a| a.checked_add(b as i64)) {
                Some(a) => a,
                None => return 0,
            };
        }
        return acc;
    }
    let mut value: i64 = 0;
    let mut seen = false;
    for &b in field {
        match b {
            b' ' if !seen => continue,
            b' ' | 0 => break,
            b'0'..=b'7' => {
                seen = true;
                value = match value.checked_mul(8).and_then(|v| v.checked_add((b - b'0') as i64))
                {
                    Some(v) => v,
                    None => return 0,
                };
            }
            _ => return 0,
        }
    }
    value
}

/// Octal with a trailing space-NUL when the value fits, base-256 with a
/// 0x80 lead byte otherwise.
fn write_numeric(field: &mut [u8], value: u64) {
    let w = field.len();
    let digits = w - 2;
    let fits = digits >= 22 || value < 1u64 << (3 * digits as u32);
    if fits {
        let mut v = value;
        for slot in field[..digits].iter_mut().rev() {
            *slot = b'0' + (v % 8) as u8;
            v /= 8;
        }
        field[digits] = b' ';
        field[w - 1] = 0;
    } else {
        field.fill(0);
        field[0] = 0x80;
        let mut v = value;
        for slot in field[1..].iter_mut().rev() {
            *slot = (v & 0xff) as u8;
            v >>= 8;
        }
    }
}

/// Longest prefix of `value` that fits `max` bytes on a char boundary.
fn truncate_utf8(value: &str, max: usize) -> &[u8] {
    if value.len() <= max {
        return value.as_bytes();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].as_bytes()
}

// ---------------------------------------------------------------------------
// PAX records

#[derive(Debug, Default, Clone)]
struct PaxOverrides {
    path: Option<String>,
    linkpath: Option<String>,
    size: Option<u64>,
    mode: Option<u32>,
    uid: Option<u64>,
    gid: Option<u64>,
    mtime_ms: Option<u64>,
    uname: Option<String>,
    gname: Option<String>,
}

/// Parses `LEN SP key=value LF` records. The length prefix counts the
/// whole record including its own digits. Unknown keys are ignored; a
/// malformed record aborts the loop, leaving the rest of the payload
/// unapplied.
fn parse_pax(data: &[u8], out: &mut PaxOverrides) {
    let mut rest = data;
    while !rest.is_empty() {
        let Some(space) = rest.iter().take(20).position(|b| *b == b' ') else {
            break;
        };
        let Some(len) = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        else {
            break;
        };
        if len <= space + 1 || len > rest.len() || rest[len - 1] != b'\n' {
            break;
        }
        let record = &rest[space + 1..len - 1];
        rest = &rest[len..];
        let Some(eq) = record.iter().position(|b| *b == b'=') else {
            break;
        };
        let Ok(key) = std::str::from_utf8(&record[..eq]) else {
            break;
        };
        let value = String::from_utf8_lossy(&record[eq + 1..]);
        match key {
            "path" => out.path = Some(value.into_owned()),
            "linkpath" => out.linkpath = Some(value.into_owned()),
            "size" => out.size = value.parse().ok().or(out.size),
            "uid" => out.uid = value.parse().ok().or(out.uid),
            "gid" => out.gid = value.parse().ok().or(out.gid),
            "mode" => out.mode = value.parse().ok().or(out.mode),
            "mtime" => {
                out.mtime_ms = value
                    .parse::<f64>()
                    .ok()
                    .map(|secs| (secs * 1000.0) as u64)
                    .or(out.mtime_ms)
            }
            "uname" => out.uname = Some(value.into_owned()),
            "gname" => out.gname = Some(value.into_owned()),
            _ => {}
        }
    }
}

/// Encodes one `LEN SP key=value LF` record; the length digits count
/// themselves, so a record near a power of ten needs the extra digit.
fn pax_record(key: &str, value: &str, out: &mut Vec<u8>) {
    let base = 1 + key.len() + 1 + value.len() + 1;
    let mut total = base + 1;
    while total != base + decimal_digits(total) {
        total = base + decimal_digits(total);
    }
    out.extend_from_slice(total.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(key.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value.as_bytes());
    out.push(b'\n');
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

// ---------------------------------------------------------------------------
// decode

const fn is_known_typeflag(tf: u8) -> bool {
    matches!(
        tf,
        TYPE_FILE0
            | TYPE_FILE
            | TYPE_LINK
            | TYPE_SYMLINK
            | TYPE_DIRECTORY
            | TYPE_CONTIGUOUS
            | TYPE_GNU_LONG_LINK
            | TYPE_GNU_LONG_NAME
            | TYPE_GNU_LONG_NAME_OLD
            | TYPE_PAX_LOCAL
            | TYPE_PAX_GLOBAL
    )
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Header,
    Extension,
    Done,
}

struct EntryMeta {
    name: String,
    kind: EntryKind,
    typeflag: u8,
    size: u64,
    mtime_ms: u64,
    mode: u32,
    uid: u64,
    gid: u64,
    uname: String,
    gname: String,
    devmajor: u32,
    devminor: u32,
    linkname: Option<String>,
}

struct TarInner<S> {
    reader: BlockReader<S>,
    state: State,
    globals: PaxOverrides,
    locals: PaxOverrides,
    long_name: Option<String>,
    long_link: Option<String>,
    ext_kind: u8,
    ext_remaining: u64,
    ext_pad: u64,
    ext_buf: Vec<u8>,
    /// Unread payload bytes of the current entry, then its block padding.
    remaining: u64,
    pad: u64,
    /// Bumped whenever the pipeline moves past an entry; stale payload
    /// handles compare against it.
    seq: u64,
    entry_open: bool,
}

impl<S: Source> TarInner<S> {
    fn new(source: S) -> Self {
        Self {
            reader: BlockReader::new(source, BLOCK_SIZE),
            state: State::Header,
            globals: PaxOverrides::default(),
            locals: PaxOverrides::default(),
            long_name: None,
            long_link: None,
            ext_kind: 0,
            ext_remaining: 0,
            ext_pad: 0,
            ext_buf: Vec::new(),
            remaining: 0,
            pad: 0,
            seq: 0,
            entry_open: false,
        }
    }

    fn poll_entry(&mut self, ctx: &mut Context<'_>) -> Poll<Option<Result<EntryMeta>>> {
        if self.entry_open {
            // the caller moved on; anything it left unread is skipped
            self.entry_open = false;
            self.seq += 1;
        }
        loop {
            if self.remaining > 0 {
                let short = ready_opt!(self.reader.poll_skip(ctx, &mut self.remaining));
                if short > 0 {
                    self.state = State::Done;
                    return Poll::Ready(Some(Err(Error::UnexpectedEof("entry payload"))));
                }
            }
            if self.pad > 0 {
                let short = ready_opt!(self.reader.poll_skip(ctx, &mut self.pad));
                if short > 0 {
                    self.state = State::Done;
                    return Poll::Ready(Some(Err(Error::UnexpectedEof("entry padding"))));
                }
            }
            match self.state {
                State::Done => return Poll::Ready(None),
                State::Header => {
                    let mut header = HeaderBlock::new();
                    match ready_opt!(self.reader.poll_block(ctx, false)) {
                        // a source that simply stops at a block boundary is
                        // treated like a terminated archive
                        None => {
                            self.state = State::Done;
                            return Poll::Ready(None);
                        }
                        Some(block) => header.record.copy_from_slice(block),
                    }
                    if !header.has_magic() {
                        self.state = State::Done;
                        if header.is_zero() {
                            return Poll::Ready(None);
                        }
                        return Poll::Ready(Some(Err(Error::BadHeader(
                            "unexpected non-header block".into(),
                        ))));
                    }
                    let tf = header.typeflag();
                    if !header.verify_checksum() && !is_known_typeflag(tf) {
                        self.state = State::Done;
                        return Poll::Ready(Some(Err(Error::BadChecksum(tf))));
                    }
                    match tf {
                        TYPE_PAX_LOCAL
                        | TYPE_PAX_GLOBAL
                        | TYPE_GNU_LONG_NAME
                        | TYPE_GNU_LONG_NAME_OLD
                        | TYPE_GNU_LONG_LINK => {
                            let size = header.size();
                            if size > EXTENSION_MAX as u64 {
                                self.state = State::Done;
                                return Poll::Ready(Some(Err(Error::LimitExceeded(
                                    "extended header",
                                    EXTENSION_MAX,
                                ))));
                            }
                            self.state = State::Extension;
                            self.ext_kind = tf;
                            self.ext_remaining = size;
                            self.ext_pad = padding(size);
                            self.ext_buf.clear();
                            self.ext_buf.reserve(size as usize);
                        }
                        _ => {
                            let meta = self.finish_entry(&header);
                            self.remaining = meta.size;
                            self.pad = padding(meta.size);
                            self.seq += 1;
                            self.entry_open = true;
                            tracing::trace!(name = %meta.name, size = meta.size, "tar entry");
                            return Poll::Ready(Some(Ok(meta)));
                        }
                    }
                }
                State::Extension => {
                    while self.ext_remaining > 0 {
                        let want = self.ext_remaining.min(BLOCK_SIZE as u64) as usize;
                        match ready_opt!(self.reader.poll_pull(ctx, want)) {
                            None => {
                                self.state = State::Done;
                                return Poll::Ready(Some(Err(Error::UnexpectedEof(
                                    "extended header payload",
                                ))));
                            }
                            Some(slice) => {
                                let n = slice.len() as u64;
                                self.ext_buf.extend_from_slice(slice);
                                self.ext_remaining -= n;
                            }
                        }
                    }
                    if self.ext_pad > 0 {
                        let short = ready_opt!(self.reader.poll_skip(ctx, &mut self.ext_pad));
                        if short > 0 {
                            self.state = State::Done;
                            return Poll::Ready(Some(Err(Error::UnexpectedEof(
                                "extended header padding",
                            ))));
                        }
                    }
                    let data = std::mem::take(&mut self.ext_buf);
                    match self.ext_kind {
                        TYPE_PAX_LOCAL => parse_pax(&data, &mut self.locals),
                        TYPE_PAX_GLOBAL => {
                            parse_pax(&data, &mut self.globals);
                            tracing::debug!("applied PAX global defaults");
                        }
                        TYPE_GNU_LONG_LINK => self.long_link = Some(bytes_to_name(&data)),
                        _ => self.long_name = Some(bytes_to_name(&data)),
                    }
                    self.state = State::Header;
                }
            }
        }
    }

    /// Resolves header fields against the pending long-name records, the
    /// local PAX overrides and the persistent globals, in that order.
    fn finish_entry(&mut self, header: &HeaderBlock) -> EntryMeta {
        let locals = std::mem::take(&mut self.locals);
        let globals = &self.globals;
        let name = self
            .long_name
            .take()
            .or(locals.path)
            .or_else(|| globals.path.clone())
            .unwrap_or_else(|| header.path_name());
        let linkname = self
            .long_link
            .take()
            .or(locals.linkpath)
            .or_else(|| globals.linkpath.clone())
            .or_else(|| {
                let l = header.str_field(HeaderBlock::LINKNAME);
                (!l.is_empty()).then_some(l)
            });
        let size = locals.size.or(globals.size).unwrap_or_else(|| header.size());
        let tf = header.typeflag();
        let kind = match tf {
            TYPE_FILE0 | TYPE_FILE if name.ends_with('/') => EntryKind::Directory,
            TYPE_FILE0 | TYPE_FILE | TYPE_CONTIGUOUS => EntryKind::File,
            TYPE_LINK => EntryKind::Link,
            TYPE_SYMLINK => EntryKind::Symlink,
            TYPE_DIRECTORY => EntryKind::Directory,
            // recognised magic and a valid checksum: surface the raw flag
            // under the closest category
            _ => EntryKind::File,
        };
        EntryMeta {
            name,
            kind,
            typeflag: tf,
            size,
            mtime_ms: locals
                .mtime_ms
                .or(globals.mtime_ms)
                .unwrap_or_else(|| header.num_field(HeaderBlock::MTIME).max(0) as u64 * 1000),
            mode: locals
                .mode
                .or(globals.mode)
                .unwrap_or_else(|| header.num_field(HeaderBlock::MODE).max(0) as u32),
            uid: locals
                .uid
                .or(globals.uid)
                .unwrap_or_else(|| header.num_field(HeaderBlock::UID).max(0) as u64),
            gid: locals
                .gid
                .or(globals.gid)
                .unwrap_or_else(|| header.num_field(HeaderBlock::GID).max(0) as u64),
            uname: locals
                .uname
                .or_else(|| globals.uname.clone())
                .unwrap_or_else(|| header.str_field(HeaderBlock::UNAME)),
            gname: locals
                .gname
                .or_else(|| globals.gname.clone())
                .unwrap_or_else(|| header.str_field(HeaderBlock::GNAME)),
            devmajor: header.num_field(HeaderBlock::DEVMAJOR).max(0) as u32,
            devminor: header.num_field(HeaderBlock::DEVMINOR).max(0) as u32,
            linkname,
        }
    }
}

fn bytes_to_name(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn lock_inner<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("pipeline lock: {}", err)))
}

/// Streaming tar decoder: a `Stream` of [`TarEntry`].
///
/// Entries are produced in archive order. Advancing the stream cancels
/// whatever is left of the previous entry's payload.
pub struct TarReader<S: Source> {
    inner: Arc<Mutex<TarInner<S>>>,
}

impl<S: Source> TarReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TarInner::new(source))),
        }
    }
}

impl<S: Source> Stream for TarReader<S> {
    type Item = Result<TarEntry<S>>;

    fn poll_next(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut inner = match lock_inner(&this.inner) {
            Ok(inner) => inner,
            Err(err) => return Poll::Ready(Some(Err(err.into()))),
        };
        let meta = match inner.poll_entry(ctx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
            Poll::Ready(Some(Ok(meta))) => meta,
        };
        let seq = inner.seq;
        drop(inner);
        Poll::Ready(Some(Ok(TarEntry {
            meta,
            seq,
            inner: Arc::clone(&this.inner),
        })))
    }
}

/// One archive entry: metadata by value plus a one-shot lazy payload.
pub struct TarEntry<S: Source> {
    meta: EntryMeta,
    seq: u64,
    inner: Arc<Mutex<TarInner<S>>>,
}

impl<S: Source> TarEntry<S> {
    pub fn name(&self) -> &str {
        &self.meta.name
    }
    pub fn kind(&self) -> EntryKind {
        self.meta.kind
    }
    /// The typeflag byte as it appeared on the wire.
    pub fn typeflag(&self) -> u8 {
        self.meta.typeflag
    }
    pub fn size(&self) -> u64 {
        self.meta.size
    }
    pub fn mtime_ms(&self) -> u64 {
        self.meta.mtime_ms
    }
    pub fn mode(&self) -> u32 {
        self.meta.mode
    }
    pub fn uid(&self) -> u64 {
        self.meta.uid
    }
    pub fn gid(&self) -> u64 {
        self.meta.gid
    }
    pub fn uname(&self) -> &str {
        &self.meta.uname
    }
    pub fn gname(&self) -> &str {
        &self.meta.gname
    }
    pub fn devmajor(&self) -> u32 {
        self.meta.devmajor
    }
    pub fn devminor(&self) -> u32 {
        self.meta.devminor
    }
    pub fn linkname(&self) -> Option<&str> {
        self.meta.linkname.as_deref()
    }

    /// The entry's payload. Reading it consumes bytes from the shared
    /// pipeline; once the entry stream has been advanced the handle is
    /// stale and reads fail.
    pub fn body(&self) -> TarBody<S> {
        TarBody {
            seq: self.seq,
            inner: Arc::clone(&self.inner),
        }
    }

    pub async fn bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.meta.size.min(64 * 1024) as usize);
        self.body().read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub async fn text(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.bytes().await?).into_owned())
    }

    pub async fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err).into())
    }
}

/// Lazy payload of a [`TarEntry`].
pub struct TarBody<S: Source> {
    seq: u64,
    inner: Arc<Mutex<TarInner<S>>>,
}

impl<S: Source> AsyncRead for TarBody<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut inner = match lock_inner(&this.inner) {
            Ok(inner) => inner,
            Err(err) => return Poll::Ready(Err(err)),
        };
        if inner.seq != this.seq {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "entry payload read after the stream advanced",
            )));
        }
        if inner.remaining == 0 || buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let want = inner.remaining.min(buf.len() as u64) as usize;
        let inner = &mut *inner;
        match inner.reader.poll_pull(ctx, want) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
            Poll::Ready(Ok(None)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF while reading entry payload",
            ))),
            Poll::Ready(Ok(Some(slice))) => {
                let n = slice.len();
                buf[..n].copy_from_slice(slice);
                inner.remaining -= n as u64;
                Poll::Ready(Ok(n))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// encode

/// One entry handed to a [`TarWriter`].
pub struct TarItem<R> {
    name: String,
    kind: EntryKind,
    size: u64,
    mode: Option<u32>,
    uid: u64,
    gid: u64,
    mtime_ms: Option<u64>,
    uname: String,
    gname: String,
    devmajor: u32,
    devminor: u32,
    linkname: Option<String>,
    payload: Option<R>,
}

impl<R> TarItem<R> {
    fn bare(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            mode: None,
            uid: 0,
            gid: 0,
            mtime_ms: None,
            uname: String::new(),
            gname: String::new(),
            devmajor: 0,
            devminor: 0,
            linkname: None,
            payload: None,
        }
    }

    /// A regular file whose payload yields exactly `size` bytes.
    pub fn file(name: impl Into<String>, size: u64, payload: R) -> Self {
        let mut item = Self::bare(name, EntryKind::File);
        item.size = size;
        item.payload = Some(payload);
        item
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self::bare(name, EntryKind::Directory)
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut item = Self::bare(name, EntryKind::Symlink);
        item.linkname = Some(target.into());
        item
    }

    pub fn hardlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut item = Self::bare(name, EntryKind::Link);
        item.linkname = Some(target.into());
        item
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_mtime_ms(mut self, mtime_ms: u64) -> Self {
        self.mtime_ms = Some(mtime_ms);
        self
    }

    pub fn with_owner(mut self, uid: u64, gid: u64) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_names(mut self, uname: impl Into<String>, gname: impl Into<String>) -> Self {
        self.uname = uname.into();
        self.gname = gname.into();
        self
    }
}

/// Streaming tar encoder: a `Sink` of [`TarItem`] over any `AsyncWrite`.
///
/// `close` finishes the archive with the two all-zero terminator blocks.
pub struct TarWriter<W, R> {
    sink: W,
    buf: Vec<u8>,
    bufpos: usize,
    stage: Vec<u8>,
    stagepos: usize,
    payload: Option<(R, u64)>,
    pad: usize,
    terminated: bool,
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> TarWriter<W, R> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            buf: Vec::new(),
            bufpos: 0,
            stage: Vec::new(),
            stagepos: 0,
            payload: None,
            pad: 0,
            terminated: false,
        }
    }

    fn idle(&self) -> bool {
        self.bufpos >= self.buf.len()
            && self.stagepos >= self.stage.len()
            && self.payload.is_none()
            && self.pad == 0
    }

    /// Writes out everything queued: header bytes, the in-flight payload,
    /// its padding.
    fn poll_drive(&mut self, ctx: &mut Context<'_>) -> Poll<Result<()>> {
        const STAGE: usize = 8 * 1024;
        loop {
            if self.bufpos < self.buf.len() {
                let n = ready!(Pin::new(&mut self.sink)
                    .poll_write(ctx, &self.buf[self.bufpos..])
                    .map_err(Error::from));
                if n == 0 {
                    return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero).into()));
                }
                self.bufpos += n;
                continue;
            }
            self.buf.clear();
            self.bufpos = 0;
            if self.stagepos < self.stage.len() {
                let n = ready!(Pin::new(&mut self.sink)
                    .poll_write(ctx, &self.stage[self.stagepos..])
                    .map_err(Error::from));
                if n == 0 {
                    return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero).into()));
                }
                self.stagepos += n;
                continue;
            }
            self.stage.clear();
            self.stagepos = 0;
            if let Some((reader, owed)) = &mut self.payload {
                if *owed > 0 {
                    let want = (*owed).min(STAGE as u64) as usize;
                    self.stage.resize(want, 0);
                    let n = ready!(Pin::new(reader)
                        .poll_read(ctx, &mut self.stage)
                        .map_err(Error::from));
                    if n == 0 {
                        self.stage.clear();
                        let owed = *owed;
                        return Poll::Ready(Err(Error::BadNumeric(format!(
                            "payload ended {} bytes short of the declared size",
                            owed
                        ))));
                    }
                    *owed -= n as u64;
                    self.stage.truncate(n);
                    continue;
                }
                self.payload = None;
            }
            if self.pad > 0 {
                self.buf.resize(self.pad, 0);
                self.pad = 0;
                continue;
            }
            return Poll::Ready(Ok(()));
        }
    }

    fn encode_item(&mut self, item: TarItem<R>) -> Result<()> {
        let TarItem {
            mut name,
            kind,
            mut size,
            mode,
            uid,
            gid,
            mtime_ms,
            uname,
            gname,
            devmajor,
            devminor,
            linkname,
            mut payload,
        } = item;
        if kind == EntryKind::Directory && !name.ends_with('/') {
            name.push('/');
        }
        if kind == EntryKind::Symlink {
            // symlinks carry no bytes on the wire; any payload is cancelled
            size = 0;
            payload = None;
        }
        if payload.is_none() && size > 0 {
            return Err(Error::BadNumeric(format!(
                "{} bytes declared without a payload",
                size
            )));
        }
        let mtime = mtime_ms.unwrap_or_else(now_ms) / 1000;
        let mode = mode.unwrap_or(match kind {
            EntryKind::Directory => 0o755,
            _ => 0o644,
        });

        let mut pax = Vec::new();
        let (field_name, field_prefix) = match place_name(&name) {
            Placed::Plain => (name.as_str(), ""),
            Placed::Split(at) => (&name[at + 1..], &name[..at]),
            Placed::Pax => {
                pax.push(("path", name.as_str()));
                ("", "")
            }
        };
        let linkname = linkname.as_deref().unwrap_or("");
        if linkname.len() > 100 {
            pax.push(("linkpath", linkname));
        }
        let placeholder;
        let field_name = if field_name.is_empty() && !name.is_empty() {
            placeholder = pax_placeholder(&name);
            placeholder.as_str()
        } else {
            field_name
        };

        if !pax.is_empty() {
            let mut records = Vec::new();
            for (key, value) in &pax {
                pax_record(key, value, &mut records);
            }
            let mut block = HeaderBlock::new();
            block.write_str(HeaderBlock::NAME, field_name);
            block.write_num(HeaderBlock::MODE, 0o644);
            block.write_num(HeaderBlock::UID, uid);
            block.write_num(HeaderBlock::GID, gid);
            block.write_num(HeaderBlock::SIZE, records.len() as u64);
            block.write_num(HeaderBlock::MTIME, mtime);
            block.record[HeaderBlock::TYPEFLAG] = TYPE_PAX_LOCAL;
            block.record[HeaderBlock::MAGIC].copy_from_slice(b"ustar\0");
            block.record[HeaderBlock::VERSION].copy_from_slice(b"00");
            block.write_checksum();
            self.buf.extend_from_slice(&block.record);
            self.buf.extend_from_slice(&records);
            self.buf
                .extend(std::iter::repeat(0u8).take(padding(records.len() as u64) as usize));
        }

        let mut block = HeaderBlock::new();
        block.write_str(HeaderBlock::NAME, field_name);
        block.write_str(HeaderBlock::PREFIX, field_prefix);
        block.write_num(HeaderBlock::MODE, mode as u64);
        block.write_num(HeaderBlock::UID, uid);
        block.write_num(HeaderBlock::GID, gid);
        block.write_num(HeaderBlock::SIZE, size);
        block.write_num(HeaderBlock::MTIME, mtime);
        block.record[HeaderBlock::TYPEFLAG] = match kind {
            EntryKind::File => TYPE_FILE,
            EntryKind::Link => TYPE_LINK,
            EntryKind::Symlink => TYPE_SYMLINK,
            EntryKind::Directory => TYPE_DIRECTORY,
        };
        block.write_str(HeaderBlock::LINKNAME, linkname);
        block.record[HeaderBlock::MAGIC].copy_from_slice(b"ustar\0");
        block.record[HeaderBlock::VERSION].copy_from_slice(b"00");
        block.write_str(HeaderBlock::UNAME, &uname);
        block.write_str(HeaderBlock::GNAME, &gname);
        block.write_num(HeaderBlock::DEVMAJOR, devmajor as u64);
        block.write_num(HeaderBlock::DEVMINOR, devminor as u64);
        block.write_checksum();
        self.buf.extend_from_slice(&block.record);

        self.payload = payload.map(|r| (r, size));
        self.pad = padding(size) as usize;
        Ok(())
    }
}

enum Placed {
    Plain,
    Split(usize),
    Pax,
}

/// USTAR name placement: the name field when it fits, a prefix/name split
/// when some `/` leaves both halves in range, PAX otherwise.
fn place_name(name: &str) -> Placed {
    let bytes = name.as_bytes();
    if bytes.len() <= 100 {
        return Placed::Plain;
    }
    let low = bytes.len().saturating_sub(101);
    for i in (1..=155.min(bytes.len() - 1)).rev() {
        if i < low {
            break;
        }
        if bytes[i] == b'/' && i + 1 < bytes.len() && bytes.len() - i - 1 <= 100 {
            return Placed::Split(i);
        }
    }
    Placed::Pax
}

/// `PaxHeader/` + the last 99 characters of the basename; the header
/// field write truncates the result to its 100 bytes.
fn pax_placeholder(name: &str) -> String {
    let base = name
        .rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or(name);
    let skip = base.chars().count().saturating_sub(99);
    let tail: String = base.chars().skip(skip).collect();
    format!("PaxHeader/{}", tail)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> Sink<TarItem<R>> for TarWriter<W, R> {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Result<()>> {
        self.get_mut().poll_drive(ctx)
    }

    fn start_send(self: Pin<&mut Self>, item: TarItem<R>) -> Result<()> {
        let this = self.get_mut();
        debug_assert!(this.idle(), "start_send before poll_ready");
        if this.terminated {
            return Err(Error::BadPrecondition("archive already closed".into()));
        }
        this.encode_item(item)
    }

    fn poll_flush(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drive(ctx));
        Pin::new(&mut this.sink)
            .poll_flush(ctx)
            .map_err(Error::from)
    }

    fn poll_close(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drive(ctx));
        if !this.terminated {
            // two all-zero blocks terminate the archive
            this.terminated = true;
            this.buf.resize(2 * BLOCK_SIZE, 0);
            this.bufpos = 0;
        }
        ready!(this.poll_drive(ctx));
        ready!(Pin::new(&mut this.sink)
            .poll_flush(ctx)
            .map_err(Error::from));
        Pin::new(&mut this.sink)
            .poll_close(ctx)
            .map_err(Error::from)
    }
}
