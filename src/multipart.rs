//! Streaming multipart/form-data codec
//!
//! [`MultipartReader`] parses a body into a sequence of parts without ever
//! buffering more than a block of payload; [`MultipartWriter`] is the
//! inverse sink. Sized parts (Content-Length present) are read without
//! scanning; everything else goes through the boundary search.

use {
    crate::{
        block::BlockReader,
        boundary::{BoundaryScan, Scan},
        error::{Error, Result},
        headers::{self, HeaderMap},
        source::Source,
    },
    futures::Sink,
    futures_lite::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite},
        Stream,
    },
    once_cell::sync::OnceCell,
    rand::Rng,
    std::{
        io,
        pin::Pin,
        sync::{Arc, Mutex, MutexGuard},
        task::{Context, Poll},
    },
};

const BLOCK_SIZE: usize = 4096;
const PREAMBLE_MAX: usize = 16 * 1024;
const HEADER_LINE_MAX: usize = 16 * 1024;
const HEADERS_MAX: usize = 32 * 1024;

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

// ---------------------------------------------------------------------------
// process boundary id

static BOUNDARY: OnceCell<String> = OnceCell::new();

/// The process-wide boundary id: `----formdata-` plus sixteen random
/// base-36 characters, generated once on first use.
pub fn boundary() -> &'static str {
    BOUNDARY.get_or_init(|| generate_boundary(&mut rand::thread_rng()))
}

fn generate_boundary(rng: &mut impl Rng) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut id = String::from("----formdata-");
    for _ in 0..16 {
        id.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
    }
    id
}

/// Content-Type announcing the process boundary.
pub fn content_type() -> String {
    format!("multipart/form-data; boundary={}", boundary())
}

// ---------------------------------------------------------------------------
// decode

#[derive(Debug, PartialEq, Eq)]
enum Stage {
    /// Scanning for the leading `--boundary`; at most 16 KiB of preamble.
    Preamble,
    /// Just past a `--boundary`: the next two bytes decide headers or end.
    Boundary,
    Headers,
    /// A part is open; its payload state lives in `Body`.
    Body,
    /// A sized payload was consumed; the literal `\r\n--boundary` must follow.
    Trailer,
    Epilogue,
    Done,
}

enum Body {
    None,
    Sized { remaining: u64 },
    Unsized {
        scan: BoundaryScan,
        buffered: Vec<u8>,
        bufpos: usize,
        done: bool,
    },
}

struct PartMeta {
    name: String,
    field_name: Option<String>,
    filename: Option<String>,
    content_type: String,
    size: Option<u64>,
    headers: HeaderMap,
}

struct MpInner<S> {
    reader: BlockReader<S>,
    /// `\r\n--boundary`: the inter-part trailer and unsized-body pattern.
    trailer: Vec<u8>,
    stage: Stage,
    body: Body,
    preamble: Option<BoundaryScan>,
    preamble_seen: usize,
    trailer_pos: usize,
    delim: [u8; 2],
    delim_len: usize,
    line: Vec<u8>,
    headers_total: usize,
    headers: HeaderMap,
    epilogue_skip: u64,
    seq: u64,
    part_open: bool,
}

impl<S: Source> MpInner<S> {
    fn new(source: S, boundary: &str) -> Result<Self> {
        let open = format!("--{}", boundary).into_bytes();
        let trailer = format!("\r\n--{}", boundary).into_bytes();
        let preamble = BoundaryScan::new(open, BLOCK_SIZE)?;
        Ok(Self {
            reader: BlockReader::new(source, BLOCK_SIZE),
            trailer,
            stage: Stage::Preamble,
            body: Body::None,
            preamble: Some(preamble),
            preamble_seen: 0,
            trailer_pos: 0,
            delim: [0; 2],
            delim_len: 0,
            line: Vec::new(),
            headers_total: 0,
            headers: HeaderMap::new(),
            epilogue_skip: 0,
            seq: 0,
            part_open: false,
        })
    }

    fn fail(&mut self, err: Error) -> Poll<Option<Result<PartMeta>>> {
        self.stage = Stage::Done;
        Poll::Ready(Some(Err(err)))
    }

    fn poll_part(&mut self, ctx: &mut Context<'_>) -> Poll<Option<Result<PartMeta>>> {
        if self.part_open {
            self.part_open = false;
            self.seq += 1;
        }
        loop {
            match self.stage {
                Stage::Done => return Poll::Ready(None),
                Stage::Preamble => {
                    let scan = self.preamble.as_mut().expect("preamble scan");
                    match ready_opt!(scan.poll_scan(&mut self.reader, ctx)) {
                        Scan::Data(skipped) => {
                            self.preamble_seen += skipped.len();
                            if self.preamble_seen > PREAMBLE_MAX {
                                return self
                                    .fail(Error::LimitExceeded("multipart preamble", PREAMBLE_MAX));
                            }
                        }
                        Scan::Found => {
                            self.preamble = None;
                            self.stage = Stage::Boundary;
                            self.delim_len = 0;
                        }
                        Scan::Eof => {
                            return self.fail(Error::UnexpectedEof("the leading boundary"));
                        }
                    }
                }
                Stage::Boundary => {
                    while self.delim_len < 2 {
                        match ready_opt!(self.reader.poll_pull(ctx, 2 - self.delim_len)) {
                            None => {
                                return self.fail(Error::UnexpectedEof("a boundary delimiter"));
                            }
                            Some(slice) => {
                                let n = slice.len();
                                self.delim[self.delim_len..self.delim_len + n]
                                    .copy_from_slice(slice);
                                self.delim_len += n;
                            }
                        }
                    }
                    match &self.delim {
                        b"--" => {
                            // closing boundary; swallow the CRLF-ish tail
                            self.stage = Stage::Epilogue;
                            self.epilogue_skip = 4;
                        }
                        b"\r\n" => {
                            self.stage = Stage::Headers;
                            self.line.clear();
                            self.headers_total = 0;
                            self.headers = HeaderMap::new();
                        }
                        other => {
                            let err = Error::BadHeader(format!(
                                "malformed boundary delimiter {:?}",
                                other
                            ));
                            return self.fail(err);
                        }
                    }
                }
                Stage::Epilogue => {
                    // EOF here is expected; any shortfall is fine
                    ready_opt!(self.reader.poll_skip(ctx, &mut self.epilogue_skip));
                    self.stage = Stage::Done;
                    tracing::debug!("multipart body complete");
                    return Poll::Ready(None);
                }
                Stage::Headers => {
                    loop {
                        let newline = match ready_opt!(self.reader.poll_pull(ctx, BLOCK_SIZE)) {
                            None => return self.fail(Error::UnexpectedEof("part headers")),
                            Some(slice) => {
                                let newline = slice.iter().position(|b| *b == b'\n');
                                let take = newline.map(|i| i + 1).unwrap_or(slice.len());
                                self.line.extend_from_slice(&slice[..take]);
                                let unread = slice.len() - take;
                                self.reader.rewind(unread);
                                newline
                            }
                        };
                        if newline.is_none() {
                            if self.line.len() > HEADER_LINE_MAX {
                                return self
                                    .fail(Error::LimitExceeded("header line", HEADER_LINE_MAX));
                            }
                            continue;
                        }
                        if self.line.len() > HEADER_LINE_MAX {
                            return self.fail(Error::LimitExceeded("header line", HEADER_LINE_MAX));
                        }
                        if self.line.len() < 2 || !self.line.ends_with(b"\r\n") {
                            return self.fail(Error::BadHeader(
                                "header line not terminated by CRLF".into(),
                            ));
                        }
                        let content_len = self.line.len() - 2;
                        if content_len == 0 {
                            // blank line: headers are complete
                            self.line.clear();
                            match self.finish_headers() {
                                Ok(meta) => {
                                    self.stage = Stage::Body;
                                    self.part_open = true;
                                    self.seq += 1;
                                    tracing::trace!(name = %meta.name, size = ?meta.size, "multipart part");
                                    return Poll::Ready(Some(Ok(meta)));
                                }
                                Err(err) => return self.fail(err),
                            }
                        }
                        self.headers_total += self.line.len();
                        if self.headers_total > HEADERS_MAX {
                            return self.fail(Error::LimitExceeded("part headers", HEADERS_MAX));
                        }
                        let line = match std::str::from_utf8(&self.line[..content_len]) {
                            Ok(line) => line,
                            Err(_) => {
                                return self
                                    .fail(Error::BadHeader("header line is not UTF-8".into()));
                            }
                        };
                        match headers::split_header_line(line) {
                            Ok((name, value)) => self.headers.append(name, value),
                            Err(err) => return self.fail(err),
                        }
                        self.line.clear();
                    }
                }
                Stage::Body => match &mut self.body {
                    Body::None => {
                        self.stage = Stage::Boundary;
                        self.delim_len = 0;
                    }
                    Body::Sized { remaining } => {
                        let short = ready_opt!(self.reader.poll_skip(ctx, remaining));
                        if short > 0 {
                            return self.fail(Error::UnexpectedEof("part payload"));
                        }
                        self.body = Body::None;
                        self.stage = Stage::Trailer;
                        self.trailer_pos = 0;
                    }
                    Body::Unsized { scan, done, .. } => {
                        if *done {
                            self.body = Body::None;
                            self.stage = Stage::Boundary;
                            self.delim_len = 0;
                            continue;
                        }
                        match ready_opt!(scan.poll_scan(&mut self.reader, ctx)) {
                            Scan::Data(_) => {}
                            Scan::Found => {
                                self.body = Body::None;
                                self.stage = Stage::Boundary;
                                self.delim_len = 0;
                            }
                            Scan::Eof => {
                                return self.fail(Error::UnexpectedEof("part payload"));
                            }
                        }
                    }
                },
                Stage::Trailer => {
                    while self.trailer_pos < self.trailer.len() {
                        let want = self.trailer.len() - self.trailer_pos;
                        match ready_opt!(self.reader.poll_pull(ctx, want)) {
                            None => return self.fail(Error::BadBoundary),
                            Some(slice) => {
                                let expect = &self.trailer[self.trailer_pos..][..slice.len()];
                                if slice != expect {
                                    return self.fail(Error::BadBoundary);
                                }
                                self.trailer_pos += slice.len();
                            }
                        }
                    }
                    self.stage = Stage::Boundary;
                    self.delim_len = 0;
                }
            }
        }
    }

    fn finish_headers(&mut self) -> Result<PartMeta> {
        let headers = std::mem::take(&mut self.headers);
        let disposition = headers.get("content-disposition").ok_or_else(|| {
            Error::BadHeader("part without a Content-Disposition header".into())
        })?;
        let (field_name, filename) = headers::parse_disposition(disposition)?;
        let name = filename
            .clone()
            .or_else(|| field_name.clone())
            .ok_or_else(|| Error::BadHeader("part without a name or filename".into()))?;
        let content_type = headers
            .get("content-type")
            .filter(|v| !v.is_empty())
            .unwrap_or("application/octet-stream")
            .to_string();
        let size = headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        self.body = match size {
            Some(n) => Body::Sized { remaining: n },
            None => Body::Unsized {
                scan: BoundaryScan::new(self.trailer.clone(), BLOCK_SIZE)?,
                buffered: Vec::new(),
                bufpos: 0,
                done: false,
            },
        };
        Ok(PartMeta {
            name,
            field_name,
            filename,
            content_type,
            size,
            headers,
        })
    }
}

fn lock_inner<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("pipeline lock: {}", err)))
}

/// Streaming multipart decoder: a `Stream` of [`Part`].
///
/// Advancing the stream drains whatever is left of the previous part's
/// payload, including its trailer verification.
pub struct MultipartReader<S: Source> {
    inner: Arc<Mutex<MpInner<S>>>,
}

impl<S: Source> MultipartReader<S> {
    /// `content_type` must carry a `boundary` parameter.
    pub fn new(source: S, content_type: &str) -> Result<Self> {
        let boundary = headers::boundary_param(content_type).ok_or_else(|| {
            Error::BadHeader(format!("no boundary parameter in {:?}", content_type))
        })?;
        Ok(Self {
            inner: Arc::new(Mutex::new(MpInner::new(source, boundary)?)),
        })
    }
}

impl<S: Source> Stream for MultipartReader<S> {
    type Item = Result<Part<S>>;

    fn poll_next(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut inner = match lock_inner(&this.inner) {
            Ok(inner) => inner,
            Err(err) => return Poll::Ready(Some(Err(err.into()))),
        };
        let meta = match inner.poll_part(ctx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
            Poll::Ready(Some(Ok(meta))) => meta,
        };
        let seq = inner.seq;
        drop(inner);
        Poll::Ready(Some(Ok(Part {
            meta,
            seq,
            inner: Arc::clone(&this.inner),
        })))
    }
}

/// One decoded part: headers by value plus a one-shot lazy payload.
pub struct Part<S: Source> {
    meta: PartMeta,
    seq: u64,
    inner: Arc<Mutex<MpInner<S>>>,
}

impl<S: Source> Part<S> {
    /// Effective name: the filename when present, the field name otherwise.
    pub fn name(&self) -> &str {
        &self.meta.name
    }
    /// The `name` parameter of Content-Disposition, verbatim.
    pub fn field_name(&self) -> Option<&str> {
        self.meta.field_name.as_deref()
    }
    pub fn filename(&self) -> Option<&str> {
        self.meta.filename.as_deref()
    }
    /// Content-Type, defaulting to `application/octet-stream`.
    pub fn content_type(&self) -> &str {
        &self.meta.content_type
    }
    /// Content-Length when it was present and parseable.
    pub fn size(&self) -> Option<u64> {
        self.meta.size
    }
    /// Every header the part arrived with.
    pub fn headers(&self) -> &HeaderMap {
        &self.meta.headers
    }

    /// The part's payload. Reading it consumes bytes from the shared
    /// pipeline; once the part stream has been advanced the handle is
    /// stale and reads fail.
    pub fn body(&self) -> PartBody<S> {
        PartBody {
            seq: self.seq,
            inner: Arc::clone(&self.inner),
        }
    }

    pub async fn bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.meta.size.unwrap_or(0).min(64 * 1024) as usize);
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

/// Lazy payload of a [`Part`].
pub struct PartBody<S: Source> {
    seq: u64,
    inner: Arc<Mutex<MpInner<S>>>,
}

impl<S: Source> AsyncRead for PartBody<S> {
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
                "part payload read after the stream advanced",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let inner = &mut *inner;
        match &mut inner.body {
            Body::None => Poll::Ready(Ok(0)),
            Body::Sized { remaining } => {
                if *remaining == 0 {
                    return Poll::Ready(Ok(0));
                }
                let want = (*remaining).min(buf.len() as u64) as usize;
                match inner.reader.poll_pull(ctx, want) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
                    Poll::Ready(Ok(None)) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected EOF while reading part payload",
                    ))),
                    Poll::Ready(Ok(Some(slice))) => {
                        let n = slice.len();
                        buf[..n].copy_from_slice(slice);
                        *remaining -= n as u64;
                        Poll::Ready(Ok(n))
                    }
                }
            }
            Body::Unsized {
                scan,
                buffered,
                bufpos,
                done,
            } => {
                loop {
                    if *bufpos < buffered.len() {
                        let n = (buffered.len() - *bufpos).min(buf.len());
                        buf[..n].copy_from_slice(&buffered[*bufpos..*bufpos + n]);
                        *bufpos += n;
                        return Poll::Ready(Ok(n));
                    }
                    if *done {
                        return Poll::Ready(Ok(0));
                    }
                    match scan.poll_scan(&mut inner.reader, ctx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
                        Poll::Ready(Ok(Scan::Data(data))) => {
                            *buffered = data;
                            *bufpos = 0;
                        }
                        Poll::Ready(Ok(Scan::Found)) => *done = true,
                        Poll::Ready(Ok(Scan::Eof)) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "unexpected EOF while reading part payload",
                            )));
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// encode

enum Payload<R> {
    Bytes(Vec<u8>),
    Reader(R),
}

/// One part handed to a [`MultipartWriter`].
pub struct FormPart<R> {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    size: Option<u64>,
    payload: Payload<R>,
}

impl<R> FormPart<R> {
    /// A plain text field. Streamed without a Content-Length, like any
    /// other source of unknown size.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            size: None,
            payload: Payload::Bytes(value.into().into_bytes()),
        }
    }

    /// A file field streamed from `payload`.
    pub fn file(name: impl Into<String>, filename: impl Into<String>, payload: R) -> Self {
        Self {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: None,
            size: None,
            payload: Payload::Reader(payload),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Declares the payload size; nonzero sizes are emitted as
    /// Content-Length and let the decoder skip boundary scanning.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

struct BodyOut<R> {
    reader: R,
    owed: Option<u64>,
}

/// Streaming multipart encoder: a `Sink` of [`FormPart`] over any
/// `AsyncWrite`. `close` emits the closing boundary.
pub struct MultipartWriter<W, R> {
    sink: W,
    boundary: String,
    buf: Vec<u8>,
    bufpos: usize,
    stage: Vec<u8>,
    stagepos: usize,
    body: Option<BodyOut<R>>,
    closed: bool,
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> MultipartWriter<W, R> {
    /// A writer using the process boundary id; pair it with
    /// [`content_type`].
    pub fn new(sink: W) -> Self {
        Self::with_boundary(sink, boundary())
    }

    /// A writer with an explicit boundary, for callers that already
    /// announced one.
    pub fn with_boundary(sink: W, boundary: impl Into<String>) -> Self {
        Self {
            sink,
            boundary: boundary.into(),
            buf: Vec::new(),
            bufpos: 0,
            stage: Vec::new(),
            stagepos: 0,
            body: None,
            closed: false,
        }
    }

    fn idle(&self) -> bool {
        self.bufpos >= self.buf.len() && self.stagepos >= self.stage.len() && self.body.is_none()
    }

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
            if let Some(body) = &mut self.body {
                let want = match body.owed {
                    Some(0) => 0,
                    Some(owed) => owed.min(STAGE as u64) as usize,
                    None => STAGE,
                };
                if want > 0 {
                    self.stage.resize(want, 0);
                    let n = ready!(Pin::new(&mut body.reader)
                        .poll_read(ctx, &mut self.stage)
                        .map_err(Error::from));
                    if n == 0 {
                        self.stage.clear();
                        if let Some(owed) = body.owed {
                            return Poll::Ready(Err(Error::BadNumeric(format!(
                                "part payload ended {} bytes short of its declared size",
                                owed
                            ))));
                        }
                    } else {
                        if let Some(owed) = &mut body.owed {
                            *owed -= n as u64;
                        }
                        self.stage.truncate(n);
                        continue;
                    }
                }
                // payload finished; terminate the part line
                self.body = None;
                self.buf.extend_from_slice(b"\r\n");
                continue;
            }
            return Poll::Ready(Ok(()));
        }
    }

    fn encode_part(&mut self, part: FormPart<R>) {
        self.buf.extend_from_slice(b"--");
        self.buf.extend_from_slice(self.boundary.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        let mut disposition = String::from("Content-Disposition: form-data; name=\"");
        headers::encode_name(&part.name, &mut disposition);
        disposition.push('"');
        if let Some(filename) = &part.filename {
            disposition.push_str("; filename=\"");
            headers::encode_name(filename, &mut disposition);
            disposition.push('"');
        }
        disposition.push_str("\r\n");
        self.buf.extend_from_slice(disposition.as_bytes());
        if let Some(content_type) = part.content_type.as_deref().filter(|t| !t.is_empty()) {
            self.buf.extend_from_slice(b"Content-Type: ");
            self.buf.extend_from_slice(content_type.as_bytes());
            self.buf.extend_from_slice(b"\r\n");
        }
        if let Some(size) = part.size.filter(|s| *s > 0) {
            self.buf
                .extend_from_slice(format!("Content-Length: {}\r\n", size).as_bytes());
        }
        self.buf.extend_from_slice(b"\r\n");
        match part.payload {
            Payload::Bytes(bytes) => {
                self.buf.extend_from_slice(&bytes);
                self.buf.extend_from_slice(b"\r\n");
            }
            Payload::Reader(reader) => {
                self.body = Some(BodyOut {
                    reader,
                    owed: part.size,
                });
            }
        }
    }
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> Sink<FormPart<R>> for MultipartWriter<W, R> {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Result<()>> {
        self.get_mut().poll_drive(ctx)
    }

    fn start_send(self: Pin<&mut Self>, part: FormPart<R>) -> Result<()> {
        let this = self.get_mut();
        debug_assert!(this.idle(), "start_send before poll_ready");
        if this.closed {
            return Err(Error::BadPrecondition("multipart body already closed".into()));
        }
        this.encode_part(part);
        Ok(())
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
        if !this.closed {
            this.closed = true;
            this.buf.extend_from_slice(b"--");
            this.buf.extend_from_slice(this.boundary.as_bytes());
            this.buf.extend_from_slice(b"--\r\n\r\n");
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
