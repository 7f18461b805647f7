//! Streaming codecs for tar archives and multipart/form-data bodies
//!
//! Four pipelines over arbitrary chunked byte sources, each running in
//! memory bounded by a block, independent of payload sizes:
//!
//! - [`untar`] — decode a tar stream into a lazy sequence of entries
//! - [`TarWriter`] — encode a sequence of entries into a tar stream
//! - [`parse_multipart`] — decode a multipart body into a lazy sequence
//!   of parts
//! - [`MultipartWriter`] — encode a sequence of parts into a multipart
//!   body
//!
//! Decoders are `Stream`s whose items expose their payloads as
//! `AsyncRead`; encoders are `Sink`s over any `AsyncWrite`. A caller may
//! abandon any entry's payload at any point; advancing the sequence
//! discards the rest of it and lands exactly on the next entry.

mod block;
mod boundary;
mod error;
mod headers;
mod multipart;
mod source;
mod tar;

pub use {
    block::BlockReader,
    boundary::{BoundaryScan, Pattern, Scan},
    error::{Error, Result},
    headers::HeaderMap,
    multipart::{
        boundary as multipart_boundary, content_type as multipart_content_type, FormPart,
        MultipartReader, MultipartWriter, Part, PartBody,
    },
    source::{chunks, once, reader, Chunks, ReaderSource, Source},
    tar::{EntryKind, TarBody, TarEntry, TarItem, TarReader, TarWriter},
};

/// Decodes a tar archive from any chunked byte source.
pub fn untar<S: Source>(source: S) -> TarReader<S> {
    TarReader::new(source)
}

/// Decodes a multipart/form-data body; `content_type` must carry the
/// boundary parameter.
pub fn parse_multipart<S: Source>(source: S, content_type: &str) -> Result<MultipartReader<S>> {
    MultipartReader::new(source, content_type)
}
