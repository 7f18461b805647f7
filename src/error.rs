//! Errors

use std::io;

/// Result wrapper
pub type Result<T> = std::result::Result<T, Error>;

/// Crate errors
///
/// Every error is fatal to the pipeline that produced it: the entry
/// sequence must be discarded together with the underlying source.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unexpected end of stream while reading {0}")]
    UnexpectedEof(&'static str),

    #[error("malformed header: {0}")]
    BadHeader(String),

    #[error("header checksum mismatch on unrecognised entry type {0:#04x}")]
    BadChecksum(u8),

    #[error("{0} exceeds {1} bytes")]
    LimitExceeded(&'static str, usize),

    #[error("part trailer does not match the expected boundary")]
    BadBoundary,

    #[error("invalid size: {0}")]
    BadNumeric(String),

    #[error("{0}")]
    BadPrecondition(String),

    #[error("I/O error: {0:?}")]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(err) => err,
            Error::UnexpectedEof(_) => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            _ => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}
