use std::io;

use thiserror::Error;

/// Errors produced by archive operations.
///
/// Mutating operations are fail-fast: on the first error they abort and leave
/// the in-memory header unchanged. The on-disk file may contain trailing
/// garbage written after the last successful header write; callers are
/// expected to discard the archive in that case.
#[derive(Debug, Error)]
pub enum Error {
    #[error("file or header not found")]
    NotFound,

    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    #[error("no space left in header tables")]
    NoSpace,

    #[error("part id already exists")]
    Exists,

    #[error("read error")]
    ReadError(#[source] io::Error),

    #[error("write error")]
    WriteError(#[source] io::Error),

    #[error("seek error")]
    SeekError(#[source] io::Error),

    #[error("unexpected byte range length")]
    SizeError,

    #[error("unsupported hash kind")]
    UnsupportedHash,

    #[error("unsupported signature kind")]
    UnsupportedSignature,

    #[error("payload hash mismatch")]
    PayloadHashMismatch,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("{0}")]
    Failed(String),
}

impl Error {
    /// Stable numeric code for this error kind, used as the process exit
    /// code by the command line tool.
    pub fn code(&self) -> u8 {
        match self {
            Error::NotFound => 1,
            Error::InvalidHeader(_) => 2,
            Error::NoSpace => 3,
            Error::Exists => 4,
            Error::ReadError(_) => 5,
            Error::WriteError(_) => 6,
            Error::SeekError(_) => 7,
            Error::SizeError => 8,
            Error::UnsupportedHash => 9,
            Error::UnsupportedSignature => 10,
            Error::PayloadHashMismatch => 11,
            Error::InvalidSignature => 12,
            Error::InvalidArgument(_) => 13,
            Error::Failed(_) => 14,
        }
    }
}

/// Result with [`Error`] as error type.
pub type Result<T> = std::result::Result<T, Error>;
