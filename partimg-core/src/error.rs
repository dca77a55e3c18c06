//! Error types shared by every `partimg-core` operation.
//!
//! Each variant belongs to one stable category (see [`Error::category`]) so
//! front-ends can report failures uniformly while still showing the
//! underlying I/O error text.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::checksum::ChecksumAlgorithm;

/// The section of an image a CRC guard protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSection {
    Header,
    Bitmap,
}

impl std::fmt::Display for ImageSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSection::Header => f.write_str("image header"),
            ImageSection::Bitmap => f.write_str("allocation bitmap"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Bad magic, unknown version or codes, inconsistent geometry.
    #[error("invalid image format: {0}")]
    Format(String),

    /// The endianness tag is not the one this build writes.
    #[error("unsupported image endianness tag {found:#06x}")]
    Endianness { found: u16 },

    /// A CRC guard over the header or bitmap did not match.
    #[error("corrupt {section}: stored crc {stored:#010x}, computed {computed:#010x}")]
    Corrupt {
        section: ImageSection,
        stored: u32,
        computed: u32,
    },

    /// A checksum group in the data stream did not match its tag.
    #[error(
        "checksum mismatch in group ending at block {block} ({algorithm}): stored {stored:#010x}, computed {computed:#010x}"
    )]
    ChecksumMismatch {
        block: u64,
        algorithm: ChecksumAlgorithm,
        stored: u32,
        computed: u32,
        /// The image was written with the historical non-advancing CRC, so
        /// the mismatch is diagnostic rather than conclusive.
        legacy: bool,
    },

    #[error("read error at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("write error at offset {offset}: {source}")]
    Write {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("block index {index} out of range for bitmap of {total} blocks")]
    OutOfRange { index: u64, total: u64 },

    #[error("not enough space on target: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("not enough memory: need {needed} bytes, {available} available")]
    InsufficientMemory { needed: u64, available: u64 },

    #[error("operation cancelled by user")]
    Cancelled,

    #[error("target {} already exists (overwrite not allowed)", .0.display())]
    TargetExists(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("verification failed: allocated data differs in chunk starting at block {block}")]
    VerifyMismatch { block: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// A stable, lowercase category name suitable for logs and exit reports.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Format(_) | Error::Endianness { .. } => "format",
            Error::Corrupt { .. } => "corrupt",
            Error::ChecksumMismatch { .. } => "checksum-mismatch",
            Error::Read { .. } => "read",
            Error::Write { .. } => "write",
            Error::OutOfRange { .. } => "out-of-range",
            Error::InsufficientSpace { .. } => "insufficient-space",
            Error::InsufficientMemory { .. } => "insufficient-memory",
            Error::Cancelled => "cancelled",
            Error::TargetExists(_) => "target-exists",
            Error::InvalidConfig(_) => "config",
            Error::VerifyMismatch { .. } => "verify",
            Error::Io(_) => "io",
        }
    }

    pub(crate) fn read(offset: u64, source: io::Error) -> Self {
        Error::Read { offset, source }
    }

    pub(crate) fn write(offset: u64, source: io::Error) -> Self {
        Error::Write { offset, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
