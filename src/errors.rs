use snafu::{IntoError, Snafu};
use std::io;
use std::path::PathBuf;

use crate::hash::Sha1Hash;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable error identities.
///
/// The numeric values are part of the external contract (a command-line
/// driver maps them to exit codes) and must never be renumbered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    Read = 1,
    Write = 2,
    Open = 3,
    Seek = 4,
    DecompressionFailed = 5,
    InvalidResourceHash = 6,
    InvalidReparseData = 7,
    InvalidMetadata = 8,
    InvalidHeader = 9,
    InvalidSecurityData = 10,
    Unsupported = 11,
    ImageNameCollision = 12,
    NoImage = 13,
    NotADirectory = 14,
    ImageCountMismatch = 15,
    OutOfMemory = 16,
    Cancelled = 17,
    NtfsVolume = 18,
}

impl ErrorKind {
    /// The numeric value a command-line driver reports as its exit code.
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Snafu)]
pub struct Error(ErrorInner);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self.0 {
            ErrorInner::Read { .. } => ErrorKind::Read,
            ErrorInner::Write { .. } => ErrorKind::Write,
            ErrorInner::Open { .. } => ErrorKind::Open,
            ErrorInner::Decompression { .. } | ErrorInner::CorruptChunkTable { .. } => {
                ErrorKind::DecompressionFailed
            }
            ErrorInner::ResourceHash { .. } => ErrorKind::InvalidResourceHash,
            ErrorInner::BadReparseData { .. } => ErrorKind::InvalidReparseData,
            ErrorInner::BadMetadata { .. } => ErrorKind::InvalidMetadata,
            ErrorInner::BadHeader { .. } => ErrorKind::InvalidHeader,
            ErrorInner::BadSecurityData { .. } => ErrorKind::InvalidSecurityData,
            ErrorInner::UnsupportedFeature { .. } | ErrorInner::Unsupported { .. } => {
                ErrorKind::Unsupported
            }
            ErrorInner::ImageNameCollision { .. } => ErrorKind::ImageNameCollision,
            ErrorInner::NoImage { .. } => ErrorKind::NoImage,
            ErrorInner::NotADirectory { .. } => ErrorKind::NotADirectory,
            ErrorInner::ImageCountMismatch { .. } => ErrorKind::ImageCountMismatch,
            ErrorInner::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            ErrorInner::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum ErrorInner {
    #[snafu(display("Unable to open {}: {}", path.display(), source))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("Read of {} bytes at offset {} failed: {}", len, offset, source))]
    Read {
        offset: u64,
        len: u64,
        source: io::Error,
    },

    #[snafu(display("Write at offset {} failed: {}", offset, source))]
    Write { offset: u64, source: io::Error },

    #[snafu(display("Chunk {} of a compressed resource failed to decompress", chunk))]
    Decompression { chunk: u64 },

    #[snafu(display(
        "Corrupt chunk table: chunk {} would have a stored size of {} bytes",
        chunk,
        size
    ))]
    CorruptChunkTable { chunk: u64, size: i64 },

    #[snafu(display("Blob should hash to {} but hashed to {}", expected, actual))]
    ResourceHash {
        expected: Sha1Hash,
        actual: Sha1Hash,
    },

    #[snafu(display("Header error: {}", source))]
    BadHeader { source: HeaderError },

    #[snafu(display("Metadata error: {}", source))]
    BadMetadata { source: MetadataError },

    #[snafu(display("Invalid reparse data: {}", reason))]
    BadReparseData { reason: String },

    #[snafu(display("Invalid security data: {}", reason))]
    BadSecurityData { reason: String },

    #[snafu(display("The apply target does not support {}", feature))]
    UnsupportedFeature { feature: &'static str },

    #[snafu(display("Unsupported archive: {}", reason))]
    Unsupported { reason: String },

    #[snafu(display("An image named {:?} already exists", name))]
    ImageNameCollision { name: String },

    #[snafu(display("No image with index {}", index))]
    NoImage { index: u32 },

    #[snafu(display("{} is not a directory", path.display()))]
    NotADirectory { path: PathBuf },

    #[snafu(display(
        "Header claims {} images but the blob table holds {} metadata resources",
        header,
        found
    ))]
    ImageCountMismatch { header: u32, found: u32 },

    #[snafu(display("Refusing to allocate {} bytes", requested))]
    OutOfMemory { requested: u64 },

    #[snafu(display("The operation was cancelled"))]
    Cancelled,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum HeaderError {
    #[snafu(display("Magic mismatch: expected b\"MSWIM\\0\\0\\0\", got {:?}", magic))]
    BadMagic { magic: [u8; 8] },

    #[snafu(display("Invalid header size {} (must be {})", actual, repr::HEADER_SIZE))]
    BadHeaderSize { actual: u32 },

    #[snafu(display("Unsupported archive version {:#x}", actual))]
    BadVersion { actual: u32 },

    #[snafu(display("Invalid chunk size {} (must be {})", actual, repr::CHUNK_SIZE))]
    BadChunkSize { actual: u32 },

    #[snafu(display(
        "The compression flag is set but no known codec flag is ({:#x})",
        flags
    ))]
    UnknownCompression { flags: u32 },

    #[snafu(display("Resource entry has reserved offset bits set ({:#x})", offset))]
    ReservedOffsetBits { offset: u64 },

    #[snafu(display("Blob table size {} is not a multiple of {}", size, entry_size))]
    BadBlobTableSize { size: u64, entry_size: usize },

    #[snafu(display("Invalid integrity table: {}", reason))]
    BadIntegrityTable { reason: &'static str },

    #[snafu(display("Spanned archives are not supported (part {} of {})", part, total))]
    Spanned { part: u16, total: u16 },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum MetadataError {
    #[snafu(display("Dentry record at offset {} is truncated", offset))]
    TruncatedDentry { offset: u64 },

    #[snafu(display("Dentry record at offset {} declares length {}", offset, length))]
    BadRecordLength { offset: u64, length: u64 },

    #[snafu(display("Name at offset {} is not valid UTF-16", offset))]
    NameNotUtf16 { offset: u64 },

    #[snafu(display("Short name of {} UTF-16 units exceeds the 12-unit limit", units))]
    ShortNameTooLong { units: usize },

    #[snafu(display("Directory contains {:?} twice (names are case-insensitive)", name))]
    DuplicateName { name: String },

    #[snafu(display("Inode carries two unnamed data streams"))]
    DuplicateUnnamedStream,

    #[snafu(display("Subdirectory offset {} is out of bounds or loops", offset))]
    BadSubdirOffset { offset: u64 },

    #[snafu(display("Security id {} out of range (table has {} entries)", id, count))]
    SecurityIdOutOfRange { id: u32, count: u32 },

    #[snafu(display("Stream references blob {} which is not in the blob table", hash))]
    UnresolvedStream { hash: Sha1Hash },

    #[snafu(display("The root dentry is not a directory"))]
    RootNotDirectory,
}

impl From<HeaderError> for ErrorInner {
    fn from(e: HeaderError) -> Self {
        BadHeaderSnafu.into_error(e)
    }
}

impl From<HeaderError> for Error {
    fn from(e: HeaderError) -> Self {
        Self(e.into())
    }
}

impl From<MetadataError> for ErrorInner {
    fn from(e: MetadataError) -> Self {
        BadMetadataSnafu.into_error(e)
    }
}

impl From<MetadataError> for Error {
    fn from(e: MetadataError) -> Self {
        Self(e.into())
    }
}
