//! A WIM archive consists of the following regions, packed together with no
//! required alignment between them:
//!
//! * [Header](header/index.html)
//! * Resources (blob data and per-image metadata, optionally compressed in
//!   32 KiB chunks)
//! * [Blob (lookup) table](resource/index.html)
//! * XML data (UTF-16LE, opaque to this crate)
//! * [Integrity table](integrity/index.html) (optional)
//!
//! All multibyte integers are little-endian.

use bitflags::bitflags;

pub mod dentry;
pub mod header;
pub mod integrity;
pub mod resource;
pub mod security;

/// The magic constant which marks a WIM archive: `MSWIM\0\0\0`.
pub const MAGIC: [u8; 8] = *b"MSWIM\0\0\0";

/// The size in bytes of the on-disk header.
pub const HEADER_SIZE: u32 = 208;

/// The supported archive format version.
pub const VERSION: u32 = 0x10d00;

/// The size of one uncompressed chunk of a compressed resource.
///
/// Every compressed resource is cut into chunks of this many uncompressed
/// bytes, each compressed independently, so readers get random access at
/// this granularity. The header records the same value.
pub const CHUNK_SIZE: u32 = 32768;

/// The size in bytes of a SHA-1 message digest, the key of the blob table.
pub const HASH_SIZE: usize = 20;

/// The maximum length of a short (DOS 8.3) name, in UTF-16 code units.
pub const SHORT_NAME_MAX_UNITS: usize = 12;

/// The maximum size of a reparse-point data buffer, tag included.
pub const REPARSE_POINT_MAX_SIZE: usize = 16 * 1024;

/// Reparse tag for an NTFS junction (mount point).
pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
/// Reparse tag for a symbolic link.
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// Round `x` up to the next multiple of 8.
///
/// Dentry records, ADS records and the security data prelude are all padded
/// to 8-byte boundaries within a metadata resource.
pub const fn align8(x: u64) -> u64 {
    (x + 7) & !7
}

bitflags! {
    /// Archive-wide flags stored in the header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u32 {
        /// Reserved; observed set in some archives, ignored
        const RESERVED          = 0x0000_0001;
        /// Resources are compressed; one of the `COMPRESS_*` flags names the codec
        const COMPRESSION       = 0x0000_0002;
        /// One part of a spanned set
        const SPANNED           = 0x0000_0008;
        /// Blob data only, no metadata resources
        const RESOURCE_ONLY     = 0x0000_0010;
        /// Metadata resources only, blob data lives in other parts
        const METADATA_ONLY     = 0x0000_0020;
        /// Set while an append is in progress, cleared on clean finish
        const WRITE_IN_PROGRESS = 0x0000_0040;
        /// Reparse-point targets were adjusted at capture time
        const RP_FIX            = 0x0000_0080;
        /// Readonly archive; writers must refuse to modify it
        const READONLY          = 0x0000_0200;
        const COMPRESS_RESERVED = 0x0001_0000;
        /// Compressed resources use the XPRESS codec
        const COMPRESS_XPRESS   = 0x0002_0000;
        /// Compressed resources use the LZX codec
        const COMPRESS_LZX      = 0x0004_0000;
    }
}

bitflags! {
    /// Windows file attributes, as stored in a dentry record.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        const READONLY            = 0x0000_0001;
        const HIDDEN              = 0x0000_0002;
        const SYSTEM              = 0x0000_0004;
        const DIRECTORY           = 0x0000_0010;
        const ARCHIVE             = 0x0000_0020;
        const DEVICE              = 0x0000_0040;
        const NORMAL              = 0x0000_0080;
        const TEMPORARY           = 0x0000_0100;
        const SPARSE_FILE         = 0x0000_0200;
        const REPARSE_POINT       = 0x0000_0400;
        const COMPRESSED          = 0x0000_0800;
        const OFFLINE             = 0x0000_1000;
        const NOT_CONTENT_INDEXED = 0x0000_2000;
        const ENCRYPTED           = 0x0000_4000;
    }
}

impl FileAttributes {
    pub fn is_directory(self) -> bool {
        self.contains(FileAttributes::DIRECTORY)
    }

    pub fn is_reparse_point(self) -> bool {
        self.contains(FileAttributes::REPARSE_POINT)
    }
}
