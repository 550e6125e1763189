use bitflags::bitflags;
use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::HASH_SIZE;

/// Mask of the two reserved high bits of a resource entry's offset and
/// original size. Readers must clear these before use.
pub const RESERVED_BITS: u64 = 0xc000_0000_0000_0000;

bitflags! {
    /// Flags stored in the eighth byte of a resource entry.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ResourceFlags: u8 {
        /// The entry describes freed space, not live data
        const FREE       = 0x01;
        /// The resource is an image's metadata resource
        const METADATA   = 0x02;
        /// The resource is chunked and compressed with the archive codec
        const COMPRESSED = 0x04;
        /// The resource continues in another part of a spanned set
        const SPANNED    = 0x08;
    }
}

/// A resource entry as stored on disk: 24 bytes.
///
/// The stored (on-disk) size shares its first 8 bytes with the flags byte:
/// 7 bytes of size, then 1 byte of [`ResourceFlags`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ResourceEntryDisk {
    size_and_flags: [u8; 8],
    offset: le::U64,
    original_size: le::U64,
}

impl ResourceEntryDisk {
    pub const SIZE: usize = 24;

    pub fn new(size: u64, flags: ResourceFlags, offset: u64, original_size: u64) -> Self {
        let mut size_and_flags = size.to_le_bytes();
        debug_assert_eq!(size_and_flags[7], 0, "stored size exceeds 56 bits");
        size_and_flags[7] = flags.bits();
        Self {
            size_and_flags,
            offset: le::U64::new(offset),
            original_size: le::U64::new(original_size),
        }
    }

    pub fn zeroed() -> Self {
        Self::new(0, ResourceFlags::empty(), 0, 0)
    }

    /// The stored size of the resource in the archive file (56-bit).
    pub fn size(&self) -> u64 {
        let mut bytes = self.size_and_flags;
        bytes[7] = 0;
        u64::from_le_bytes(bytes)
    }

    pub fn flags(&self) -> ResourceFlags {
        ResourceFlags::from_bits_retain(self.size_and_flags[7])
    }

    /// The offset of the resource, reserved bits included.
    pub fn offset_raw(&self) -> u64 {
        self.offset.get()
    }

    /// The uncompressed size of the resource, reserved bits included.
    pub fn original_size_raw(&self) -> u64 {
        self.original_size.get()
    }

    /// True for the all-zero entry used to mean "no resource".
    pub fn is_absent(&self) -> bool {
        self.size_and_flags == [0; 8] && self.offset.get() == 0 && self.original_size.get() == 0
    }
}

/// A blob (lookup) table entry as stored on disk: 50 bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BlobTableEntryDisk {
    pub resource: ResourceEntryDisk,
    pub part_number: le::U16,
    pub refcnt: le::U32,
    pub hash: [u8; HASH_SIZE],
}

impl BlobTableEntryDisk {
    pub const SIZE: usize = 50;
}
