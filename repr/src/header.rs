use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::resource::ResourceEntryDisk;

/// The archive header: 208 bytes at offset 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HeaderDisk {
    /// Must equal [`MAGIC`](../constant.MAGIC.html) (`MSWIM\0\0\0`)
    pub magic: [u8; 8],
    /// The size of this header. Must equal
    /// [`HEADER_SIZE`](../constant.HEADER_SIZE.html) (208)
    pub header_size: le::U32,
    /// The format version. Must equal [`VERSION`](../constant.VERSION.html)
    pub version: le::U32,
    /// See [`HeaderFlags`](../struct.HeaderFlags.html)
    pub flags: le::U32,
    /// The uncompressed chunk size of compressed resources. Must equal
    /// [`CHUNK_SIZE`](../constant.CHUNK_SIZE.html) (32768)
    pub chunk_size: le::U32,
    /// Identifies the archive across renames and spanned sets
    pub guid: [u8; 16],
    /// 1-based part number within a spanned set (1 for a standalone archive)
    pub part_number: le::U16,
    /// Total parts in the spanned set (1 for a standalone archive)
    pub total_parts: le::U16,
    /// The number of images in the archive
    pub image_count: le::U32,
    /// Where the blob (lookup) table lives
    pub blob_table: ResourceEntryDisk,
    /// Where the XML data lives (all zeros if absent)
    pub xml_data: ResourceEntryDisk,
    /// Where the boot image's metadata resource lives (all zeros if none)
    pub boot_metadata: ResourceEntryDisk,
    /// 1-based index of the bootable image, 0 for none
    pub boot_index: le::U32,
    /// Where the integrity table lives (all zeros if absent)
    pub integrity: ResourceEntryDisk,
    pub unused: [u8; 60],
}

impl HeaderDisk {
    pub const SIZE: usize = crate::HEADER_SIZE as usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_208_bytes() {
        assert_eq!(core::mem::size_of::<HeaderDisk>(), HeaderDisk::SIZE);
    }
}
