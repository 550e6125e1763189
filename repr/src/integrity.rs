use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// The chunk size the integrity table hashes over (distinct from the
/// 32 KiB resource chunk size).
pub const INTEGRITY_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

/// Header of the whole-file integrity table: 12 bytes, followed by one
/// SHA-1 per [`INTEGRITY_CHUNK_SIZE`] chunk of the file range from the end
/// of the header to the end of the blob table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IntegrityTableDisk {
    /// Size in bytes of the whole table, this header included
    pub table_size: le::U32,
    /// Number of checksum entries
    pub num_entries: le::U32,
    /// Bytes of file data covered by each checksum
    pub chunk_size: le::U32,
}

impl IntegrityTableDisk {
    pub const SIZE: usize = 12;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_12_bytes() {
        assert_eq!(core::mem::size_of::<IntegrityTableDisk>(), IntegrityTableDisk::SIZE);
    }
}
