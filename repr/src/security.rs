use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// The prelude of an image's security data, at offset 0 of the metadata
/// resource: total length, descriptor count, then `num_entries` u64 sizes
/// and the concatenated descriptors, padded to 8 bytes overall.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SecurityDataDisk {
    /// Size in bytes of the security data, this header and padding included
    pub total_length: le::U32,
    /// Number of security descriptors
    pub num_entries: le::U32,
}

impl SecurityDataDisk {
    pub const SIZE: usize = 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_8_bytes() {
        assert_eq!(core::mem::size_of::<SecurityDataDisk>(), SecurityDataDisk::SIZE);
    }
}
