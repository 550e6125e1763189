//! On-disk directory entries.
//!
//! An image's metadata resource stores its directory tree as a sequence of
//! dentry records in depth-first preorder. Each record has a 102-byte fixed
//! part followed by the long name and optional short name (each UTF-16LE
//! with a 2-byte null terminator), padded to an 8-byte boundary, then any
//! alternate-data-stream records. A directory's child list ends with an
//! 8-byte zero length field.

use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{align8, HASH_SIZE};

/// A "none" security id (-1 as a little-endian u32).
pub const SECURITY_ID_NONE: u32 = 0xffff_ffff;

/// The fixed part of a dentry record: 102 bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DentryDisk {
    /// Length in bytes of the whole record, names included, before padding
    pub length: le::U64,
    /// See [`FileAttributes`](../struct.FileAttributes.html)
    pub attributes: le::U32,
    /// Index into the image's security table, [`SECURITY_ID_NONE`] for none
    pub security_id: le::U32,
    /// Offset, within the uncompressed metadata resource, of this
    /// directory's first child record; 0 for nondirectories
    pub subdir_offset: le::U64,
    pub unused_1: le::U64,
    pub unused_2: le::U64,
    /// Creation time as a Windows FILETIME
    pub creation_time: le::U64,
    /// Last access time as a Windows FILETIME
    pub last_access_time: le::U64,
    /// Last write time as a Windows FILETIME
    pub last_write_time: le::U64,
    /// SHA-1 of the unnamed data stream, all zeros when empty
    pub default_hash: [u8; HASH_SIZE],
    /// Reparse data for reparse points, hard-link group id otherwise;
    /// see [`tagged_reparse`](#method.tagged_reparse) /
    /// [`tagged_link_group`](#method.tagged_link_group)
    pub tagged: [u8; 12],
    /// Number of alternate-data-stream records following this record
    pub num_streams: le::U16,
    /// Length in bytes of the short name, 0 for none (terminator excluded)
    pub short_name_nbytes: le::U16,
    /// Length in bytes of the long name (terminator excluded)
    pub file_name_nbytes: le::U16,
}

impl DentryDisk {
    pub const SIZE: usize = 102;

    /// The reparse tag and the `not_rpfixed` flag, valid when the
    /// attributes carry `REPARSE_POINT`.
    pub fn tagged_reparse(&self) -> (u32, bool) {
        let tag = u32::from_le_bytes(self.tagged[4..8].try_into().unwrap());
        let not_rpfixed = u16::from_le_bytes(self.tagged[10..12].try_into().unwrap());
        (tag, not_rpfixed != 0)
    }

    pub fn set_tagged_reparse(&mut self, tag: u32, not_rpfixed: bool) {
        self.tagged = [0; 12];
        self.tagged[4..8].copy_from_slice(&tag.to_le_bytes());
        self.tagged[10..12].copy_from_slice(&u16::from(not_rpfixed).to_le_bytes());
    }

    /// The hard-link group id, valid when the attributes do not carry
    /// `REPARSE_POINT`. Zero means the dentry is not hard-linked.
    pub fn tagged_link_group(&self) -> u64 {
        u64::from_le_bytes(self.tagged[4..12].try_into().unwrap())
    }

    pub fn set_tagged_link_group(&mut self, group: u64) {
        self.tagged = [0; 12];
        self.tagged[4..12].copy_from_slice(&group.to_le_bytes());
    }

    /// The padded on-disk size of a record with the given name lengths,
    /// ADS records excluded.
    pub fn record_size(file_name_nbytes: u16, short_name_nbytes: u16) -> u64 {
        let mut size = Self::SIZE as u64 + u64::from(file_name_nbytes) + 2;
        if short_name_nbytes != 0 {
            size += u64::from(short_name_nbytes) + 2;
        }
        align8(size)
    }
}

/// The fixed part of an alternate-data-stream record: 38 bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AdsEntryDisk {
    /// Length in bytes of this record, name included, before padding
    pub length: le::U64,
    pub reserved: le::U64,
    /// SHA-1 of the stream contents, all zeros when empty
    pub hash: [u8; HASH_SIZE],
    /// Length in bytes of the stream name (terminator excluded); 0 names
    /// the unnamed stream (seen in adversarial captures)
    pub stream_name_nbytes: le::U16,
}

impl AdsEntryDisk {
    pub const SIZE: usize = 38;

    /// The padded on-disk size of a record with the given name length.
    pub fn record_size(stream_name_nbytes: u16) -> u64 {
        let mut size = Self::SIZE as u64;
        if stream_name_nbytes != 0 {
            size += u64::from(stream_name_nbytes) + 2;
        }
        align8(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sizes() {
        assert_eq!(core::mem::size_of::<DentryDisk>(), DentryDisk::SIZE);
        assert_eq!(core::mem::size_of::<AdsEntryDisk>(), AdsEntryDisk::SIZE);
    }

    #[test]
    fn tagged_union_round_trips() {
        let mut d = DentryDisk::read_from_bytes(&[0u8; DentryDisk::SIZE]).unwrap();
        d.set_tagged_link_group(0xdead_beef_0042);
        assert_eq!(d.tagged_link_group(), 0xdead_beef_0042);

        d.set_tagged_reparse(crate::IO_REPARSE_TAG_SYMLINK, true);
        assert_eq!(d.tagged_reparse(), (crate::IO_REPARSE_TAG_SYMLINK, true));
    }

    #[test]
    fn record_sizes_are_padded() {
        // "a" long name, no short name: 102 + 2 + 2 = 106 -> 112.
        assert_eq!(DentryDisk::record_size(2, 0), 112);
        // 4-unit long name + 3-unit short name: 102 + 8 + 2 + 6 + 2 = 120.
        assert_eq!(DentryDisk::record_size(8, 6), 120);
        assert_eq!(AdsEntryDisk::record_size(0), 40);
        assert_eq!(AdsEntryDisk::record_size(8), 48);
    }
}
