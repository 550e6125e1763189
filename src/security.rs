//! Per-image security descriptor tables, plus the descriptor fixup applied
//! before descriptors are handed to an apply target.

use std::borrow::Cow;
use std::collections::HashMap;
use zerocopy::{FromBytes, IntoBytes};

use repr::align8;
use repr::security::SecurityDataDisk;

use crate::errors::{BadSecurityDataSnafu, Result};
use crate::hash::Sha1Hash;

/// Offsets into a self-relative SECURITY_DESCRIPTOR header.
const SD_HEADER_SIZE: usize = 20;
const SD_CONTROL: usize = 2;
const SD_OWNER_OFFSET: usize = 4;
const SD_GROUP_OFFSET: usize = 8;
const SD_SACL_OFFSET: usize = 12;
const SD_DACL_OFFSET: usize = 16;

const SE_DACL_PRESENT: u16 = 0x0004;
const SE_SACL_PRESENT: u16 = 0x0010;

/// Size of an ACL header, which is also the size of an empty ACL.
const ACL_SIZE: usize = 8;
/// Size of a SID with no sub-authorities.
const SID_MIN_SIZE: usize = 8;

/// An image's ordered array of binary security descriptors. Inodes refer
/// to entries by index; duplicate descriptors share one entry.
#[derive(Debug, Clone, Default)]
pub struct SecurityData {
    descriptors: Vec<Vec<u8>>,
    by_hash: HashMap<Sha1Hash, u32>,
}

impl SecurityData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.descriptors.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&[u8]> {
        self.descriptors.get(id as usize).map(Vec::as_slice)
    }

    /// Add a descriptor, returning its index; identical descriptors are
    /// stored once and share an index.
    pub fn intern(&mut self, descriptor: &[u8]) -> u32 {
        let hash = Sha1Hash::of(descriptor);
        if let Some(&id) = self.by_hash.get(&hash) {
            return id;
        }
        let id = self.descriptors.len() as u32;
        self.descriptors.push(descriptor.to_vec());
        self.by_hash.insert(hash, id);
        id
    }

    /// Parse the security data prelude of a metadata resource. Returns the
    /// table and the number of bytes consumed (8-aligned).
    pub(crate) fn parse(buf: &[u8]) -> Result<(SecurityData, usize)> {
        let (header, _) = SecurityDataDisk::read_from_prefix(buf).map_err(|_| {
            BadSecurityDataSnafu {
                reason: "security data header truncated".to_string(),
            }
            .build()
        })?;

        let total_length = header.total_length.get() as usize;
        let num_entries = header.num_entries.get() as usize;
        let consumed = align8(total_length.max(SecurityDataDisk::SIZE) as u64) as usize;
        if consumed > buf.len() {
            return fail("security data extends past the metadata resource");
        }

        let sizes_end = SecurityDataDisk::SIZE + num_entries * 8;
        if sizes_end > total_length.max(SecurityDataDisk::SIZE) {
            return fail("security descriptor size array extends past the declared length");
        }

        let mut table = SecurityData::new();
        let mut pos = sizes_end;
        for i in 0..num_entries {
            let at = SecurityDataDisk::SIZE + i * 8;
            let size = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()) as usize;
            if size > total_length || pos + size > total_length {
                return fail("security descriptor extends past the declared length");
            }
            // Deliberately not interned through `intern`: on-disk tables
            // may hold duplicates and indices must be preserved.
            let descriptor = buf[pos..pos + size].to_vec();
            let hash = Sha1Hash::of(&descriptor);
            table.by_hash.entry(hash).or_insert(i as u32);
            table.descriptors.push(descriptor);
            pos += size;
        }
        Ok((table, consumed))
    }

    /// Append the on-disk form: header, u64 sizes, descriptors, padding.
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        let total: usize = SecurityDataDisk::SIZE
            + self.descriptors.len() * 8
            + self.descriptors.iter().map(Vec::len).sum::<usize>();
        let header = SecurityDataDisk {
            total_length: (total as u32).into(),
            num_entries: (self.descriptors.len() as u32).into(),
        };
        out.extend_from_slice(header.as_bytes());
        for descriptor in &self.descriptors {
            out.extend_from_slice(&(descriptor.len() as u64).to_le_bytes());
        }
        for descriptor in &self.descriptors {
            out.extend_from_slice(descriptor);
        }
        let padded = align8(total as u64) as usize;
        out.resize(out.len() + (padded - total), 0);
    }
}

fn fail<T>(reason: &str) -> Result<T> {
    BadSecurityDataSnafu {
        reason: reason.to_string(),
    }
    .fail()
    .map_err(Into::into)
}

fn read_u32(desc: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(desc[at..at + 4].try_into().unwrap())
}

fn sid_len(desc: &[u8], offset: usize) -> usize {
    SID_MIN_SIZE + 4 * desc[offset + 1] as usize
}

fn sid_is_relocatable(desc: &[u8], offset: usize) -> bool {
    offset != 0
        && offset % 4 == 0
        && offset >= SD_HEADER_SIZE
        && offset <= desc.len().saturating_sub(SID_MIN_SIZE)
        && offset + sid_len(desc, offset) <= desc.len()
}

/// Rewrite a security descriptor whose final component is an empty DACL or
/// SACL by relocating the owner (or group) SID to the tail.
///
/// Some host ACL validators reject descriptors ending in an empty access
/// control list; moving a SID behind the list sidesteps that without
/// changing the descriptor's meaning. If neither SID is relocatable, the
/// descriptor is returned unchanged.
pub(crate) fn sd_fixup(desc: &[u8]) -> Cow<'_, [u8]> {
    if desc.len() < SD_HEADER_SIZE {
        return Cow::Borrowed(desc);
    }

    let control = u16::from_le_bytes(desc[SD_CONTROL..SD_CONTROL + 2].try_into().unwrap());
    let dacl_offset = if control & SE_DACL_PRESENT != 0 {
        read_u32(desc, SD_DACL_OFFSET) as usize
    } else {
        0
    };
    let sacl_offset = if control & SE_SACL_PRESENT != 0 {
        read_u32(desc, SD_SACL_OFFSET) as usize
    } else {
        0
    };

    let empty_acl_at_tail = |offset: usize| offset != 0 && offset == desc.len() - ACL_SIZE;
    if !empty_acl_at_tail(dacl_offset) && !empty_acl_at_tail(sacl_offset) {
        return Cow::Borrowed(desc);
    }

    let owner_offset = read_u32(desc, SD_OWNER_OFFSET) as usize;
    let group_offset = read_u32(desc, SD_GROUP_OFFSET) as usize;

    let (field, sid_offset) = if sid_is_relocatable(desc, owner_offset) {
        (SD_OWNER_OFFSET, owner_offset)
    } else if sid_is_relocatable(desc, group_offset) {
        (SD_GROUP_OFFSET, group_offset)
    } else {
        return Cow::Borrowed(desc);
    };

    let sid_len = sid_len(desc, sid_offset);
    let mut fixed = Vec::with_capacity(desc.len() + sid_len);
    fixed.extend_from_slice(desc);
    fixed[field..field + 4].copy_from_slice(&(desc.len() as u32).to_le_bytes());
    fixed.extend_from_slice(&desc[sid_offset..sid_offset + sid_len]);
    Cow::Owned(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal descriptor: header, one-subauthority owner SID, group
    /// SID, then an empty DACL at the tail.
    fn descriptor_with_trailing_empty_dacl() -> Vec<u8> {
        let mut desc = vec![0u8; SD_HEADER_SIZE];
        desc[0] = 1; // revision
        desc[SD_CONTROL..SD_CONTROL + 2].copy_from_slice(&SE_DACL_PRESENT.to_le_bytes());

        // Owner SID at 20 (12 bytes: 1 sub-authority).
        let owner = 20u32;
        desc.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 5, 18, 0, 0, 0]);
        // Empty DACL (8 bytes) at 32 == len - 8.
        let dacl = 32u32;
        desc.extend_from_slice(&[2, 0, 8, 0, 0, 0, 0, 0]);

        desc[SD_OWNER_OFFSET..SD_OWNER_OFFSET + 4].copy_from_slice(&owner.to_le_bytes());
        desc[SD_DACL_OFFSET..SD_DACL_OFFSET + 4].copy_from_slice(&dacl.to_le_bytes());
        desc
    }

    #[test]
    fn fixup_relocates_owner_sid() {
        let desc = descriptor_with_trailing_empty_dacl();
        let fixed = sd_fixup(&desc);
        let fixed = fixed.as_ref();

        assert_eq!(fixed.len(), desc.len() + 12);
        // Owner offset now points at the tail copy.
        assert_eq!(read_u32(fixed, SD_OWNER_OFFSET) as usize, desc.len());
        assert_eq!(&fixed[desc.len()..], &desc[20..32]);
        // The original DACL bytes are untouched.
        assert_eq!(&fixed[32..40], &desc[32..40]);
    }

    #[test]
    fn fixup_leaves_benign_descriptors_alone() {
        // DACL not at the tail: nothing to do.
        let mut desc = descriptor_with_trailing_empty_dacl();
        desc.extend_from_slice(&[0u8; 8]);
        assert!(matches!(sd_fixup(&desc), Cow::Borrowed(_)));

        // Too short to even parse.
        assert!(matches!(sd_fixup(&[1, 2, 3]), Cow::Borrowed(_)));
    }

    #[test]
    fn fixup_gives_up_without_a_relocatable_sid() {
        let mut desc = descriptor_with_trailing_empty_dacl();
        // Break both SID offsets.
        desc[SD_OWNER_OFFSET..SD_OWNER_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        desc[SD_GROUP_OFFSET..SD_GROUP_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(sd_fixup(&desc), Cow::Borrowed(_)));
    }

    #[test]
    fn intern_dedupes() {
        let mut table = SecurityData::new();
        let a = table.intern(b"descriptor one");
        let b = table.intern(b"descriptor two");
        let a2 = table.intern(b"descriptor one");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn on_disk_round_trip() {
        let mut table = SecurityData::new();
        table.intern(b"first descriptor");
        table.intern(b"2nd");

        let mut buf = Vec::new();
        table.write_to(&mut buf);
        assert_eq!(buf.len() % 8, 0);

        let (parsed, consumed) = SecurityData::parse(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(0).unwrap(), b"first descriptor");
        assert_eq!(parsed.get(1).unwrap(), b"2nd");
    }

    #[test]
    fn empty_table_round_trip() {
        let table = SecurityData::new();
        let mut buf = Vec::new();
        table.write_to(&mut buf);
        let (parsed, consumed) = SecurityData::parse(&buf).unwrap();
        assert_eq!(consumed, 8);
        assert!(parsed.is_empty());
    }

    #[test]
    fn truncated_data_is_rejected() {
        assert!(SecurityData::parse(&[0u8; 4]).is_err());

        // Claims one entry of absurd size.
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&1_000_000u64.to_le_bytes());
        buf.resize(104, 0);
        assert!(SecurityData::parse(&buf).is_err());
    }
}
