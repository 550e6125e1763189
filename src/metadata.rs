//! The image metadata codec: security data prelude followed by the dentry
//! tree in depth-first preorder.
//!
//! Each directory's children sit in one contiguous block referenced by the
//! parent's subdir offset and closed by an 8-byte zero terminator. Hard
//! links travel as a shared nonzero group id; the id is only an identity
//! carrier, resolved to shared inodes during parse and discarded.

use slog::Logger;
use std::collections::{HashMap, HashSet};
use zerocopy::{FromBytes, IntoBytes};

use repr::dentry::{AdsEntryDisk, DentryDisk, SECURITY_ID_NONE};
use repr::{align8, FileAttributes, SHORT_NAME_MAX_UNITS};

use crate::errors::{MetadataError, Result};
use crate::hash::Sha1Hash;
use crate::security::SecurityData;
use crate::tree::{Dentry, DentryId, Image, Inode, InodeId, ReparseInfo, Stream};

/// What to do with an inode that shows up carrying two unnamed data
/// streams (seen in adversarial NTFS captures).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DuplicateStreamPolicy {
    /// Keep the first stream, drop the rest with a warning.
    #[default]
    Warn,
    /// Treat the metadata as invalid.
    Error,
}

/// Refuse trees nested deeper than this; real images stay far below it and
/// unbounded recursion is a stack-overflow vector.
const MAX_TREE_DEPTH: usize = 4096;

pub(crate) fn parse(
    buf: &[u8],
    policy: DuplicateStreamPolicy,
    logger: &Logger,
) -> Result<Image> {
    let (security, consumed) = SecurityData::parse(buf)?;

    let mut parser = Parser {
        buf,
        image: Image::new(),
        link_groups: HashMap::new(),
        visited_blocks: HashSet::new(),
        policy,
        logger,
    };
    parser.image.security = security;

    let root = parser
        .read_record(consumed as u64)?
        .ok_or_else(|| MetadataError::TruncatedDentry {
            offset: consumed as u64,
        })?;
    let attributes = FileAttributes::from_bits_retain(root.disk.attributes.get());
    if !attributes.is_directory() {
        return Err(MetadataError::RootNotDirectory.into());
    }

    let root_id = parser.image.root();
    let root_inode = parser.image.dentry(root_id).inode;
    parser.fill_inode(root_inode, &root, attributes)?;
    let subdir = root.disk.subdir_offset.get();
    parser.read_children(subdir, root_id, 1)?;

    Ok(parser.image)
}

struct RawRecord {
    disk: DentryDisk,
    name: String,
    short_name: Option<String>,
    /// (stream name or None for unnamed, hash or None for empty)
    ads: Vec<(Option<String>, Option<Sha1Hash>)>,
    /// Offset of the record after this one and its stream records.
    next: u64,
}

struct Parser<'a> {
    buf: &'a [u8],
    image: Image,
    link_groups: HashMap<u64, InodeId>,
    visited_blocks: HashSet<u64>,
    policy: DuplicateStreamPolicy,
    logger: &'a Logger,
}

impl Parser<'_> {
    /// Read the record at `offset`; `None` for the 8-byte zero terminator.
    fn read_record(&self, offset: u64) -> Result<Option<RawRecord>> {
        let start = offset as usize;
        let truncated = || MetadataError::TruncatedDentry { offset };
        if start + 8 > self.buf.len() {
            return Err(truncated().into());
        }
        let length = u64::from_le_bytes(self.buf[start..start + 8].try_into().unwrap());
        if length == 0 {
            return Ok(None);
        }
        let bad_length = MetadataError::BadRecordLength { offset, length };
        if length < DentryDisk::SIZE as u64 || start as u64 + length > self.buf.len() as u64 {
            return Err(bad_length.into());
        }
        let record = &self.buf[start..start + length as usize];
        let (disk, _) = DentryDisk::read_from_prefix(record).expect("length checked");

        let file_name_nbytes = disk.file_name_nbytes.get() as usize;
        let short_name_nbytes = disk.short_name_nbytes.get() as usize;
        let mut need = DentryDisk::SIZE + file_name_nbytes + 2;
        if short_name_nbytes != 0 {
            need += short_name_nbytes + 2;
        }
        if need as u64 > length {
            return Err(bad_length.into());
        }

        let names_at = DentryDisk::SIZE;
        let name = utf16_to_string(&record[names_at..names_at + file_name_nbytes], offset)?;
        let short_name = if short_name_nbytes != 0 {
            let at = names_at + file_name_nbytes + 2;
            let short = utf16_to_string(&record[at..at + short_name_nbytes], offset)?;
            if short_name_nbytes / 2 > SHORT_NAME_MAX_UNITS {
                return Err(MetadataError::ShortNameTooLong {
                    units: short_name_nbytes / 2,
                }
                .into());
            }
            Some(short)
        } else {
            None
        };

        // Alternate-data-stream records follow, 8-aligned.
        let mut ads = Vec::with_capacity(disk.num_streams.get() as usize);
        let mut at = align8(offset + length);
        for _ in 0..disk.num_streams.get() {
            let start = at as usize;
            if start + AdsEntryDisk::SIZE > self.buf.len() {
                return Err(MetadataError::TruncatedDentry { offset: at }.into());
            }
            let (entry, _) =
                AdsEntryDisk::read_from_prefix(&self.buf[start..]).expect("length checked");
            let entry_len = entry.length.get();
            let name_nbytes = entry.stream_name_nbytes.get() as usize;
            let mut need = AdsEntryDisk::SIZE as u64;
            if name_nbytes != 0 {
                need += name_nbytes as u64 + 2;
            }
            if entry_len < need || at + entry_len > self.buf.len() as u64 {
                return Err(MetadataError::BadRecordLength {
                    offset: at,
                    length: entry_len,
                }
                .into());
            }
            let stream_name = if name_nbytes != 0 {
                let name_at = start + AdsEntryDisk::SIZE;
                Some(utf16_to_string(
                    &self.buf[name_at..name_at + name_nbytes],
                    at,
                )?)
            } else {
                None
            };
            let hash = Sha1Hash(entry.hash);
            ads.push((stream_name, (!hash.is_zero()).then_some(hash)));
            at = align8(at + entry_len);
        }

        Ok(Some(RawRecord {
            disk,
            name,
            short_name,
            ads,
            next: at,
        }))
    }

    fn read_children(&mut self, subdir_offset: u64, parent: DentryId, depth: usize) -> Result<()> {
        // A zero subdir offset is an empty directory with no child list.
        if subdir_offset == 0 {
            return Ok(());
        }
        if depth > MAX_TREE_DEPTH || !self.visited_blocks.insert(subdir_offset) {
            return Err(MetadataError::BadSubdirOffset {
                offset: subdir_offset,
            }
            .into());
        }

        let mut at = subdir_offset;
        while let Some(record) = self.read_record(at)? {
            at = record.next;
            self.add_record(record, parent, depth)?;
        }
        Ok(())
    }

    fn add_record(&mut self, record: RawRecord, parent: DentryId, depth: usize) -> Result<()> {
        let attributes = FileAttributes::from_bits_retain(record.disk.attributes.get());
        let is_directory = attributes.is_directory();

        let link_group = if attributes.is_reparse_point() || is_directory {
            0
        } else {
            record.disk.tagged_link_group()
        };

        let (inode_id, fresh) = match self.link_groups.get(&link_group) {
            Some(&existing) if link_group != 0 => {
                self.check_link_group(existing, &record, attributes);
                (existing, false)
            }
            _ => {
                let id = self.image.add_inode(Inode::new(attributes));
                if link_group != 0 {
                    self.link_groups.insert(link_group, id);
                }
                (id, true)
            }
        };
        if fresh {
            self.fill_inode(inode_id, &record, attributes)?;
        }

        let dentry = self
            .image
            .add_child(parent, record.name, record.short_name, inode_id)?;
        if is_directory {
            self.read_children(record.disk.subdir_offset.get(), dentry, depth + 1)?;
        }
        Ok(())
    }

    /// Populate a freshly created inode from its first on-disk record.
    fn fill_inode(
        &mut self,
        inode_id: InodeId,
        record: &RawRecord,
        attributes: FileAttributes,
    ) -> Result<()> {
        let disk = &record.disk;

        let security_id = match disk.security_id.get() {
            SECURITY_ID_NONE => None,
            id => {
                if id >= self.image.security.len() {
                    return Err(MetadataError::SecurityIdOutOfRange {
                        id,
                        count: self.image.security.len(),
                    }
                    .into());
                }
                Some(id)
            }
        };

        let mut streams = Vec::new();
        if !attributes.is_directory() {
            let hash = Sha1Hash(disk.default_hash);
            streams.push(Stream {
                name: None,
                hash: (!hash.is_zero()).then_some(hash),
            });
        }
        for (name, hash) in &record.ads {
            if name.is_none() && streams.iter().any(Stream::is_unnamed) {
                match self.policy {
                    DuplicateStreamPolicy::Error => {
                        return Err(MetadataError::DuplicateUnnamedStream.into());
                    }
                    DuplicateStreamPolicy::Warn => {
                        slog::warn!(self.logger, "Dropping duplicate unnamed stream");
                        continue;
                    }
                }
            }
            streams.push(Stream {
                name: name.clone(),
                hash: *hash,
            });
        }

        let inode = self.image.inode_mut(inode_id);
        inode.attributes = attributes;
        inode.security_id = security_id;
        inode.creation_time = disk.creation_time.get();
        inode.last_access_time = disk.last_access_time.get();
        inode.last_write_time = disk.last_write_time.get();
        inode.streams = streams;
        if attributes.is_reparse_point() {
            let (tag, not_rpfixed) = disk.tagged_reparse();
            inode.reparse = Some(ReparseInfo { tag, not_rpfixed });
        }
        Ok(())
    }

    /// All aliases in a hard-link group must agree; the first record wins
    /// and later divergence is only warned about.
    fn check_link_group(&self, existing: InodeId, record: &RawRecord, attributes: FileAttributes) {
        let inode = self.image.inode(existing);
        let unnamed = inode.unnamed_stream().and_then(|s| s.hash);
        let record_hash = Sha1Hash(record.disk.default_hash);
        let record_unnamed = (!record_hash.is_zero()).then_some(record_hash);

        if inode.attributes != attributes
            || inode.last_write_time != record.disk.last_write_time.get()
            || unnamed != record_unnamed
        {
            slog::warn!(self.logger, "Hard link group disagrees; keeping first occurrence";
                "group" => record.disk.tagged_link_group());
        }
    }
}

fn utf16_to_string(bytes: &[u8], offset: u64) -> Result<String> {
    let bad = || MetadataError::NameNotUtf16 { offset };
    if bytes.len() % 2 != 0 {
        return Err(bad().into());
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes(pair.try_into().unwrap()))
        .collect();
    String::from_utf16(&units).map_err(|_| bad().into())
}

fn utf16_nbytes(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

fn push_utf16(out: &mut Vec<u8>, s: &str) {
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
}

/// Serialize an image's metadata resource contents.
pub(crate) fn write(image: &Image) -> Vec<u8> {
    let mut out = Vec::new();
    image.security.write_to(&mut out);

    // Hard-link group ids: one per multiply-linked nondirectory inode.
    let mut groups: HashMap<InodeId, u64> = HashMap::new();
    for (index, inode) in image.inodes.iter().enumerate() {
        if inode.link_count() > 1 && !inode.is_directory() {
            groups.insert(InodeId(index), index as u64 + 1);
        }
    }

    // First pass: place every record.
    let root = image.root();
    let base = out.len() as u64;
    let mut subdirs: HashMap<DentryId, u64> = HashMap::new();
    let mut cursor = base + record_total(image, root);
    place_children(image, root, &mut cursor, &mut subdirs);

    // Second pass: emit in the same order and backfill nothing.
    emit_record(image, root, &subdirs, &groups, &mut out);
    debug_assert_eq!(out.len() as u64, base + record_total(image, root));
    emit_children(image, root, &subdirs, &groups, &mut out);
    debug_assert_eq!(out.len() as u64, cursor);

    out
}

/// Assign offsets: each directory's children form one contiguous block
/// (terminator included), directories descending in preorder.
fn place_children(
    image: &Image,
    dir: DentryId,
    cursor: &mut u64,
    subdirs: &mut HashMap<DentryId, u64>,
) {
    subdirs.insert(dir, *cursor);
    for &child in image.children(dir) {
        *cursor += record_total(image, child);
    }
    *cursor += 8; // terminator
    for &child in image.children(dir) {
        if image.inode_of(child).is_directory() {
            place_children(image, child, cursor, subdirs);
        }
    }
}

fn emit_children(
    image: &Image,
    dir: DentryId,
    subdirs: &HashMap<DentryId, u64>,
    groups: &HashMap<InodeId, u64>,
    out: &mut Vec<u8>,
) {
    for &child in image.children(dir) {
        emit_record(image, child, subdirs, groups, out);
    }
    out.extend_from_slice(&[0u8; 8]);
    for &child in image.children(dir) {
        if image.inode_of(child).is_directory() {
            emit_children(image, child, subdirs, groups, out);
        }
    }
}

/// Length field of a dentry record (fixed part + names, unpadded).
fn record_len(dentry: &Dentry) -> u64 {
    let mut len = DentryDisk::SIZE as u64 + utf16_nbytes(&dentry.name) as u64 + 2;
    if let Some(short) = &dentry.short_name {
        len += utf16_nbytes(short) as u64 + 2;
    }
    len
}

fn ads_len(stream: &Stream) -> u64 {
    let mut len = AdsEntryDisk::SIZE as u64;
    if let Some(name) = &stream.name {
        len += utf16_nbytes(name) as u64 + 2;
    }
    len
}

/// Full padded footprint of a record plus its stream records.
fn record_total(image: &Image, id: DentryId) -> u64 {
    let dentry = image.dentry(id);
    let inode = image.inode(dentry.inode);
    let mut total = align8(record_len(dentry));
    for stream in inode.named_streams() {
        total += align8(ads_len(stream));
    }
    total
}

fn emit_record(
    image: &Image,
    id: DentryId,
    subdirs: &HashMap<DentryId, u64>,
    groups: &HashMap<InodeId, u64>,
    out: &mut Vec<u8>,
) {
    let dentry = image.dentry(id);
    let inode = image.inode(dentry.inode);

    let mut disk = DentryDisk::read_from_bytes(&[0u8; DentryDisk::SIZE]).unwrap();
    disk.length = record_len(dentry).into();
    disk.attributes = inode.attributes.bits().into();
    disk.security_id = inode.security_id.unwrap_or(SECURITY_ID_NONE).into();
    disk.subdir_offset = if inode.is_directory() {
        subdirs.get(&id).copied().unwrap_or(0).into()
    } else {
        0u64.into()
    };
    disk.creation_time = inode.creation_time.into();
    disk.last_access_time = inode.last_access_time.into();
    disk.last_write_time = inode.last_write_time.into();
    disk.default_hash = inode
        .unnamed_stream()
        .and_then(|s| s.hash)
        .unwrap_or(Sha1Hash::ZERO)
        .0;
    if let Some(reparse) = inode.reparse {
        disk.set_tagged_reparse(reparse.tag, reparse.not_rpfixed);
    } else {
        disk.set_tagged_link_group(groups.get(&dentry.inode).copied().unwrap_or(0));
    }
    disk.num_streams = (inode.named_streams().count() as u16).into();
    disk.short_name_nbytes = (dentry
        .short_name
        .as_deref()
        .map(utf16_nbytes)
        .unwrap_or(0) as u16)
        .into();
    disk.file_name_nbytes = (utf16_nbytes(&dentry.name) as u16).into();

    let start = out.len();
    out.extend_from_slice(disk.as_bytes());
    push_utf16(out, &dentry.name);
    if let Some(short) = &dentry.short_name {
        push_utf16(out, short);
    }
    pad8(out, start);

    for stream in inode.named_streams() {
        let entry = AdsEntryDisk {
            length: ads_len(stream).into(),
            reserved: 0u64.into(),
            hash: stream.hash.unwrap_or(Sha1Hash::ZERO).0,
            stream_name_nbytes: (stream.name.as_deref().map(utf16_nbytes).unwrap_or(0) as u16)
                .into(),
        };
        let ads_start = out.len();
        out.extend_from_slice(entry.as_bytes());
        if let Some(name) = &stream.name {
            push_utf16(out, name);
        }
        pad8(out, ads_start);
    }
}

fn pad8(out: &mut Vec<u8>, start: usize) {
    let len = (out.len() - start) as u64;
    out.resize(start + align8(len) as usize, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn parse_back(image: &Image) -> Image {
        let bytes = write(image);
        parse(&bytes, DuplicateStreamPolicy::Warn, &test_logger()).unwrap()
    }

    fn sample_image() -> Image {
        let mut image = Image::new();
        let root = image.root();

        let dir_inode = image.add_inode(Inode::new(FileAttributes::DIRECTORY));
        let dir = image.add_child(root, "docs".into(), None, dir_inode).unwrap();

        let mut file = Inode::new(FileAttributes::NORMAL);
        file.creation_time = 0x01c0_0000_0000_0000;
        file.last_write_time = 0x01c0_0000_0000_1234;
        file.streams.push(Stream {
            name: None,
            hash: Some(Sha1Hash::of(b"file contents")),
        });
        file.streams.push(Stream {
            name: Some("meta".into()),
            hash: Some(Sha1Hash::of(b"ads contents")),
        });
        let file_inode = image.add_inode(file);
        image
            .add_child(dir, "report.txt".into(), Some("REPORT~1.TXT".into()), file_inode)
            .unwrap();

        // A hard-linked pair at the root.
        let mut linked = Inode::new(FileAttributes::NORMAL);
        linked.streams.push(Stream {
            name: None,
            hash: Some(Sha1Hash::of(b"linked")),
        });
        let linked = image.add_inode(linked);
        image.add_child(root, "x".into(), None, linked).unwrap();
        image.add_child(root, "y".into(), None, linked).unwrap();

        // An empty file: stream with no blob.
        let mut empty = Inode::new(FileAttributes::NORMAL);
        empty.streams.push(Stream { name: None, hash: None });
        let empty = image.add_inode(empty);
        image.add_child(root, "empty".into(), None, empty).unwrap();

        image.security.intern(b"fake security descriptor");
        image.inode_mut(file_inode).security_id = Some(0);
        image
    }

    #[test]
    fn round_trip_preserves_structure() {
        let image = sample_image();
        let parsed = parse_back(&image);

        assert_eq!(parsed.dentry_count(), image.dentry_count());
        assert_eq!(parsed.inode_count(), image.inode_count());

        let report = parsed.lookup("docs/report.txt").unwrap();
        let inode = parsed.inode_of(report);
        assert_eq!(
            inode.unnamed_stream().unwrap().hash,
            Some(Sha1Hash::of(b"file contents"))
        );
        let ads: Vec<_> = inode.named_streams().collect();
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].name.as_deref(), Some("meta"));
        assert_eq!(inode.security_id, Some(0));
        assert_eq!(inode.last_write_time, 0x01c0_0000_0000_1234);
        assert_eq!(
            parsed.dentry(report).short_name.as_deref(),
            Some("REPORT~1.TXT")
        );
        assert_eq!(
            parsed.security.get(0).unwrap(),
            b"fake security descriptor"
        );
    }

    #[test]
    fn round_trip_rebuilds_hard_links() {
        let parsed = parse_back(&sample_image());
        let x = parsed.lookup("x").unwrap();
        let y = parsed.lookup("y").unwrap();
        assert_eq!(parsed.dentry(x).inode, parsed.dentry(y).inode);
        assert_eq!(parsed.inode_of(x).link_count(), 2);
    }

    #[test]
    fn round_trip_keeps_empty_streams_blobless() {
        let parsed = parse_back(&sample_image());
        let empty = parsed.lookup("empty").unwrap();
        assert_eq!(parsed.inode_of(empty).unnamed_stream().unwrap().hash, None);
    }

    #[test]
    fn round_trip_reparse_point() {
        let mut image = Image::new();
        let root = image.root();
        let mut link = Inode::new(FileAttributes::REPARSE_POINT);
        link.reparse = Some(ReparseInfo {
            tag: repr::IO_REPARSE_TAG_SYMLINK,
            not_rpfixed: true,
        });
        link.streams.push(Stream {
            name: None,
            hash: Some(Sha1Hash::of(b"reparse buffer")),
        });
        let link = image.add_inode(link);
        image.add_child(root, "link".into(), None, link).unwrap();

        let parsed = parse_back(&image);
        let inode = parsed.inode_of(parsed.lookup("link").unwrap());
        assert_eq!(
            inode.reparse,
            Some(ReparseInfo {
                tag: repr::IO_REPARSE_TAG_SYMLINK,
                not_rpfixed: true,
            })
        );
    }

    #[test]
    fn truncated_metadata_is_rejected() {
        let image = sample_image();
        let bytes = write(&image);
        let err = parse(
            &bytes[..bytes.len() / 2],
            DuplicateStreamPolicy::Warn,
            &test_logger(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidMetadata);
    }

    #[test]
    fn oversized_short_name_is_rejected() {
        let mut image = Image::new();
        let root = image.root();
        let inode = image.add_inode(Inode::new(FileAttributes::NORMAL));
        image
            .add_child(root, "f".into(), Some("WAY_TOO_LONG_FOR_DOS".into()), inode)
            .unwrap();

        let bytes = write(&image);
        let err = parse(&bytes, DuplicateStreamPolicy::Warn, &test_logger()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidMetadata);
    }

    #[test]
    fn garbage_is_rejected_not_crashed() {
        let garbage = vec![0xa5u8; 300];
        assert!(parse(&garbage, DuplicateStreamPolicy::Warn, &test_logger()).is_err());
    }
}
