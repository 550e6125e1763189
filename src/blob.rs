//! The blob (lookup) table: the SHA-1-addressed content store.
//!
//! Every unique byte stream in an archive is one blob. Streams hold only
//! the 20-byte key; the table owns the descriptors, tracks reference
//! counts, and knows where each blob's bytes currently live (in an
//! archive, in a source file waiting to be pulled at write time, or in a
//! memory buffer).

use slog::Logger;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use zerocopy::{FromBytes, IntoBytes};

use repr::resource::{BlobTableEntryDisk, ResourceFlags};

use crate::capture::CaptureSource;
use crate::compression::Kind;
use crate::errors::{HeaderError, Result};
use crate::hash::Sha1Hash;
use crate::pool::FilePool;
use crate::resource::ResourceSpec;

/// Where a blob's bytes can be produced from.
#[derive(Clone)]
pub(crate) enum BlobLocation {
    /// Stored in an archive file, possibly compressed.
    Archive {
        pool: Arc<FilePool>,
        spec: ResourceSpec,
        codec: Kind,
    },
    /// A stream of a captured source entry, pulled lazily at write time.
    Source {
        source: Arc<dyn CaptureSource>,
        path: PathBuf,
        stream: Option<String>,
    },
    /// Held in memory (reparse data and other small buffers).
    Buffer(Arc<Vec<u8>>),
}

impl std::fmt::Debug for BlobLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobLocation::Archive { spec, codec, .. } => f
                .debug_struct("Archive")
                .field("spec", spec)
                .field("codec", codec)
                .finish_non_exhaustive(),
            BlobLocation::Source { path, stream, .. } => f
                .debug_struct("Source")
                .field("path", path)
                .field("stream", stream)
                .finish_non_exhaustive(),
            BlobLocation::Buffer(data) => {
                f.debug_struct("Buffer").field("len", &data.len()).finish()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    pub hash: Sha1Hash,
    /// Uncompressed size of the content.
    pub size: u64,
    /// Number of stream references across all retained images.
    pub refcnt: u32,
    pub part_number: u16,
    pub(crate) location: BlobLocation,
}

impl BlobDescriptor {
    /// Where the blob's resource starts, once it is stored in an archive.
    pub fn archive_offset(&self) -> Option<u64> {
        match &self.location {
            BlobLocation::Archive { spec, .. } => Some(spec.offset),
            _ => None,
        }
    }
}

/// The SHA-1 keyed blob map.
///
/// Mutated from a single task during capture; lookups during apply run on
/// the table as frozen. Emission order on write follows the map's
/// iteration order and is deliberately unspecified.
#[derive(Debug, Default)]
pub struct BlobTable {
    blobs: HashMap<Sha1Hash, BlobDescriptor>,
}

impl BlobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn get(&self, hash: &Sha1Hash) -> Option<&BlobDescriptor> {
        self.blobs.get(hash)
    }

    pub(crate) fn get_mut(&mut self, hash: &Sha1Hash) -> Option<&mut BlobDescriptor> {
        self.blobs.get_mut(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlobDescriptor> {
        self.blobs.values()
    }

    /// Look the hash up; on a hit bump the refcount, otherwise insert the
    /// descriptor `make` builds. Returns whether the blob was new.
    pub(crate) fn insert_or_intern<F>(&mut self, hash: Sha1Hash, make: F) -> bool
    where
        F: FnOnce() -> BlobDescriptor,
    {
        use std::collections::hash_map::Entry;
        match self.blobs.entry(hash) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().refcnt += 1;
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(make());
                true
            }
        }
    }

    /// Drop one reference; descriptors stay in the table at refcount zero
    /// until the next write prunes (or keeps) them.
    pub(crate) fn release(&mut self, hash: &Sha1Hash) {
        if let Some(blob) = self.blobs.get_mut(hash) {
            blob.refcnt = blob.refcnt.saturating_sub(1);
        }
    }

    pub(crate) fn prune_orphans(&mut self) {
        self.blobs.retain(|_, blob| blob.refcnt > 0);
    }

    /// Parse the decompressed blob-table resource. Entries flagged
    /// METADATA describe image metadata resources and are returned
    /// separately, in file order, which defines image indices.
    pub(crate) fn parse(
        data: &[u8],
        pool: &Arc<FilePool>,
        codec: Kind,
        strict: bool,
        logger: &Logger,
    ) -> Result<(BlobTable, Vec<(ResourceSpec, Sha1Hash)>)> {
        if data.len() % BlobTableEntryDisk::SIZE != 0 {
            return Err(HeaderError::BadBlobTableSize {
                size: data.len() as u64,
                entry_size: BlobTableEntryDisk::SIZE,
            }
            .into());
        }

        let mut table = BlobTable::new();
        let mut metadata = Vec::new();
        for raw in data.chunks_exact(BlobTableEntryDisk::SIZE) {
            let entry = BlobTableEntryDisk::read_from_bytes(raw)
                .expect("chunks_exact yields entry-sized slices");
            let spec = ResourceSpec::from_disk(&entry.resource, strict, logger)?;

            if spec.flags.contains(ResourceFlags::FREE) {
                continue;
            }
            if spec.flags.contains(ResourceFlags::METADATA) {
                metadata.push((spec, Sha1Hash(entry.hash)));
                continue;
            }

            let hash = Sha1Hash(entry.hash);
            let descriptor = BlobDescriptor {
                hash,
                size: spec.original_size,
                refcnt: entry.refcnt.get(),
                part_number: entry.part_number.get(),
                location: BlobLocation::Archive {
                    pool: Arc::clone(pool),
                    spec,
                    codec,
                },
            };
            if table.blobs.insert(hash, descriptor).is_some() {
                // Two entries sharing a SHA-1 violate the dedup invariant.
                slog::warn!(logger, "Duplicate blob table entry"; "hash" => %hash);
            }
        }
        Ok((table, metadata))
    }

    /// Serialize: metadata entries first (in image order, which readers
    /// rely on for image indexing), then blobs.
    ///
    /// Every blob must have an archive location by now; the writer
    /// repoints them as it emits their resources.
    pub(crate) fn to_bytes(
        &self,
        metadata: &[(ResourceSpec, Sha1Hash)],
        part_number: u16,
    ) -> Vec<u8> {
        fn push(out: &mut Vec<u8>, spec: &ResourceSpec, hash: &Sha1Hash, refcnt: u32, part: u16) {
            let entry = BlobTableEntryDisk {
                resource: spec.to_disk(),
                part_number: part.into(),
                refcnt: refcnt.into(),
                hash: hash.0,
            };
            out.extend_from_slice(entry.as_bytes());
        }

        let mut out =
            Vec::with_capacity((metadata.len() + self.blobs.len()) * BlobTableEntryDisk::SIZE);
        for (spec, hash) in metadata {
            push(&mut out, spec, hash, 1, part_number);
        }
        for blob in self.blobs.values() {
            let BlobLocation::Archive { spec, .. } = &blob.location else {
                debug_assert!(false, "serializing a blob that was never written");
                continue;
            };
            push(&mut out, spec, &blob.hash, blob.refcnt, part_number);
        }
        out
    }

    pub(crate) fn total_blob_bytes(&self) -> u64 {
        self.blobs.values().map(|b| b.size).sum()
    }
}
