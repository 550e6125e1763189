//! The whole-file integrity table: one SHA-1 per 10 MiB of the archive
//! from the end of the header to the end of the blob table.

use positioned_io::ReadAt;
use zerocopy::{FromBytes, IntoBytes};

use repr::integrity::{IntegrityTableDisk, INTEGRITY_CHUNK_SIZE};
use repr::{HASH_SIZE, HEADER_SIZE};

use crate::errors::{HeaderError, ResourceHashSnafu, Result};
use crate::hash::{Hasher, Sha1Hash};
use crate::resource::read_exact_at;

/// Hash the covered range and serialize the table.
pub(crate) fn compute<F: ReadAt>(file: &F, end: u64) -> Result<Vec<u8>> {
    let hashes = hash_range(file, end)?;
    let table_size = IntegrityTableDisk::SIZE + hashes.len() * HASH_SIZE;
    let header = IntegrityTableDisk {
        table_size: (table_size as u32).into(),
        num_entries: (hashes.len() as u32).into(),
        chunk_size: INTEGRITY_CHUNK_SIZE.into(),
    };
    let mut out = Vec::with_capacity(table_size);
    out.extend_from_slice(header.as_bytes());
    for hash in &hashes {
        out.extend_from_slice(&hash.0);
    }
    Ok(out)
}

/// Recompute the covered range and compare against a stored table.
pub(crate) fn verify<F: ReadAt>(file: &F, table: &[u8], end: u64) -> Result<()> {
    let (header, rest) = IntegrityTableDisk::read_from_prefix(table).map_err(|_| {
        crate::errors::Error::from(HeaderError::BadIntegrityTable {
            reason: "header truncated",
        })
    })?;
    let num_entries = header.num_entries.get() as usize;
    if header.chunk_size.get() != INTEGRITY_CHUNK_SIZE || rest.len() < num_entries * HASH_SIZE {
        return Err(HeaderError::BadIntegrityTable {
            reason: "entry count disagrees with table size",
        }
        .into());
    }

    let actual = hash_range(file, end)?;
    if actual.len() != num_entries {
        return Err(HeaderError::BadIntegrityTable {
            reason: "entry count disagrees with the covered range",
        }
        .into());
    }
    for (index, hash) in actual.iter().enumerate() {
        let stored: [u8; HASH_SIZE] = rest[index * HASH_SIZE..(index + 1) * HASH_SIZE]
            .try_into()
            .unwrap();
        let stored = Sha1Hash(stored);
        if *hash != stored {
            return ResourceHashSnafu {
                expected: stored,
                actual: *hash,
            }
            .fail()
            .map_err(Into::into);
        }
    }
    Ok(())
}

fn hash_range<F: ReadAt>(file: &F, end: u64) -> Result<Vec<Sha1Hash>> {
    let start = u64::from(HEADER_SIZE);
    let span = end.saturating_sub(start);
    let chunks = span.div_ceil(u64::from(INTEGRITY_CHUNK_SIZE));

    let mut hashes = Vec::with_capacity(chunks as usize);
    let mut buf = vec![0u8; 256 * 1024];
    for index in 0..chunks {
        let chunk_start = start + index * u64::from(INTEGRITY_CHUNK_SIZE);
        let chunk_len = (end - chunk_start).min(u64::from(INTEGRITY_CHUNK_SIZE));

        let mut hasher = Hasher::new();
        let mut pos = chunk_start;
        let mut remaining = chunk_len;
        while remaining > 0 {
            let take = remaining.min(buf.len() as u64) as usize;
            read_exact_at(file, pos, &mut buf[..take])?;
            hasher.update(&buf[..take]);
            pos += take as u64;
            remaining -= take as u64;
        }
        hashes.push(hasher.finish());
    }
    Ok(hashes)
}
