//! Reading resources: the chunked, random-access compressed container.
//!
//! A compressed resource is a chunk-offset table followed by the chunks.
//! Offsets are relative to the end of the table; the first chunk's offset
//! (always 0) is omitted. Entries are 4 bytes when the uncompressed size
//! is under 2^32, 8 bytes otherwise. A chunk whose stored size equals its
//! uncompressed size is raw bytes, whatever the resource's codec says.

use positioned_io::ReadAt;
use slog::Logger;
use snafu::ResultExt;

use repr::resource::{ResourceEntryDisk, ResourceFlags, RESERVED_BITS};

use crate::compression::{Compressor, CHUNK_SIZE};
use crate::errors::{
    CorruptChunkTableSnafu, DecompressionSnafu, HeaderError, OutOfMemorySnafu, ReadSnafu, Result,
};
use crate::hash::{Hasher, Sha1Hash};
use crate::pool;

/// Refuse to materialize resources larger than this in one allocation.
const MAX_IN_MEMORY_RESOURCE: u64 = 1 << 31;

/// A validated resource location: where its bytes live and how big it is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Offset of the resource within the archive file
    pub offset: u64,
    /// Stored size (chunk table plus stored chunks when compressed)
    pub size: u64,
    /// Uncompressed size
    pub original_size: u64,
    pub flags: ResourceFlags,
}

impl ResourceSpec {
    /// Validate a raw on-disk entry. The two reserved high bits of the
    /// offset and original size are cleared with a warning; strict mode
    /// rejects them instead.
    pub(crate) fn from_disk(
        entry: &ResourceEntryDisk,
        strict: bool,
        logger: &Logger,
    ) -> Result<Self> {
        let mut offset = entry.offset_raw();
        let mut original_size = entry.original_size_raw();
        for value in [&mut offset, &mut original_size] {
            if *value & RESERVED_BITS != 0 {
                if strict {
                    return Err(HeaderError::ReservedOffsetBits { offset: *value }.into());
                }
                slog::warn!(logger, "Masking reserved bits in resource entry";
                    "value" => *value);
                *value &= !RESERVED_BITS;
            }
        }
        Ok(Self {
            offset,
            size: entry.size(),
            original_size,
            flags: entry.flags(),
        })
    }

    pub(crate) fn to_disk(&self) -> ResourceEntryDisk {
        ResourceEntryDisk::new(self.size, self.flags, self.offset, self.original_size)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(ResourceFlags::COMPRESSED)
    }

    pub(crate) fn num_chunks(&self) -> u64 {
        self.original_size.div_ceil(CHUNK_SIZE as u64)
    }

    /// 4-byte entries below 4 GiB of uncompressed data, 8-byte above.
    pub(crate) fn chunk_entry_size(&self) -> u64 {
        if self.original_size >= 1 << 32 {
            8
        } else {
            4
        }
    }

    pub(crate) fn chunk_table_size(&self) -> u64 {
        self.num_chunks().saturating_sub(1) * self.chunk_entry_size()
    }

    /// Uncompressed size of chunk `index`.
    fn chunk_uncompressed_size(&self, index: u64) -> usize {
        if index + 1 < self.num_chunks() {
            CHUNK_SIZE
        } else {
            let residue = (self.original_size % CHUNK_SIZE as u64) as usize;
            if residue == 0 {
                CHUNK_SIZE
            } else {
                residue
            }
        }
    }

    /// Stored size of chunk `index` given its start offset and, for all but
    /// the final chunk, the next chunk's start offset.
    fn chunk_stored_size(&self, index: u64, start: u64, next: Option<u64>) -> Result<usize> {
        let stored = match next {
            Some(next) => next as i128 - start as i128,
            None => self.size as i128 - self.chunk_table_size() as i128 - start as i128,
        };
        let limit = self.chunk_uncompressed_size(index) as i128;
        if stored <= 0 || stored > limit {
            return CorruptChunkTableSnafu {
                chunk: index,
                size: stored as i64,
            }
            .fail()
            .map_err(Into::into);
        }
        Ok(stored as usize)
    }
}

pub(crate) fn read_exact_at<F: ReadAt>(file: &F, pos: u64, buf: &mut [u8]) -> Result<()> {
    file.read_exact_at(pos, buf).context(ReadSnafu {
        offset: pos,
        len: buf.len() as u64,
    })?;
    Ok(())
}

/// Bulk read from an uncompressed resource.
pub(crate) fn read_uncompressed<F: ReadAt>(
    file: &F,
    spec: &ResourceSpec,
    offset: u64,
    out: &mut [u8],
) -> Result<()> {
    read_exact_at(file, spec.offset + offset, out)
}

/// Random-access read from a compressed resource.
///
/// Loads only the chunk-table slice covering the touched chunks (plus one
/// trailing entry when the range does not end at the final chunk, so the
/// last touched chunk's stored size can be derived), then decompresses
/// exactly the chunks in range. Boundary chunks decompress into a scratch
/// buffer and only the needed slice is copied out.
pub(crate) fn read_compressed<F: ReadAt>(
    file: &F,
    spec: &ResourceSpec,
    compressor: &Compressor,
    offset: u64,
    out: &mut [u8],
) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    let len = out.len() as u64;
    debug_assert!(offset + len <= spec.original_size);

    let chunk = CHUNK_SIZE as u64;
    let num_chunks = spec.num_chunks();
    let entry_size = spec.chunk_entry_size();
    let table_size = spec.chunk_table_size();

    let start_chunk = offset / chunk;
    let start_offset = (offset % chunk) as usize;
    let end_chunk = (offset + len - 1) / chunk;
    let end_offset = ((offset + len - 1) % chunk) as usize;

    // One offset per chunk in range, plus the entry after the range when
    // it exists (to size the final chunk in range).
    let mut wanted = end_chunk - start_chunk + 1;
    if end_chunk != num_chunks - 1 {
        wanted += 1;
    }

    let mut offsets: Vec<u64> = Vec::with_capacity(wanted as usize);
    if start_chunk == 0 {
        offsets.push(0);
    }
    let from_table = wanted - (start_chunk == 0) as u64;
    if from_table > 0 {
        let first_idx = if start_chunk == 0 { 0 } else { start_chunk - 1 };
        let mut raw = vec![0u8; (from_table * entry_size) as usize];
        read_exact_at(file, spec.offset + first_idx * entry_size, &mut raw)?;
        parse_chunk_offsets(&raw, entry_size, &mut offsets);
    }
    for pair in offsets.windows(2) {
        if pair[1] <= pair[0] {
            return CorruptChunkTableSnafu {
                chunk: start_chunk,
                size: pair[1] as i64 - pair[0] as i64,
            }
            .fail()
            .map_err(Into::into);
        }
    }

    let data_start = spec.offset + table_size;
    let mut out_pos = 0usize;
    let mut compressed_buf = pool::chunk_buf();
    let mut scratch = pool::chunk_buf();

    for index in start_chunk..=end_chunk {
        let rel = (index - start_chunk) as usize;
        let chunk_start = offsets[rel];
        let next = offsets.get(rel + 1).copied();
        let stored = spec.chunk_stored_size(index, chunk_start, next)?;
        let uncompressed = spec.chunk_uncompressed_size(index);

        let skip = if index == start_chunk { start_offset } else { 0 };
        let take = if index == end_chunk {
            end_offset + 1 - skip
        } else {
            uncompressed - skip
        };

        let file_pos = data_start + chunk_start;
        if stored == uncompressed {
            // Stored verbatim: pull just the needed slice.
            read_exact_at(file, file_pos + skip as u64, &mut out[out_pos..out_pos + take])?;
        } else {
            compressed_buf.resize(stored, 0);
            read_exact_at(file, file_pos, &mut compressed_buf)?;
            if take == uncompressed {
                compressor
                    .decompress(&compressed_buf, &mut out[out_pos..out_pos + take])
                    .map_err(|_| crate::errors::Error::from(DecompressionSnafu { chunk: index }.build()))?;
            } else {
                scratch.resize(uncompressed, 0);
                compressor
                    .decompress(&compressed_buf, &mut scratch)
                    .map_err(|_| crate::errors::Error::from(DecompressionSnafu { chunk: index }.build()))?;
                out[out_pos..out_pos + take].copy_from_slice(&scratch[skip..skip + take]);
            }
        }
        out_pos += take;
    }
    Ok(())
}

fn parse_chunk_offsets(raw: &[u8], entry_size: u64, offsets: &mut Vec<u64>) {
    if entry_size == 4 {
        for entry in raw.chunks_exact(4) {
            offsets.push(u64::from(u32::from_le_bytes(entry.try_into().unwrap())));
        }
    } else {
        for entry in raw.chunks_exact(8) {
            offsets.push(u64::from_le_bytes(entry.try_into().unwrap()));
        }
    }
}

/// Read part of a resource, dispatching on its compression flag.
pub(crate) fn read<F: ReadAt>(
    file: &F,
    spec: &ResourceSpec,
    compressor: &Compressor,
    offset: u64,
    out: &mut [u8],
) -> Result<()> {
    if spec.is_compressed() {
        read_compressed(file, spec, compressor, offset, out)
    } else {
        read_uncompressed(file, spec, offset, out)
    }
}

/// Read a whole resource into memory.
pub(crate) fn read_full<F: ReadAt>(
    file: &F,
    spec: &ResourceSpec,
    compressor: &Compressor,
) -> Result<Vec<u8>> {
    if spec.original_size > MAX_IN_MEMORY_RESOURCE {
        return OutOfMemorySnafu {
            requested: spec.original_size,
        }
        .fail()
        .map_err(Into::into);
    }
    let mut out = vec![0u8; spec.original_size as usize];
    read(file, spec, compressor, 0, &mut out)?;
    Ok(out)
}

/// Stream a whole resource through `sink` in ascending chunk order,
/// returning the SHA-1 over the uncompressed bytes.
///
/// This is the apply pipeline's workhorse: each chunk is decompressed once
/// no matter how many targets consume it downstream.
pub(crate) fn read_chunks<F, S>(
    file: &F,
    spec: &ResourceSpec,
    compressor: &Compressor,
    mut sink: S,
) -> Result<Sha1Hash>
where
    F: ReadAt,
    S: FnMut(&[u8]) -> Result<()>,
{
    let mut hasher = Hasher::new();

    if !spec.is_compressed() {
        let mut buf = pool::chunk_buf();
        let mut remaining = spec.original_size;
        let mut pos = spec.offset;
        while remaining > 0 {
            let take = remaining.min(CHUNK_SIZE as u64) as usize;
            buf.resize(take, 0);
            read_exact_at(file, pos, &mut buf)?;
            hasher.update(&buf);
            sink(&buf)?;
            pos += take as u64;
            remaining -= take as u64;
        }
        return Ok(hasher.finish());
    }

    let num_chunks = spec.num_chunks();
    let entry_size = spec.chunk_entry_size();
    let table_size = spec.chunk_table_size();

    let mut offsets: Vec<u64> = Vec::with_capacity(num_chunks as usize);
    offsets.push(0);
    if num_chunks > 1 {
        let mut raw = vec![0u8; table_size as usize];
        read_exact_at(file, spec.offset, &mut raw)?;
        parse_chunk_offsets(&raw, entry_size, &mut offsets);
    }

    let data_start = spec.offset + table_size;
    let mut compressed_buf = pool::chunk_buf();
    let mut chunk_data = pool::chunk_buf();

    for index in 0..num_chunks {
        let chunk_start = offsets[index as usize];
        let next = offsets.get(index as usize + 1).copied();
        let stored = spec.chunk_stored_size(index, chunk_start, next)?;
        let uncompressed = spec.chunk_uncompressed_size(index);

        chunk_data.resize(uncompressed, 0);
        if stored == uncompressed {
            read_exact_at(file, data_start + chunk_start, &mut chunk_data)?;
        } else {
            compressed_buf.resize(stored, 0);
            read_exact_at(file, data_start + chunk_start, &mut compressed_buf)?;
            compressor
                .decompress(&compressed_buf, &mut chunk_data)
                .map_err(|_| crate::errors::Error::from(DecompressionSnafu { chunk: index }.build()))?;
        }
        hasher.update(&chunk_data);
        sink(&chunk_data)?;
    }
    Ok(hasher.finish())
}
