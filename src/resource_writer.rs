//! Writing resources: streaming chunker over the shared output file.
//!
//! The chunk-offset table is laid out before the chunks, so `begin`
//! reserves a gap sized from the declared uncompressed size and `end`
//! backpatches it once every chunk's stored size is known. Full chunks go
//! through the parallel compressor; chunks the codec declines are stored
//! verbatim with stored size equal to uncompressed size. A hasher runs
//! over the uncompressed bytes so the blob descriptor can be emitted on
//! `end`.

use crossbeam_channel::Receiver;
use snafu::ResultExt;
use std::collections::VecDeque;

use repr::resource::ResourceFlags;

use crate::compress_threads::{ParallelCompressor, Response};
use crate::compression::CHUNK_SIZE;
use crate::errors::{Result, WriteSnafu};
use crate::hash::{Hasher, Sha1Hash};
use crate::resource::ResourceSpec;
use crate::shared_position_file::{Positioned, SharedWriteAt};

/// Chunks in flight before the writer blocks on the oldest one.
const MAX_INFLIGHT: usize = 32;

pub(crate) struct ResourceWriter<'a, W: SharedWriteAt> {
    out: &'a mut Positioned<W>,
    compressor: Option<&'a ParallelCompressor>,
    start: u64,
    table_at: u64,
    entry_size: u64,
    original_size: u64,
    fed: u64,
    /// Start of each written chunk, relative to the end of the table.
    chunk_starts: Vec<u64>,
    data_rel: u64,
    pending: VecDeque<Receiver<Response>>,
    buf: Vec<u8>,
    hasher: Hasher,
}

impl<'a, W: SharedWriteAt> ResourceWriter<'a, W> {
    /// Start a resource of `original_size` uncompressed bytes at the
    /// current output position. Pass `None` to store it uncompressed.
    pub(crate) fn begin(
        out: &'a mut Positioned<W>,
        compressor: Option<&'a ParallelCompressor>,
        original_size: u64,
    ) -> Self {
        let start = out.position();
        let spec = ResourceSpec {
            offset: start,
            size: 0,
            original_size,
            flags: ResourceFlags::COMPRESSED,
        };
        let (table_at, entry_size) = if compressor.is_some() {
            (out.reserve(spec.chunk_table_size()), spec.chunk_entry_size())
        } else {
            (start, 0)
        };
        Self {
            out,
            compressor,
            start,
            table_at,
            entry_size,
            original_size,
            fed: 0,
            chunk_starts: Vec::new(),
            data_rel: 0,
            pending: VecDeque::new(),
            buf: Vec::with_capacity(CHUNK_SIZE),
            hasher: Hasher::new(),
        }
    }

    pub(crate) fn feed(&mut self, mut bytes: &[u8]) -> Result<()> {
        self.hasher.update(bytes);
        self.fed += bytes.len() as u64;
        debug_assert!(self.fed <= self.original_size);

        if self.compressor.is_none() {
            return self.put(bytes);
        }

        while !bytes.is_empty() {
            let room = CHUNK_SIZE - self.buf.len();
            let take = room.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.buf.len() == CHUNK_SIZE {
                let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
                self.submit(chunk)?;
            }
        }
        Ok(())
    }

    /// Finish the resource: flush the tail chunk, wait out the pipeline,
    /// backpatch the chunk table, and emit the entry plus content hash.
    pub(crate) fn end(mut self) -> Result<(ResourceSpec, Sha1Hash)> {
        debug_assert_eq!(self.fed, self.original_size);

        let compressed = self.compressor.is_some();
        if compressed {
            if !self.buf.is_empty() {
                let chunk = std::mem::take(&mut self.buf);
                self.submit(chunk)?;
            }
            while let Some(rx) = self.pending.pop_front() {
                let response = rx.recv().expect("compressor thread died");
                self.write_chunk(response)?;
            }
            self.patch_table()?;
        }

        let flags = if compressed {
            ResourceFlags::COMPRESSED
        } else {
            ResourceFlags::empty()
        };
        let table_size = self.chunk_starts.len().saturating_sub(1) as u64 * self.entry_size;
        let spec = ResourceSpec {
            offset: self.start,
            size: if compressed {
                table_size + self.data_rel
            } else {
                self.original_size
            },
            original_size: self.original_size,
            flags,
        };
        Ok((spec, self.hasher.finish()))
    }

    fn submit(&mut self, chunk: Vec<u8>) -> Result<()> {
        let compressor = self.compressor.expect("submit on uncompressed writer");
        self.pending.push_back(compressor.compress(chunk));
        while self.pending.len() > MAX_INFLIGHT {
            let rx = self.pending.pop_front().unwrap();
            let response = rx.recv().expect("compressor thread died");
            self.write_chunk(response)?;
        }
        Ok(())
    }

    fn write_chunk(&mut self, response: Response) -> Result<()> {
        self.chunk_starts.push(self.data_rel);
        self.data_rel += response.data.len() as u64;
        self.put(&response.data)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let at = self.out.position();
        self.out
            .write_all(bytes)
            .context(WriteSnafu { offset: at })?;
        Ok(())
    }

    fn patch_table(&mut self) -> Result<()> {
        // The first chunk's offset (0) is implicit.
        let mut table = Vec::with_capacity(self.chunk_starts.len().saturating_sub(1) * 8);
        for &start in self.chunk_starts.iter().skip(1) {
            if self.entry_size == 4 {
                table.extend_from_slice(&(start as u32).to_le_bytes());
            } else {
                table.extend_from_slice(&start.to_le_bytes());
            }
        }
        self.out
            .patch(&table, self.table_at)
            .context(WriteSnafu {
                offset: self.table_at,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress_threads::ParallelCompressor;
    use crate::compression::{Compressor, Kind};
    use crate::resource;
    use positioned_io::RandomAccessFile;

    fn write_and_read_back(data: &[u8], kind: Kind) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = RandomAccessFile::try_new(tmp.reopen().unwrap()).unwrap();
        let pool;
        let compressor = match kind {
            Kind::None => None,
            kind => {
                pool = ParallelCompressor::with_threads(Compressor::new(kind), 2);
                Some(&pool)
            }
        };

        let mut out = Positioned::new(&file);
        let mut writer = ResourceWriter::begin(&mut out, compressor, data.len() as u64);
        // Feed in awkward sizes to exercise chunk-boundary buffering.
        for piece in data.chunks(CHUNK_SIZE / 3 + 7) {
            writer.feed(piece).unwrap();
        }
        let (spec, hash) = writer.end().unwrap();

        assert_eq!(spec.original_size, data.len() as u64);
        assert_eq!(hash, crate::hash::Sha1Hash::of(data));
        assert_eq!(spec.is_compressed(), kind != Kind::None);

        let read_back =
            resource::read_full(&&file, &spec, &Compressor::new(kind)).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn uncompressed_round_trip() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        write_and_read_back(&data, Kind::None);
    }

    #[test]
    fn lzx_round_trip_multiple_chunks() {
        let data: Vec<u8> = b"compressible content here "
            .iter()
            .copied()
            .cycle()
            .take(3 * CHUNK_SIZE + 11)
            .collect();
        write_and_read_back(&data, Kind::Lzx);
    }

    #[test]
    fn xpress_round_trip_exact_chunk() {
        let data: Vec<u8> = b"0123456789abcdef"
            .iter()
            .copied()
            .cycle()
            .take(CHUNK_SIZE)
            .collect();
        write_and_read_back(&data, Kind::Xpress);
    }

    #[test]
    fn incompressible_chunks_are_stored_verbatim() {
        let mut state = 77u64;
        let data: Vec<u8> = (0..2 * CHUNK_SIZE)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = RandomAccessFile::try_new(tmp.reopen().unwrap()).unwrap();
        let pool = ParallelCompressor::with_threads(Compressor::new(Kind::Lzx), 2);

        let mut out = Positioned::new(&file);
        let mut writer = ResourceWriter::begin(&mut out, Some(&pool), data.len() as u64);
        writer.feed(&data).unwrap();
        let (spec, _) = writer.end().unwrap();

        // Verbatim chunks: stored size is table + both raw chunks.
        assert_eq!(spec.size, 4 + data.len() as u64);
        let read_back =
            resource::read_full(&&file, &spec, &Compressor::new(Kind::Lzx)).unwrap();
        assert_eq!(read_back, data);
    }
}
