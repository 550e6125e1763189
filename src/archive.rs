//! The archive front-end: open, capture, apply, export, delete, write.
//!
//! Reading follows the format's dependency order: header, blob table
//! (itself a resource), then each image's metadata resource, resolving
//! every stream reference against the blob table. Writing runs the other
//! way: blob resources first (pulling bytes from wherever each blob
//! currently lives), then metadata resources, the blob table, the XML
//! region, the optional integrity table, and finally the header, which is
//! rewritten in place.

use parking_lot::Mutex;
use positioned_io::RandomAccessFile;
use slog::{info, o, Logger};
use snafu::{IntoError, ResultExt};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use zerocopy::{FromBytes, IntoBytes};

use repr::header::HeaderDisk;
use repr::resource::{ResourceEntryDisk, ResourceFlags};
use repr::{HeaderFlags, CHUNK_SIZE, HEADER_SIZE, MAGIC, VERSION};

use crate::apply::{self, ApplyOptions, ApplyTarget};
use crate::blob::{BlobDescriptor, BlobLocation, BlobTable};
use crate::capture::{self, CaptureOptions, CaptureSource};
use crate::compress_threads::ParallelCompressor;
use crate::compression::{Compressor, Kind};
use crate::config::CaptureConfig;
use crate::errors::{
    HeaderError, ImageCountMismatchSnafu, ImageNameCollisionSnafu, MetadataError, NoImageSnafu,
    OpenSnafu, ResourceHashSnafu, Result, UnsupportedSnafu, WriteSnafu,
};
use crate::hash::{Hasher, Sha1Hash};
use crate::metadata::{self, DuplicateStreamPolicy};
use crate::pool::FilePool;
use crate::resource::{self, read_exact_at, ResourceSpec};
use crate::resource_writer::ResourceWriter;
use crate::shared_position_file::Positioned;
use crate::tree::Image;
use crate::xml::XmlData;

/// How to open an existing archive.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Reject quirks (reserved resource-entry bits, out-of-range boot
    /// index) instead of masking them with a warning.
    pub strict: bool,
    /// Policy for inodes carrying two unnamed streams.
    pub duplicate_streams: DuplicateStreamPolicy,
    logger: Option<Logger>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(&mut self, strict: bool) -> &mut Self {
        self.strict = strict;
        self
    }

    pub fn duplicate_streams(&mut self, policy: DuplicateStreamPolicy) -> &mut Self {
        self.duplicate_streams = policy;
        self
    }

    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = Some(logger);
        self
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Wim> {
        Wim::open_with_options(path.as_ref(), self)
    }
}

/// How to write an archive out.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Also emit the whole-file integrity table.
    pub check_integrity: bool,
    /// Keep blob-table entries whose refcount dropped to zero instead of
    /// pruning them.
    pub keep_orphans: bool,
}

/// An archive: N images sharing one deduplicated blob store.
pub struct Wim {
    pool: Option<Arc<FilePool>>,
    codec: Kind,
    guid: [u8; 16],
    boot_index: u32,
    images: Vec<Image>,
    blobs: Mutex<BlobTable>,
    xml: XmlData,
    integrity_spec: Option<ResourceSpec>,
    /// Where the tail region (blob table onwards) starts; appends begin here.
    data_end: u64,
    /// End of the range the integrity table covers (blob table end).
    integrity_end: u64,
    readonly: bool,
    strict: bool,
    policy: DuplicateStreamPolicy,
    logger: Logger,
}

impl Wim {
    /// Open and fully validate an archive.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Wim::open_with_options(path.as_ref(), &OpenOptions::default())
    }

    fn open_with_options(path: &Path, options: &OpenOptions) -> Result<Self> {
        let logger = options
            .logger
            .clone()
            .unwrap_or_else(crate::default_logger)
            .new(o!("file" => path.display().to_string()));

        let pool = Arc::new(FilePool::new(path));
        let file = pool.acquire()?;

        let mut raw = [0u8; HeaderDisk::SIZE];
        read_exact_at(&*file, 0, &mut raw)?;
        let header = HeaderDisk::read_from_bytes(&raw).expect("fixed-size read");

        if header.magic != MAGIC {
            return Err(HeaderError::BadMagic {
                magic: header.magic,
            }
            .into());
        }
        if header.header_size.get() != HEADER_SIZE {
            return Err(HeaderError::BadHeaderSize {
                actual: header.header_size.get(),
            }
            .into());
        }
        if header.version.get() != VERSION {
            return Err(HeaderError::BadVersion {
                actual: header.version.get(),
            }
            .into());
        }
        if header.chunk_size.get() != CHUNK_SIZE {
            return Err(HeaderError::BadChunkSize {
                actual: header.chunk_size.get(),
            }
            .into());
        }
        if header.part_number.get() != 1 || header.total_parts.get() != 1 {
            return Err(HeaderError::Spanned {
                part: header.part_number.get(),
                total: header.total_parts.get(),
            }
            .into());
        }

        let flags = HeaderFlags::from_bits_retain(header.flags.get());
        let codec = Kind::from_header_flags(flags).ok_or_else(|| {
            crate::errors::Error::from(HeaderError::UnknownCompression {
                flags: header.flags.get(),
            })
        })?;

        info!(logger, "Read archive header";
            "version" => header.version.get(),
            "flags" => ?flags,
            "codec" => %codec,
            "image_count" => header.image_count.get(),
            "boot_index" => header.boot_index.get(),
        );

        let compressor = Compressor::new(codec);
        let (blobs, metadata_specs, data_end, integrity_end) =
            if header.blob_table.is_absent() {
                (BlobTable::new(), Vec::new(), u64::from(HEADER_SIZE), u64::from(HEADER_SIZE))
            } else {
                let spec = ResourceSpec::from_disk(&header.blob_table, options.strict, &logger)?;
                let data = resource::read_full(&*file, &spec, &compressor)?;
                let (blobs, metadata) =
                    BlobTable::parse(&data, &pool, codec, options.strict, &logger)?;
                (blobs, metadata, spec.offset, spec.offset + spec.size)
            };

        if metadata_specs.len() as u32 != header.image_count.get() {
            return ImageCountMismatchSnafu {
                header: header.image_count.get(),
                found: metadata_specs.len() as u32,
            }
            .fail()
            .map_err(Into::into);
        }

        let mut images = Vec::with_capacity(metadata_specs.len());
        for (spec, expected) in &metadata_specs {
            let data = resource::read_full(&*file, spec, &compressor)?;
            let actual = Sha1Hash::of(&data);
            if actual != *expected {
                return ResourceHashSnafu {
                    expected: *expected,
                    actual,
                }
                .fail()
                .map_err(Into::into);
            }
            let image = metadata::parse(&data, options.duplicate_streams, &logger)?;
            for hash in image.stream_references() {
                if blobs.get(&hash).is_none() {
                    return Err(MetadataError::UnresolvedStream { hash }.into());
                }
            }
            images.push(image);
        }

        let mut blobs = blobs;
        reconcile_refcounts(&mut blobs, &images, &logger);

        let mut boot_index = header.boot_index.get();
        if boot_index as usize > images.len() {
            if options.strict {
                return NoImageSnafu { index: boot_index }.fail().map_err(Into::into);
            }
            slog::warn!(logger, "Boot index out of range; clearing";
                "boot_index" => boot_index);
            boot_index = 0;
        }

        let xml = if header.xml_data.is_absent() {
            XmlData::new()
        } else {
            let spec = ResourceSpec::from_disk(&header.xml_data, options.strict, &logger)?;
            XmlData::from_raw(resource::read_full(&*file, &spec, &compressor)?)
        };

        let integrity_spec = if header.integrity.is_absent() {
            None
        } else {
            Some(ResourceSpec::from_disk(
                &header.integrity,
                options.strict,
                &logger,
            )?)
        };

        drop(file);
        Ok(Wim {
            pool: Some(pool),
            codec,
            guid: header.guid,
            boot_index,
            images,
            blobs: Mutex::new(blobs),
            xml,
            integrity_spec,
            data_end,
            integrity_end,
            readonly: flags.contains(HeaderFlags::READONLY),
            strict: options.strict,
            policy: options.duplicate_streams,
            logger,
        })
    }

    /// A fresh, empty, in-memory archive.
    pub fn create(codec: Kind) -> Self {
        Wim {
            pool: None,
            codec,
            guid: generate_guid(),
            boot_index: 0,
            images: Vec::new(),
            blobs: Mutex::new(BlobTable::new()),
            xml: XmlData::new(),
            integrity_spec: None,
            data_end: 0,
            integrity_end: 0,
            readonly: false,
            strict: false,
            policy: DuplicateStreamPolicy::default(),
            logger: crate::default_logger(),
        }
    }

    pub fn codec(&self) -> Kind {
        self.codec
    }

    pub fn guid(&self) -> &[u8; 16] {
        &self.guid
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Images are 1-indexed, as in the on-disk format.
    pub fn image(&self, index: u32) -> Result<&Image> {
        if index == 0 || index as usize > self.images.len() {
            return NoImageSnafu { index }.fail().map_err(Into::into);
        }
        Ok(&self.images[index as usize - 1])
    }

    pub fn boot_index(&self) -> u32 {
        self.boot_index
    }

    /// Set the bootable image; 0 means none.
    pub fn set_boot_index(&mut self, index: u32) -> Result<()> {
        if index != 0 && index as usize > self.images.len() {
            return NoImageSnafu { index }.fail().map_err(Into::into);
        }
        self.boot_index = index;
        Ok(())
    }

    pub fn image_name(&self, index: u32) -> Result<Option<&str>> {
        Ok(self.image(index)?.name.as_deref())
    }

    pub fn set_image_name(&mut self, index: u32, name: &str) -> Result<()> {
        self.image(index)?;
        self.ensure_name_free(name, Some(index))?;
        self.images[index as usize - 1].name = Some(name.to_owned());
        Ok(())
    }

    fn ensure_name_free(&self, name: &str, except: Option<u32>) -> Result<()> {
        for (i, image) in self.images.iter().enumerate() {
            if Some(i as u32 + 1) == except {
                continue;
            }
            if image.name.as_deref() == Some(name) {
                return ImageNameCollisionSnafu { name }.fail().map_err(Into::into);
            }
        }
        Ok(())
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn blob(&self, hash: &Sha1Hash) -> Option<BlobDescriptor> {
        self.blobs.lock().get(hash).cloned()
    }

    /// Read a whole blob into memory, verifying its SHA-1.
    pub fn read_blob(&self, hash: &Sha1Hash) -> Result<Vec<u8>> {
        let blob = self
            .blobs
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| crate::errors::Error::from(MetadataError::UnresolvedStream { hash: *hash }))?;

        let data = match &blob.location {
            BlobLocation::Archive { pool, spec, codec } => {
                let file = pool.acquire()?;
                resource::read_full(&*file, spec, &Compressor::new(*codec))?
            }
            BlobLocation::Buffer(data) => data.as_ref().clone(),
            BlobLocation::Source {
                source,
                path,
                stream,
            } => {
                let mut reader = source.open_stream(path, stream.as_deref())?;
                let mut data = Vec::new();
                reader
                    .read_to_end(&mut data)
                    .context(crate::errors::ReadSnafu {
                        offset: 0u64,
                        len: blob.size,
                    })?;
                data
            }
        };

        let actual = Sha1Hash::of(&data);
        if actual != *hash {
            return ResourceHashSnafu {
                expected: *hash,
                actual,
            }
            .fail()
            .map_err(Into::into);
        }
        Ok(data)
    }

    /// Random-access read of part of a blob. Only the chunks covering the
    /// range are touched; no whole-blob verification happens here.
    pub fn read_blob_range(&self, hash: &Sha1Hash, offset: u64, out: &mut [u8]) -> Result<()> {
        let blob = self
            .blobs
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| crate::errors::Error::from(MetadataError::UnresolvedStream { hash: *hash }))?;

        if offset + out.len() as u64 > blob.size {
            return Err(crate::errors::Error::from(
                crate::errors::ReadSnafu {
                    offset,
                    len: out.len() as u64,
                }
                .into_error(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
            ));
        }

        match &blob.location {
            BlobLocation::Archive { pool, spec, codec } => {
                let file = pool.acquire()?;
                resource::read(&*file, spec, &Compressor::new(*codec), offset, out)
            }
            BlobLocation::Buffer(data) => {
                let at = offset as usize;
                out.copy_from_slice(&data[at..at + out.len()]);
                Ok(())
            }
            BlobLocation::Source {
                source,
                path,
                stream,
            } => {
                let reader = source.open_stream(path, stream.as_deref())?;
                let mut reader = reader.take(offset + out.len() as u64);
                std::io::copy(
                    &mut reader.by_ref().take(offset),
                    &mut std::io::sink(),
                )
                .and_then(|_| reader.read_exact(out))
                .context(crate::errors::ReadSnafu {
                    offset,
                    len: out.len() as u64,
                })?;
                Ok(())
            }
        }
    }

    /// Capture a source tree as a new image; returns its 1-based index.
    pub fn capture_image(
        &mut self,
        source: Arc<dyn CaptureSource>,
        root: &Path,
        config: &CaptureConfig,
        options: &CaptureOptions,
        name: Option<&str>,
    ) -> Result<u32> {
        if let Some(name) = name {
            self.ensure_name_free(name, None)?;
        }
        let blobs = self.blobs.get_mut();
        let mut image =
            capture::capture_tree(&source, root, config, options, blobs, &self.logger)?;
        image.name = name.map(str::to_owned);
        self.images.push(image);
        Ok(self.images.len() as u32)
    }

    /// Drop an image; blob refcounts fall and orphans linger until the
    /// next write prunes them.
    pub fn delete_image(&mut self, index: u32) -> Result<()> {
        self.image(index)?;
        let image = self.images.remove(index as usize - 1);
        let blobs = self.blobs.get_mut();
        for hash in image.stream_references() {
            blobs.release(&hash);
        }
        if self.boot_index == index {
            self.boot_index = 0;
        } else if self.boot_index > index {
            self.boot_index -= 1;
        }
        Ok(())
    }

    /// Copy an image out of another archive, sharing blob bytes
    /// unchanged; returns the new 1-based index.
    pub fn export_image(&mut self, source: &Wim, index: u32) -> Result<u32> {
        let image = source.image(index)?;
        if let Some(name) = &image.name {
            self.ensure_name_free(name, None)?;
        }

        let cloned = image.clone();
        let source_blobs = source.blobs.lock();
        let blobs = self.blobs.get_mut();
        for hash in cloned.stream_references() {
            let blob = source_blobs
                .get(&hash)
                .ok_or_else(|| crate::errors::Error::from(MetadataError::UnresolvedStream { hash }))?;
            blobs.insert_or_intern(hash, || {
                let mut blob = blob.clone();
                blob.refcnt = 1;
                blob
            });
        }
        drop(source_blobs);

        self.images.push(cloned);
        Ok(self.images.len() as u32)
    }

    /// Materialize an image onto an apply target.
    pub fn apply_image<T: ApplyTarget>(
        &self,
        index: u32,
        target: &mut T,
        options: &ApplyOptions,
    ) -> Result<()> {
        let image = self.image(index)?;
        let blobs = self.blobs.lock();
        apply::apply_image(image, &blobs, target, options, &self.logger)
    }

    /// Write the archive to a new file.
    pub fn write<P: AsRef<Path>>(&mut self, path: P, options: &WriteOptions) -> Result<()> {
        self.write_path(path.as_ref(), options)
    }

    fn write_path(&mut self, path: &Path, options: &WriteOptions) -> Result<()> {
        let file = fs::File::create(path).context(OpenSnafu { path })?;
        let raf = RandomAccessFile::try_new(file).context(OpenSnafu { path })?;
        self.write_body(&raf, path, options, u64::from(HEADER_SIZE), None)
    }

    /// Rewrite the backing file in place: blobs already stored there keep
    /// their resources untouched, new blobs are appended, and only the
    /// tail region (blob table, XML, integrity table) plus the header are
    /// rewritten.
    pub fn overwrite(&mut self, options: &WriteOptions) -> Result<()> {
        let pool = match &self.pool {
            Some(pool) => Arc::clone(pool),
            None => {
                return UnsupportedSnafu {
                    reason: "archive is not backed by a file".to_string(),
                }
                .fail()
                .map_err(Into::into)
            }
        };
        if self.readonly {
            return UnsupportedSnafu {
                reason: "archive is flagged read-only".to_string(),
            }
            .fail()
            .map_err(Into::into);
        }

        let path = pool.path().to_path_buf();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .context(OpenSnafu { path: path.clone() })?;
        let raf = RandomAccessFile::try_new(file).context(OpenSnafu { path: path.clone() })?;
        let start = self.data_end;
        self.write_body(&raf, &path, options, start, Some(&pool))
    }

    fn write_body(
        &mut self,
        raf: &RandomAccessFile,
        path: &Path,
        options: &WriteOptions,
        start: u64,
        reuse: Option<&Arc<FilePool>>,
    ) -> Result<()> {
        let mut out = Positioned::with_position(raf, start);

        // Mark the file in progress until the final header lands.
        let skeleton = self.build_header(None, None, None, None, true);
        out.patch(skeleton.as_bytes(), 0)
            .context(WriteSnafu { offset: 0u64 })?;

        if !options.keep_orphans {
            self.blobs.get_mut().prune_orphans();
        }
        let parallel = self
            .codec
            .is_compressed()
            .then(|| ParallelCompressor::new(Compressor::new(self.codec)));

        // Blob resources.
        let hashes: Vec<Sha1Hash> = self.blobs.get_mut().iter().map(|b| b.hash).collect();
        let mut new_specs: HashMap<Sha1Hash, ResourceSpec> = HashMap::new();
        for hash in &hashes {
            let (location, size) = {
                let blobs = self.blobs.get_mut();
                let blob = blobs.get(hash).expect("hash listed above");
                (blob.location.clone(), blob.size)
            };

            let spec = match &location {
                BlobLocation::Archive {
                    pool: src_pool,
                    spec,
                    codec,
                } => {
                    if reuse.is_some_and(|reuse| Arc::ptr_eq(src_pool, reuse)) {
                        // Already stored in this file; append-only means
                        // it stays where it is (the repoint below swaps in
                        // the fresh pool at the same offsets).
                        new_specs.insert(*hash, *spec);
                        continue;
                    }
                    if *codec == self.codec {
                        raw_copy_resource(&mut out, src_pool, spec)?
                    } else {
                        let src = src_pool.acquire()?;
                        let compressor = Compressor::new(*codec);
                        let mut writer =
                            ResourceWriter::begin(&mut out, parallel.as_ref(), size);
                        resource::read_chunks(&*src, spec, &compressor, |chunk| {
                            writer.feed(chunk)
                        })?;
                        finish_blob(writer, *hash)?
                    }
                }
                BlobLocation::Buffer(data) => {
                    let mut writer = ResourceWriter::begin(&mut out, parallel.as_ref(), size);
                    writer.feed(data)?;
                    finish_blob(writer, *hash)?
                }
                BlobLocation::Source {
                    source,
                    path: src_path,
                    stream,
                } => {
                    let reader = source.open_stream(src_path, stream.as_deref())?;
                    let mut reader = reader.take(size);
                    let mut writer = ResourceWriter::begin(&mut out, parallel.as_ref(), size);
                    let mut buf = vec![0u8; 64 * 1024];
                    let mut total = 0u64;
                    loop {
                        let n = reader.read(&mut buf).context(crate::errors::ReadSnafu {
                            offset: total,
                            len: buf.len() as u64,
                        })?;
                        if n == 0 {
                            break;
                        }
                        writer.feed(&buf[..n])?;
                        total += n as u64;
                    }
                    if total != size {
                        // The source shrank since capture; the hash can no
                        // longer match.
                        return ResourceHashSnafu {
                            expected: *hash,
                            actual: Sha1Hash::ZERO,
                        }
                        .fail()
                        .map_err(Into::into);
                    }
                    finish_blob(writer, *hash)?
                }
            };
            new_specs.insert(*hash, spec);
        }

        // Metadata resources, one per image, in image order.
        let mut metadata_entries: Vec<(ResourceSpec, Sha1Hash)> = Vec::new();
        for image in &self.images {
            let bytes = metadata::write(image);
            let mut writer = ResourceWriter::begin(&mut out, parallel.as_ref(), bytes.len() as u64);
            writer.feed(&bytes)?;
            let (mut spec, hash) = writer.end()?;
            spec.flags |= ResourceFlags::METADATA;
            metadata_entries.push((spec, hash));
        }

        // Repoint blobs at their new homes before serializing the table.
        let new_pool = Arc::new(FilePool::new(path));
        {
            let blobs = self.blobs.get_mut();
            for hash in &hashes {
                if let Some(spec) = new_specs.get(hash) {
                    blobs.get_mut(hash).expect("still present").location = BlobLocation::Archive {
                        pool: Arc::clone(&new_pool),
                        spec: *spec,
                        codec: self.codec,
                    };
                }
            }
        }

        let table_bytes = self.blobs.get_mut().to_bytes(&metadata_entries, 1);
        let table_at = out.position();
        put(&mut out, &table_bytes)?;
        let blob_table_spec = ResourceSpec {
            offset: table_at,
            size: table_bytes.len() as u64,
            original_size: table_bytes.len() as u64,
            flags: ResourceFlags::empty(),
        };

        let xml_at = out.position();
        put(&mut out, self.xml.as_bytes())?;
        let xml_spec = ResourceSpec {
            offset: xml_at,
            size: self.xml.as_bytes().len() as u64,
            original_size: self.xml.as_bytes().len() as u64,
            flags: ResourceFlags::empty(),
        };

        let integrity_end = table_at + table_bytes.len() as u64;
        let integrity_spec = if options.check_integrity {
            let table = crate::integrity::compute(raf, integrity_end)?;
            let at = out.position();
            put(&mut out, &table)?;
            Some(ResourceSpec {
                offset: at,
                size: table.len() as u64,
                original_size: table.len() as u64,
                flags: ResourceFlags::empty(),
            })
        } else {
            None
        };

        let boot_metadata = match self.boot_index {
            0 => None,
            index => metadata_entries.get(index as usize - 1).map(|(s, _)| *s),
        };
        let header = self.build_header(
            Some(&blob_table_spec),
            Some(&xml_spec),
            integrity_spec.as_ref(),
            boot_metadata.as_ref(),
            false,
        );
        out.patch(header.as_bytes(), 0)
            .context(WriteSnafu { offset: 0u64 })?;
        out.flush().context(WriteSnafu { offset: 0u64 })?;

        self.pool = Some(new_pool);
        self.data_end = table_at;
        self.integrity_end = integrity_end;
        self.integrity_spec = integrity_spec;
        Ok(())
    }

    fn build_header(
        &self,
        blob_table: Option<&ResourceSpec>,
        xml: Option<&ResourceSpec>,
        integrity: Option<&ResourceSpec>,
        boot_metadata: Option<&ResourceSpec>,
        in_progress: bool,
    ) -> HeaderDisk {
        let entry = |spec: Option<&ResourceSpec>| {
            spec.map(ResourceSpec::to_disk)
                .unwrap_or_else(ResourceEntryDisk::zeroed)
        };
        let mut flags = self.codec.header_flags();
        if in_progress {
            flags |= HeaderFlags::WRITE_IN_PROGRESS;
        }

        HeaderDisk {
            magic: MAGIC,
            header_size: HEADER_SIZE.into(),
            version: VERSION.into(),
            flags: flags.bits().into(),
            chunk_size: CHUNK_SIZE.into(),
            guid: self.guid,
            part_number: 1u16.into(),
            total_parts: 1u16.into(),
            image_count: (self.images.len() as u32).into(),
            blob_table: entry(blob_table),
            xml_data: entry(xml),
            boot_metadata: entry(boot_metadata),
            boot_index: self.boot_index.into(),
            integrity: entry(integrity),
            unused: [0; 60],
        }
    }

    /// Check the whole-file integrity table, if the archive carries one.
    /// `Ok(false)` means there was none to check.
    pub fn verify_integrity(&self) -> Result<bool> {
        let (Some(pool), Some(spec)) = (&self.pool, &self.integrity_spec) else {
            return Ok(false);
        };
        let file = pool.acquire()?;
        let table = resource::read_full(&*file, spec, &Compressor::new(self.codec))?;
        crate::integrity::verify(&*file, &table, self.integrity_end)?;
        Ok(true)
    }
}

impl std::fmt::Debug for Wim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wim")
            .field("codec", &self.codec)
            .field("images", &self.images.len())
            .field("blobs", &self.blobs.lock().len())
            .field("boot_index", &self.boot_index)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Copy a resource verbatim between archives with the same codec; the
/// stored bytes, chunk table included, transfer bit-for-bit.
fn raw_copy_resource(
    out: &mut Positioned<&RandomAccessFile>,
    src_pool: &Arc<FilePool>,
    spec: &ResourceSpec,
) -> Result<ResourceSpec> {
    let src = src_pool.acquire()?;
    let new_offset = out.position();
    let mut buf = vec![0u8; 1 << 20];
    let mut pos = spec.offset;
    let mut remaining = spec.size;
    while remaining > 0 {
        let take = remaining.min(buf.len() as u64) as usize;
        read_exact_at(&*src, pos, &mut buf[..take])?;
        put(out, &buf[..take])?;
        pos += take as u64;
        remaining -= take as u64;
    }
    Ok(ResourceSpec {
        offset: new_offset,
        ..*spec
    })
}

fn finish_blob(
    writer: ResourceWriter<'_, &RandomAccessFile>,
    expected: Sha1Hash,
) -> Result<ResourceSpec> {
    let (spec, actual) = writer.end()?;
    if actual != expected {
        return ResourceHashSnafu { expected, actual }.fail().map_err(Into::into);
    }
    Ok(spec)
}

fn put(out: &mut Positioned<&RandomAccessFile>, bytes: &[u8]) -> Result<()> {
    let at = out.position();
    out.write_all(bytes).context(WriteSnafu { offset: at })?;
    Ok(())
}

/// Stored refcounts are advisory; the truth is the number of stream
/// references. Disagreement gets fixed with a warning, as archives in the
/// wild frequently miscount.
fn reconcile_refcounts(blobs: &mut BlobTable, images: &[Image], logger: &Logger) {
    let mut counts: HashMap<Sha1Hash, u32> = HashMap::new();
    for image in images {
        for hash in image.stream_references() {
            *counts.entry(hash).or_insert(0) += 1;
        }
    }
    let hashes: Vec<Sha1Hash> = blobs.iter().map(|b| b.hash).collect();
    for hash in hashes {
        let expected = counts.get(&hash).copied().unwrap_or(0);
        let blob = blobs.get_mut(&hash).expect("listed above");
        if blob.refcnt != expected {
            slog::warn!(logger, "Fixing blob reference count";
                "hash" => %hash, "stored" => blob.refcnt, "actual" => expected);
            blob.refcnt = expected;
        }
    }
}

fn generate_guid() -> [u8; 16] {
    use std::time::{SystemTime, UNIX_EPOCH};
    let mut hasher = Hasher::new();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    let digest = hasher.finish();
    digest.0[..16].try_into().expect("sha1 is 20 bytes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DirectorySource;
    use zerocopy::FromBytes;

    fn capture_to_file(
        codec: Kind,
        content: &[u8],
        dir: &Path,
        wim_path: &Path,
    ) -> (Wim, Sha1Hash) {
        std::fs::write(dir.join("file.bin"), content).unwrap();
        let mut wim = Wim::create(codec);
        wim.capture_image(
            Arc::new(DirectorySource::new()),
            dir,
            &CaptureConfig::new(),
            &CaptureOptions::default(),
            None,
        )
        .unwrap();
        wim.write(wim_path, &WriteOptions::default()).unwrap();
        (wim, Sha1Hash::of(content))
    }

    #[test]
    fn corrupt_chunk_body_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        let wim_path = dir.path().join("test.wim");

        let content: Vec<u8> = b"very compressible line of text\n"
            .iter()
            .copied()
            .cycle()
            .take(10 * 1024)
            .collect();
        let (wim, hash) = capture_to_file(Kind::Lzx, &content, &src, &wim_path);

        // Flip one byte inside the blob's compressed chunk body.
        let blob = wim.blob(&hash).unwrap();
        let BlobLocation::Archive { spec, .. } = blob.location else {
            panic!("blob should live in the written archive");
        };
        assert!(spec.is_compressed());
        drop(wim);

        let mut bytes = std::fs::read(&wim_path).unwrap();
        let at = (spec.offset + spec.chunk_table_size() + 3) as usize;
        bytes[at] ^= 0x40;
        std::fs::write(&wim_path, &bytes).unwrap();

        let wim = Wim::open(&wim_path).unwrap();
        let err = wim.read_blob(&hash).unwrap_err();
        // Either the codec notices or the final hash check does; both are
        // acceptable detections.
        assert!(matches!(
            err.kind(),
            crate::ErrorKind::DecompressionFailed | crate::ErrorKind::InvalidResourceHash
        ));
    }

    #[test]
    fn fuzzed_stream_hash_fails_metadata_load() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        let wim_path = dir.path().join("test.wim");

        // Uncompressed archive, so the metadata bytes sit raw on disk.
        let (wim, hash) = capture_to_file(Kind::None, b"hello", &src, &wim_path);
        drop(wim);

        let mut bytes = std::fs::read(&wim_path).unwrap();
        let header = HeaderDisk::read_from_bytes(&bytes[..HeaderDisk::SIZE]).unwrap();
        let table_off = header.blob_table.offset_raw() as usize;
        let table_len = header.blob_table.size() as usize;

        // Find the metadata entry in the blob table.
        let mut metadata_entry = None;
        for at in (table_off..table_off + table_len).step_by(50) {
            let entry =
                repr::resource::BlobTableEntryDisk::read_from_bytes(&bytes[at..at + 50]).unwrap();
            if entry
                .resource
                .flags()
                .contains(ResourceFlags::METADATA)
            {
                metadata_entry = Some((at, entry));
            }
        }
        let (entry_at, entry) = metadata_entry.expect("one metadata resource");
        let meta_off = entry.resource.offset_raw() as usize;
        let meta_len = entry.resource.size() as usize;

        // Fuzz the stream's SHA-1 inside the metadata, then re-hash the
        // metadata resource so only the dangling reference is wrong.
        let metadata = &mut bytes[meta_off..meta_off + meta_len];
        let pos = metadata
            .windows(20)
            .position(|window| window == hash.as_bytes())
            .expect("stream hash present in metadata");
        metadata[pos] ^= 0xff;
        let new_hash = Sha1Hash::of(&bytes[meta_off..meta_off + meta_len]);
        bytes[entry_at + 30..entry_at + 50].copy_from_slice(new_hash.as_bytes());
        std::fs::write(&wim_path, &bytes).unwrap();

        let err = Wim::open(&wim_path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidMetadata);
    }

    #[test]
    fn truncated_header_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wim");
        std::fs::write(&path, b"MSWIM\0\0\0 but nothing else").unwrap();
        let err = Wim::open(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Read);
    }

    #[test]
    fn wrong_magic_is_invalid_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wim");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let err = Wim::open(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidHeader);
    }
}
