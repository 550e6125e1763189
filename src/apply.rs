//! The apply pipeline: materialize an image onto a target file system.
//!
//! Two phases. Phase one builds the whole file structure: directories in
//! preorder, then files, hard-link aliases, attributes, timestamps,
//! security, short names, and empty named streams. Phase two walks blobs
//! in ascending archive offset, decompressing each blob exactly once and
//! fanning its bytes out to every stream that references it. The second
//! phase is where the I/O lives, and the one-decompression guarantee is
//! the pipeline's central performance property.

use slog::Logger;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use repr::{FileAttributes, REPARSE_POINT_MAX_SIZE};

use crate::blob::{BlobLocation, BlobTable};
use crate::errors::{
    BadReparseDataSnafu, CancelledSnafu, MetadataError, ResourceHashSnafu, Result,
    UnsupportedFeatureSnafu, WriteSnafu,
};
use crate::hash::{Hasher, Sha1Hash};
use crate::resource;
use crate::security::sd_fixup;
use crate::tree::{Image, InodeId};

bitflags! {
    /// What an apply target can represent. Features present in the image
    /// but missing here are dropped with a warning, or fail the apply in
    /// strict mode.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TargetFeatures: u32 {
        const NAMED_STREAMS         = 1 << 0;
        const SHORT_NAMES           = 1 << 1;
        const REPARSE_POINTS        = 1 << 2;
        const SECURITY              = 1 << 3;
        const CASE_SENSITIVE_NAMES  = 1 << 4;
        const TIMESTAMPS            = 1 << 5;
        const HARD_LINKS            = 1 << 6;
        const COMPRESSED_ATTR       = 1 << 7;
        const HIDDEN_SYSTEM_ARCHIVE = 1 << 8;
    }
}

/// A file system the apply pipeline can populate.
pub trait ApplyTarget {
    /// Handle to a created file or directory.
    type Ref: Clone;
    type StreamWriter: Write;

    fn supported_features(&self) -> TargetFeatures;
    fn root(&mut self) -> Result<Self::Ref>;
    fn create_dir(&mut self, parent: &Self::Ref, name: &str) -> Result<Self::Ref>;
    fn create_file(
        &mut self,
        parent: &Self::Ref,
        name: &str,
        attributes: FileAttributes,
    ) -> Result<Self::Ref>;
    fn add_link(&mut self, file: &Self::Ref, parent: &Self::Ref, name: &str) -> Result<()>;
    fn set_times(&mut self, file: &Self::Ref, creation: u64, access: u64, write: u64)
        -> Result<()>;
    fn set_attributes(&mut self, file: &Self::Ref, attributes: FileAttributes) -> Result<()>;
    fn set_security(&mut self, file: &Self::Ref, descriptor: &[u8]) -> Result<()>;
    fn set_short_name(&mut self, file: &Self::Ref, parent: &Self::Ref, name: &str) -> Result<()>;
    /// Open a data stream for writing; `None` is the unnamed stream.
    fn open_stream(&mut self, file: &Self::Ref, stream: Option<&str>)
        -> Result<Self::StreamWriter>;
    fn write_reparse(&mut self, file: &Self::Ref, tag: u32, data: &[u8]) -> Result<()>;
}

/// Cooperative cancellation. Cancelling finishes the in-flight chunk
/// (codecs are not reentrant), then the apply returns `Cancelled`; partial
/// output is left for the caller to clean up.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Fail instead of dropping features the target cannot represent.
    pub strict: bool,
    pub cancel: Option<CancelFlag>,
}

/// One stream destination for the blob phase.
enum Destination<R> {
    Stream { file: R, name: Option<String> },
    Reparse { file: R, tag: u32 },
}

pub(crate) fn apply_image<T: ApplyTarget>(
    image: &Image,
    blobs: &BlobTable,
    target: &mut T,
    options: &ApplyOptions,
    logger: &Logger,
) -> Result<()> {
    let features = target.supported_features();
    negotiate(image, features, options.strict, logger)?;

    // Phase 1: the whole file structure, before any content.
    let mut by_blob: HashMap<Sha1Hash, Vec<Destination<T::Ref>>> = HashMap::new();
    build_structure(image, target, features, &mut by_blob, logger)?;

    // Phase 2: blobs, in ascending archive offset for sequential I/O.
    let mut order: Vec<&Sha1Hash> = by_blob.keys().collect();
    order.sort_by_key(|hash| {
        blobs
            .get(hash)
            .and_then(|b| b.archive_offset())
            .unwrap_or(u64::MAX)
    });
    let order: Vec<Sha1Hash> = order.into_iter().copied().collect();

    for hash in order {
        if let Some(cancel) = &options.cancel {
            if cancel.is_cancelled() {
                return CancelledSnafu.fail().map_err(Into::into);
            }
        }
        let destinations = by_blob.remove(&hash).unwrap();
        extract_blob(blobs, hash, destinations, target, options)?;
    }
    Ok(())
}

fn negotiate(
    image: &Image,
    features: TargetFeatures,
    strict: bool,
    logger: &Logger,
) -> Result<()> {
    let uses_named = image
        .inodes
        .iter()
        .any(|inode| inode.named_streams().next().is_some());
    let uses_short = image.dentries.iter().any(|d| d.short_name.is_some());
    let uses_reparse = image.inodes.iter().any(|inode| inode.reparse.is_some());
    let uses_security = image.inodes.iter().any(|inode| inode.security_id.is_some());
    let uses_links = image
        .inodes
        .iter()
        .any(|inode| !inode.is_directory() && inode.link_count() > 1);

    let required: [(bool, TargetFeatures, &'static str); 5] = [
        (uses_named, TargetFeatures::NAMED_STREAMS, "named data streams"),
        (uses_short, TargetFeatures::SHORT_NAMES, "short names"),
        (uses_reparse, TargetFeatures::REPARSE_POINTS, "reparse points"),
        (uses_security, TargetFeatures::SECURITY, "security descriptors"),
        (uses_links, TargetFeatures::HARD_LINKS, "hard links"),
    ];
    for (used, feature, name) in required {
        if used && !features.contains(feature) {
            if strict {
                return UnsupportedFeatureSnafu { feature: name }
                    .fail()
                    .map_err(Into::into);
            }
            slog::warn!(logger, "Target cannot represent a feature; dropping";
                "feature" => name);
        }
    }
    Ok(())
}

fn build_structure<T: ApplyTarget>(
    image: &Image,
    target: &mut T,
    features: TargetFeatures,
    by_blob: &mut HashMap<Sha1Hash, Vec<Destination<T::Ref>>>,
    logger: &Logger,
) -> Result<()> {
    let root_ref = target.root()?;
    let mut refs: HashMap<crate::tree::DentryId, T::Ref> = HashMap::new();
    let mut first_link: HashMap<InodeId, T::Ref> = HashMap::new();

    apply_metadata(image, target, features, image.root(), &root_ref, None)?;
    refs.insert(image.root(), root_ref);

    for id in image.preorder() {
        if id == image.root() {
            continue;
        }
        let dentry = image.dentry(id);
        let inode = image.inode(dentry.inode);
        let parent_ref = refs[&dentry.parent.expect("non-root has a parent")].clone();

        if inode.is_directory() {
            let dir_ref = target.create_dir(&parent_ref, &dentry.name)?;
            apply_metadata(image, target, features, id, &dir_ref, Some(&parent_ref))?;
            refs.insert(id, dir_ref);
            continue;
        }

        // Alias of an already created inode: link it if the target can,
        // otherwise fall through and duplicate the content.
        if let Some(existing) = first_link.get(&dentry.inode) {
            if features.contains(TargetFeatures::HARD_LINKS) {
                let existing = existing.clone();
                target.add_link(&existing, &parent_ref, &dentry.name)?;
                refs.insert(id, existing);
                continue;
            }
            slog::debug!(logger, "Duplicating content for dropped hard link";
                "name" => &dentry.name);
        }

        let file_ref = target.create_file(&parent_ref, &dentry.name, inode.attributes)?;
        apply_metadata(image, target, features, id, &file_ref, Some(&parent_ref))?;
        first_link.entry(dentry.inode).or_insert_with(|| file_ref.clone());

        register_streams(image, dentry.inode, &file_ref, target, features, by_blob)?;
        refs.insert(id, file_ref);
    }
    Ok(())
}

fn apply_metadata<T: ApplyTarget>(
    image: &Image,
    target: &mut T,
    features: TargetFeatures,
    id: crate::tree::DentryId,
    file_ref: &T::Ref,
    parent_ref: Option<&T::Ref>,
) -> Result<()> {
    let dentry = image.dentry(id);
    let inode = image.inode_of(id);

    let mut attributes = inode.attributes;
    if !features.contains(TargetFeatures::HIDDEN_SYSTEM_ARCHIVE) {
        attributes -= FileAttributes::HIDDEN | FileAttributes::SYSTEM | FileAttributes::ARCHIVE;
    }
    if !features.contains(TargetFeatures::COMPRESSED_ATTR) {
        attributes -= FileAttributes::COMPRESSED;
    }
    target.set_attributes(file_ref, attributes)?;

    if features.contains(TargetFeatures::SECURITY) {
        if let Some(id) = inode.security_id {
            if let Some(descriptor) = image.security.get(id) {
                target.set_security(file_ref, &sd_fixup(descriptor))?;
            }
        }
    }

    if features.contains(TargetFeatures::SHORT_NAMES) {
        if let (Some(short), Some(parent_ref)) = (&dentry.short_name, parent_ref) {
            target.set_short_name(file_ref, parent_ref, short)?;
        }
    }

    if features.contains(TargetFeatures::TIMESTAMPS) {
        target.set_times(
            file_ref,
            inode.creation_time,
            inode.last_access_time,
            inode.last_write_time,
        )?;
    }
    Ok(())
}

fn register_streams<T: ApplyTarget>(
    image: &Image,
    inode_id: InodeId,
    file_ref: &T::Ref,
    target: &mut T,
    features: TargetFeatures,
    by_blob: &mut HashMap<Sha1Hash, Vec<Destination<T::Ref>>>,
) -> Result<()> {
    let inode = image.inode(inode_id);
    for stream in &inode.streams {
        if stream.name.is_some() && !features.contains(TargetFeatures::NAMED_STREAMS) {
            continue;
        }
        if inode.reparse.is_some() && stream.is_unnamed() {
            if !features.contains(TargetFeatures::REPARSE_POINTS) {
                continue;
            }
            let tag = inode.reparse.expect("checked").tag;
            match stream.hash {
                Some(hash) => by_blob.entry(hash).or_default().push(Destination::Reparse {
                    file: file_ref.clone(),
                    tag,
                }),
                None => {
                    return BadReparseDataSnafu {
                        reason: "reparse point with no data stream".to_string(),
                    }
                    .fail()
                    .map_err(Into::into)
                }
            }
            continue;
        }

        match stream.hash {
            Some(hash) => by_blob.entry(hash).or_default().push(Destination::Stream {
                file: file_ref.clone(),
                name: stream.name.clone(),
            }),
            // Empty streams never reach the blob phase; create them now.
            None => {
                if stream.name.is_some() {
                    drop(target.open_stream(file_ref, stream.name.as_deref())?);
                }
            }
        }
    }
    Ok(())
}

/// Open every destination of one blob, stream its chunks to all of them,
/// and verify the content hash at the end. Any failure aborts the whole
/// blob; writers are dropped (closed) on the way out.
fn extract_blob<T: ApplyTarget>(
    blobs: &BlobTable,
    hash: Sha1Hash,
    destinations: Vec<Destination<T::Ref>>,
    target: &mut T,
    options: &ApplyOptions,
) -> Result<()> {
    let blob = blobs
        .get(&hash)
        .ok_or_else(|| crate::errors::Error::from(MetadataError::UnresolvedStream { hash }))?;

    enum Sink<W> {
        Stream { writer: W, written: u64 },
        Reparse { buf: Vec<u8>, tag: u32 },
    }
    let mut reparse_refs: Vec<T::Ref> = Vec::new();
    let mut sinks: Vec<Sink<T::StreamWriter>> = Vec::new();
    for destination in &destinations {
        match destination {
            Destination::Stream { file, name } => sinks.push(Sink::Stream {
                writer: target.open_stream(file, name.as_deref())?,
                written: 0,
            }),
            Destination::Reparse { file, tag } => {
                reparse_refs.push(file.clone());
                sinks.push(Sink::Reparse {
                    buf: Vec::new(),
                    tag: *tag,
                });
            }
        }
    }

    let cancel = options.cancel.clone();
    let mut deliver = |chunk: &[u8]| -> Result<()> {
        if let Some(cancel) = &cancel {
            if cancel.is_cancelled() {
                return CancelledSnafu.fail().map_err(Into::into);
            }
        }
        for sink in &mut sinks {
            match sink {
                Sink::Stream { writer, written } => {
                    use snafu::ResultExt;
                    writer
                        .write_all(chunk)
                        .context(WriteSnafu { offset: *written })?;
                    *written += chunk.len() as u64;
                }
                Sink::Reparse { buf, .. } => {
                    if buf.len() + chunk.len() > REPARSE_POINT_MAX_SIZE {
                        return BadReparseDataSnafu {
                            reason: "reparse data exceeds the format maximum".to_string(),
                        }
                        .fail()
                        .map_err(Into::into);
                    }
                    buf.extend_from_slice(chunk);
                }
            }
        }
        Ok(())
    };

    let actual = match &blob.location {
        BlobLocation::Archive { pool, spec, codec } => {
            let file = pool.acquire()?;
            let compressor = crate::compression::Compressor::new(*codec);
            resource::read_chunks(&*file, spec, &compressor, &mut deliver)?
        }
        BlobLocation::Buffer(data) => {
            let mut hasher = Hasher::new();
            for chunk in data.chunks(crate::compression::CHUNK_SIZE) {
                hasher.update(chunk);
                deliver(chunk)?;
            }
            hasher.finish()
        }
        BlobLocation::Source {
            source,
            path,
            stream,
        } => {
            let mut reader = source.open_stream(path, stream.as_deref())?;
            let mut hasher = Hasher::new();
            let mut buf = vec![0u8; crate::compression::CHUNK_SIZE];
            loop {
                use snafu::ResultExt;
                let n = std::io::Read::read(&mut reader, &mut buf)
                    .context(crate::errors::ReadSnafu {
                        offset: 0u64,
                        len: buf.len() as u64,
                    })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                deliver(&buf[..n])?;
            }
            hasher.finish()
        }
    };

    // A hash mismatch always fails the blob, whatever the codec said.
    if actual != hash {
        return ResourceHashSnafu {
            expected: hash,
            actual,
        }
        .fail()
        .map_err(Into::into);
    }

    let mut reparse_refs = reparse_refs.into_iter();
    for sink in sinks {
        if let Sink::Reparse { buf, tag } = sink {
            let file = reparse_refs.next().expect("one ref per reparse sink");
            target.write_reparse(&file, tag, &buf)?;
        }
    }
    Ok(())
}

/// Applies onto a plain directory through `std::fs`. Hard links and
/// timestamps are honored; named streams, short names, and security are
/// negotiated away. Symlink reparse points become real symlinks on Unix.
pub struct DirectoryTarget {
    root: std::path::PathBuf,
}

impl DirectoryTarget {
    pub fn new<P: Into<std::path::PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl ApplyTarget for DirectoryTarget {
    type Ref = std::path::PathBuf;
    type StreamWriter = std::fs::File;

    fn supported_features(&self) -> TargetFeatures {
        let mut features = TargetFeatures::TIMESTAMPS
            | TargetFeatures::HARD_LINKS
            | TargetFeatures::CASE_SENSITIVE_NAMES;
        if cfg!(unix) {
            features |= TargetFeatures::REPARSE_POINTS;
        }
        features
    }

    fn root(&mut self) -> Result<Self::Ref> {
        use snafu::ResultExt;
        std::fs::create_dir_all(&self.root).context(crate::errors::OpenSnafu {
            path: self.root.clone(),
        })?;
        Ok(self.root.clone())
    }

    fn create_dir(&mut self, parent: &Self::Ref, name: &str) -> Result<Self::Ref> {
        use snafu::ResultExt;
        let path = parent.join(name);
        std::fs::create_dir(&path).context(crate::errors::OpenSnafu { path: path.clone() })?;
        Ok(path)
    }

    fn create_file(
        &mut self,
        parent: &Self::Ref,
        name: &str,
        _attributes: FileAttributes,
    ) -> Result<Self::Ref> {
        use snafu::ResultExt;
        let path = parent.join(name);
        std::fs::File::create(&path).context(crate::errors::OpenSnafu { path: path.clone() })?;
        Ok(path)
    }

    fn add_link(&mut self, file: &Self::Ref, parent: &Self::Ref, name: &str) -> Result<()> {
        use snafu::ResultExt;
        let path = parent.join(name);
        std::fs::hard_link(file, &path).context(crate::errors::OpenSnafu { path })?;
        Ok(())
    }

    fn set_times(
        &mut self,
        file: &Self::Ref,
        _creation: u64,
        access: u64,
        write: u64,
    ) -> Result<()> {
        use snafu::ResultExt;
        // Symlinks carry their own times; following one here would touch
        // the (possibly still absent) destination.
        if file.is_symlink() {
            return Ok(());
        }
        let times = std::fs::FileTimes::new()
            .set_accessed(crate::times::filetime_to_system_time(access))
            .set_modified(crate::times::filetime_to_system_time(write));
        let handle = std::fs::File::open(file).context(crate::errors::OpenSnafu {
            path: file.clone(),
        })?;
        handle.set_times(times).context(crate::errors::OpenSnafu {
            path: file.clone(),
        })?;
        Ok(())
    }

    fn set_attributes(&mut self, file: &Self::Ref, attributes: FileAttributes) -> Result<()> {
        use snafu::ResultExt;
        if attributes.contains(FileAttributes::READONLY) && !file.is_symlink() {
            let md = std::fs::metadata(file).context(crate::errors::OpenSnafu {
                path: file.clone(),
            })?;
            let mut perms = md.permissions();
            perms.set_readonly(true);
            std::fs::set_permissions(file, perms).context(crate::errors::OpenSnafu {
                path: file.clone(),
            })?;
        }
        Ok(())
    }

    fn set_security(&mut self, _file: &Self::Ref, _descriptor: &[u8]) -> Result<()> {
        Ok(())
    }

    fn set_short_name(&mut self, _file: &Self::Ref, _parent: &Self::Ref, _name: &str) -> Result<()> {
        Ok(())
    }

    fn open_stream(
        &mut self,
        file: &Self::Ref,
        stream: Option<&str>,
    ) -> Result<Self::StreamWriter> {
        use snafu::ResultExt;
        debug_assert!(stream.is_none(), "named streams are negotiated away");
        std::fs::File::create(file)
            .context(crate::errors::OpenSnafu { path: file.clone() })
            .map_err(Into::into)
    }

    fn write_reparse(&mut self, file: &Self::Ref, tag: u32, data: &[u8]) -> Result<()> {
        if tag != repr::IO_REPARSE_TAG_SYMLINK {
            return BadReparseDataSnafu {
                reason: format!("reparse tag {:#x} has no directory representation", tag),
            }
            .fail()
            .map_err(Into::into);
        }
        let target = crate::capture::decode_symlink_reparse(data)?;
        #[cfg(unix)]
        {
            use snafu::ResultExt;
            let _ = std::fs::remove_file(file);
            std::os::unix::fs::symlink(&target, file)
                .context(crate::errors::OpenSnafu { path: file.clone() })?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            BadReparseDataSnafu {
                reason: "symlink reparse points need a Unix target".to_string(),
            }
            .fail()
            .map_err(Into::into)
        }
    }
}
