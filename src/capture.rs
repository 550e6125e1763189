//! The capture pipeline: walk a source tree, build dentries and inodes,
//! and intern every stream's content into the blob table.
//!
//! Content is *hashed* during capture but not copied: new blobs keep a
//! source location so the archive writer can pull the bytes when the
//! archive is written.

use slog::Logger;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use repr::{FileAttributes, IO_REPARSE_TAG_SYMLINK, REPARSE_POINT_MAX_SIZE};

use crate::blob::{BlobDescriptor, BlobLocation, BlobTable};
use crate::config::CaptureConfig;
use crate::errors::{BadReparseDataSnafu, NotADirectorySnafu, OpenSnafu, ReadSnafu, Result};
use crate::hash::{Hasher, Sha1Hash};
use crate::tree::{DentryId, Image, Inode, InodeId, ReparseInfo, Stream};

/// One stream a source entry carries, as reported by `stat`.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// `None` for the unnamed data stream.
    pub name: Option<String>,
    pub size: u64,
}

/// Everything the pipeline needs to know about one source entry.
#[derive(Debug, Clone)]
pub struct SourceStat {
    pub attributes: FileAttributes,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    /// Source inode identity; entries sharing it become hard links.
    pub inode_id: u64,
    pub streams: Vec<StreamInfo>,
}

/// A file-system the capture pipeline can walk. Implementations exist for
/// plain directories here and for richer back-ends out of tree.
pub trait CaptureSource: Send + Sync {
    fn stat(&self, path: &Path) -> Result<SourceStat>;
    fn open_stream(&self, path: &Path, stream: Option<&str>) -> Result<Box<dyn Read + '_>>;
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;
    /// The reparse tag and data of a reparse point.
    fn read_reparse(&self, path: &Path) -> Result<(u32, Vec<u8>)>;
    fn security_descriptor(&self, path: &Path) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Keep going past per-entry errors, logging them as warnings.
    /// Structural failures (the root itself) stay fatal.
    pub continue_on_errors: bool,
}

pub(crate) fn capture_tree(
    source: &Arc<dyn CaptureSource>,
    root: &Path,
    config: &CaptureConfig,
    options: &CaptureOptions,
    blobs: &mut BlobTable,
    logger: &Logger,
) -> Result<Image> {
    let root_stat = source.stat(root)?;
    if !root_stat.attributes.is_directory() {
        return NotADirectorySnafu { path: root }.fail().map_err(Into::into);
    }

    let mut ctx = Capture {
        source,
        config,
        options,
        blobs,
        logger,
        image: Image::new(),
        inodes_seen: HashMap::new(),
    };

    let root_id = ctx.image.root();
    let root_inode = ctx.image.dentry(root_id).inode;
    ctx.image.inode_mut(root_inode).attributes = root_stat.attributes;
    ctx.fill_times(root_inode, &root_stat);
    ctx.intern_security(root, root_inode)?;
    ctx.capture_children(root, "", root_id)?;

    Ok(ctx.image)
}

struct Capture<'a> {
    source: &'a Arc<dyn CaptureSource>,
    config: &'a CaptureConfig,
    options: &'a CaptureOptions,
    blobs: &'a mut BlobTable,
    logger: &'a Logger,
    image: Image,
    inodes_seen: HashMap<u64, InodeId>,
}

impl Capture<'_> {
    fn capture_children(&mut self, dir: &Path, rel: &str, parent: DentryId) -> Result<()> {
        let names = match self.source.list_dir(dir) {
            Ok(names) => names,
            Err(err) if self.options.continue_on_errors => {
                slog::warn!(self.logger, "Skipping unreadable directory";
                    "path" => %dir.display(), "error" => %err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        for name in names {
            let path = dir.join(&name);
            let rel_child = format!("{}/{}", rel, name);
            if self.config.is_excluded(&rel_child) {
                slog::info!(self.logger, "Excluding"; "path" => &rel_child);
                continue;
            }
            match self.capture_entry(&path, &rel_child, name, parent) {
                Ok(()) => {}
                Err(err) if self.options.continue_on_errors => {
                    slog::warn!(self.logger, "Skipping entry";
                        "path" => &rel_child, "error" => %err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn capture_entry(
        &mut self,
        path: &Path,
        rel: &str,
        name: String,
        parent: DentryId,
    ) -> Result<()> {
        let stat = self.source.stat(path)?;
        let is_directory = stat.attributes.is_directory();

        // A previously seen source inode means a hard link: alias it.
        if !is_directory {
            if let Some(&existing) = self.inodes_seen.get(&stat.inode_id) {
                self.image.add_child(parent, name, None, existing)?;
                return Ok(());
            }
        }

        let inode_id = self.image.add_inode(Inode::new(stat.attributes));
        self.fill_times(inode_id, &stat);
        self.intern_security(path, inode_id)?;

        if stat.attributes.is_reparse_point() {
            self.capture_reparse(path, inode_id)?;
        } else if !is_directory {
            for stream in &stat.streams {
                let captured = self.capture_stream(path, stream)?;
                self.image.inode_mut(inode_id).streams.push(captured);
            }
            self.inodes_seen.insert(stat.inode_id, inode_id);
        }

        let dentry = self.image.add_child(parent, name, None, inode_id)?;
        if is_directory {
            self.capture_children(path, rel, dentry)?;
        }
        Ok(())
    }

    /// Hash a stream's bytes and intern them; the blob remembers where to
    /// pull the bytes from at write time.
    fn capture_stream(&mut self, path: &Path, info: &StreamInfo) -> Result<Stream> {
        if info.size == 0 {
            // Empty content is never a blob.
            return Ok(Stream {
                name: info.name.clone(),
                hash: None,
            });
        }

        use snafu::ResultExt;
        let mut reader = self.source.open_stream(path, info.name.as_deref())?;
        let mut hasher = Hasher::new();
        let mut buf = vec![0u8; 32 * 1024];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf).context(ReadSnafu {
                offset: size,
                len: buf.len() as u64,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        let hash = hasher.finish();

        let source = Arc::clone(self.source);
        let path = path.to_path_buf();
        let stream_name = info.name.clone();
        self.blobs.insert_or_intern(hash, || BlobDescriptor {
            hash,
            size,
            refcnt: 1,
            part_number: 1,
            location: BlobLocation::Source {
                source,
                path,
                stream: stream_name,
            },
        });

        Ok(Stream {
            name: info.name.clone(),
            hash: Some(hash),
        })
    }

    fn capture_reparse(&mut self, path: &Path, inode_id: InodeId) -> Result<()> {
        let (tag, data) = self.source.read_reparse(path)?;
        if data.is_empty() || data.len() + 8 > REPARSE_POINT_MAX_SIZE {
            return BadReparseDataSnafu {
                reason: format!("{} bytes of reparse data", data.len()),
            }
            .fail()
            .map_err(Into::into);
        }

        let hash = Sha1Hash::of(&data);
        let size = data.len() as u64;
        let data = Arc::new(data);
        self.blobs.insert_or_intern(hash, || BlobDescriptor {
            hash,
            size,
            refcnt: 1,
            part_number: 1,
            location: BlobLocation::Buffer(data),
        });

        let inode = self.image.inode_mut(inode_id);
        inode.reparse = Some(ReparseInfo {
            tag,
            not_rpfixed: true,
        });
        inode.streams.push(Stream {
            name: None,
            hash: Some(hash),
        });
        Ok(())
    }

    fn fill_times(&mut self, inode_id: InodeId, stat: &SourceStat) {
        let inode = self.image.inode_mut(inode_id);
        inode.creation_time = stat.creation_time;
        inode.last_access_time = stat.last_access_time;
        inode.last_write_time = stat.last_write_time;
    }

    fn intern_security(&mut self, path: &Path, inode_id: InodeId) -> Result<()> {
        if let Some(descriptor) = self.source.security_descriptor(path)? {
            let id = self.image.security.intern(&descriptor);
            self.image.inode_mut(inode_id).security_id = Some(id);
        }
        Ok(())
    }
}

/// The symlink reparse buffer layout: substitute and print name ranges
/// over one UTF-16 path buffer, then a flags word.
pub(crate) fn encode_symlink_reparse(target: &str) -> Vec<u8> {
    let units: Vec<u8> = target
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();
    let len = units.len() as u16;
    let mut out = Vec::with_capacity(12 + units.len());
    out.extend_from_slice(&0u16.to_le_bytes()); // substitute name offset
    out.extend_from_slice(&len.to_le_bytes()); // substitute name length
    out.extend_from_slice(&0u16.to_le_bytes()); // print name offset
    out.extend_from_slice(&len.to_le_bytes()); // print name length
    out.extend_from_slice(&1u32.to_le_bytes()); // SYMLINK_FLAG_RELATIVE
    out.extend_from_slice(&units);
    out
}

pub(crate) fn decode_symlink_reparse(data: &[u8]) -> Result<String> {
    let bad = |reason: &str| {
        BadReparseDataSnafu {
            reason: reason.to_string(),
        }
        .fail()
        .map_err(Into::into)
    };
    if data.len() < 12 {
        return bad("symlink reparse buffer truncated");
    }
    let sub_offset = u16::from_le_bytes(data[0..2].try_into().unwrap()) as usize;
    let sub_len = u16::from_le_bytes(data[2..4].try_into().unwrap()) as usize;
    let buffer = &data[12..];
    if sub_offset % 2 != 0 || sub_len % 2 != 0 || sub_offset + sub_len > buffer.len() {
        return bad("substitute name out of range");
    }
    let units: Vec<u16> = buffer[sub_offset..sub_offset + sub_len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes(pair.try_into().unwrap()))
        .collect();
    match String::from_utf16(&units) {
        Ok(target) => Ok(target),
        Err(_) => bad("substitute name is not UTF-16"),
    }
}

/// Captures plain directories through `std::fs`: the generic back-end used
/// on any POSIX-ish file system. No named streams, no security
/// descriptors; symlinks come through as symlink reparse points.
pub struct DirectorySource {
    #[cfg(not(unix))]
    next_id: std::sync::atomic::AtomicU64,
}

impl DirectorySource {
    pub fn new() -> Self {
        Self {
            #[cfg(not(unix))]
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

impl Default for DirectorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for DirectorySource {
    fn stat(&self, path: &Path) -> Result<SourceStat> {
        use snafu::ResultExt;
        let md = std::fs::symlink_metadata(path).context(OpenSnafu { path })?;

        let attributes = if md.file_type().is_symlink() {
            FileAttributes::REPARSE_POINT
        } else if md.is_dir() {
            FileAttributes::DIRECTORY
        } else {
            FileAttributes::NORMAL
        };

        let mtime = md
            .modified()
            .map(crate::times::system_time_to_filetime)
            .unwrap_or(0);
        let ctime = md
            .created()
            .map(crate::times::system_time_to_filetime)
            .unwrap_or(mtime);
        let atime = md
            .accessed()
            .map(crate::times::system_time_to_filetime)
            .unwrap_or(mtime);

        #[cfg(unix)]
        let inode_id = {
            use std::os::unix::fs::MetadataExt;
            (md.dev() << 32) ^ md.ino()
        };
        #[cfg(not(unix))]
        let inode_id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let streams = if md.is_file() {
            vec![StreamInfo {
                name: None,
                size: md.len(),
            }]
        } else {
            Vec::new()
        };

        Ok(SourceStat {
            attributes,
            creation_time: ctime,
            last_access_time: atime,
            last_write_time: mtime,
            inode_id,
            streams,
        })
    }

    fn open_stream(&self, path: &Path, stream: Option<&str>) -> Result<Box<dyn Read + '_>> {
        use snafu::ResultExt;
        debug_assert!(stream.is_none(), "directory sources have no named streams");
        let file = std::fs::File::open(path).context(OpenSnafu { path })?;
        Ok(Box::new(file))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        use snafu::ResultExt;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path).context(OpenSnafu { path })? {
            let entry = entry.context(OpenSnafu { path })?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                // Archive names are UTF-16; a name that is not Unicode
                // cannot be represented. Per-entry error, so a capture
                // with continue_on_errors skips it with a warning.
                Err(raw) => {
                    return crate::errors::UnsupportedSnafu {
                        reason: format!("non-Unicode name {:?}", raw),
                    }
                    .fail()
                    .map_err(Into::into)
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_reparse(&self, path: &Path) -> Result<(u32, Vec<u8>)> {
        use snafu::ResultExt;
        let target = std::fs::read_link(path).context(OpenSnafu { path })?;
        let target = target.to_string_lossy().into_owned();
        Ok((IO_REPARSE_TAG_SYMLINK, encode_symlink_reparse(&target)))
    }

    fn security_descriptor(&self, _path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}
