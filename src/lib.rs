//! Read, create, and apply WIM (Windows Imaging) archives.
//!
//! An archive holds one or more file-system images over a single
//! content-addressed blob store: identical byte streams are stored once,
//! keyed by SHA-1, and large streams are compressed in independent 32 KiB
//! chunks (LZX or XPRESS) for random access.
//!
//! The usual flows:
//!
//! * Read: [`Wim::open`] validates the header, loads the blob table and
//!   every image's metadata, and resolves all stream references.
//! * Capture: [`Wim::create`] + [`Wim::capture_image`] walk a
//!   [`capture::CaptureSource`] and dedupe content into the blob table;
//!   [`Wim::write`] then pulls the bytes and emits the archive.
//! * Apply: [`Wim::apply_image`] rebuilds a tree onto an
//!   [`apply::ApplyTarget`], decompressing every blob exactly once.

use slog::Drain;

pub mod apply;
pub mod capture;
pub mod compression;
pub mod config;

mod archive;
mod blob;
mod compress_threads;
pub(crate) mod errors;
mod hash;
mod integrity;
mod metadata;
mod pool;
mod resource;
mod resource_writer;
mod security;
mod shared_position_file;
mod thread;
mod times;
mod tree;
mod xml;

pub use archive::{OpenOptions, Wim, WriteOptions};
pub use blob::{BlobDescriptor, BlobTable};
pub use capture::{CaptureOptions, CaptureSource, DirectorySource, SourceStat, StreamInfo};
pub use apply::{ApplyOptions, ApplyTarget, CancelFlag, DirectoryTarget, TargetFeatures};
pub use compression::Kind as CompressionKind;
pub use config::CaptureConfig;
pub use errors::{Error, ErrorKind, Result};
pub use hash::Sha1Hash;
pub use metadata::DuplicateStreamPolicy;
pub use pool::FilePool;
pub use security::SecurityData;
pub use times::{datetime_to_filetime, filetime_to_datetime};
pub use tree::{Dentry, DentryId, Image, Inode, InodeId, ReparseInfo, Stream};
pub use xml::XmlData;

pub use repr::{FileAttributes, HeaderFlags};

fn default_logger() -> slog::Logger {
    slog::Logger::root(slog_stdlog::StdLog.fuse(), slog::o!())
}
