use repr::HeaderFlags;
use std::{error, fmt};

pub(crate) mod huffman;
pub(crate) mod lz77;
pub mod lzx;
pub mod xpress;

/// The uncompressed size of one chunk of a compressed resource.
pub const CHUNK_SIZE: usize = repr::CHUNK_SIZE as usize;

/// The compression codec declared by an archive's header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Kind {
    /// Resources are stored uncompressed
    None,
    /// XPRESS: faster, weaker
    Xpress,
    /// LZX: slower, stronger
    #[default]
    Lzx,
}

impl Kind {
    /// Map the header flag word to a codec. `None` means the flag
    /// combination is invalid (compression set but no known codec bit).
    pub fn from_header_flags(flags: HeaderFlags) -> Option<Kind> {
        if !flags.contains(HeaderFlags::COMPRESSION) {
            return Some(Kind::None);
        }
        if flags.contains(HeaderFlags::COMPRESS_LZX) {
            Some(Kind::Lzx)
        } else if flags.contains(HeaderFlags::COMPRESS_XPRESS) {
            Some(Kind::Xpress)
        } else {
            None
        }
    }

    pub fn header_flags(self) -> HeaderFlags {
        match self {
            Kind::None => HeaderFlags::empty(),
            Kind::Xpress => HeaderFlags::COMPRESSION | HeaderFlags::COMPRESS_XPRESS,
            Kind::Lzx => HeaderFlags::COMPRESSION | HeaderFlags::COMPRESS_LZX,
        }
    }

    pub fn from_name(name: &str) -> Option<Kind> {
        match name {
            "none" => Some(Kind::None),
            "xpress" => Some(Kind::Xpress),
            "lzx" => Some(Kind::Lzx),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::None => "none",
            Kind::Xpress => "xpress",
            Kind::Lzx => "lzx",
        }
    }

    pub fn is_compressed(self) -> bool {
        self != Kind::None
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A chunk failed to decode. Carries no detail; the resource layer knows
/// which chunk it fed in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CorruptChunk;

impl fmt::Display for CorruptChunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("corrupt compressed chunk")
    }
}

impl error::Error for CorruptChunk {}

/// A stateless per-chunk compressor/decompressor.
///
/// Both codecs are pure functions over a single chunk of at most
/// [`CHUNK_SIZE`] bytes; nothing carries over between chunks, so one
/// `Compressor` may be shared freely across threads.
#[derive(Debug, Copy, Clone)]
pub struct Compressor {
    kind: Kind,
}

impl Compressor {
    pub fn new(kind: Kind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Compress `src` into `dst`. Returns `false` (and leaves `dst` empty)
    /// when the codec cannot shrink the chunk; the caller then stores the
    /// raw bytes with stored size equal to uncompressed size.
    pub fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> bool {
        debug_assert!(src.len() <= CHUNK_SIZE);
        match self.kind {
            Kind::None => {
                dst.clear();
                false
            }
            Kind::Xpress => xpress::compress(src, dst),
            Kind::Lzx => lzx::compress(src, dst),
        }
    }

    /// Decompress `src` into exactly `dst.len()` bytes.
    ///
    /// Never called for chunks stored verbatim (stored size equal to
    /// uncompressed size); the resource layer copies those directly.
    pub fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<(), CorruptChunk> {
        debug_assert!(dst.len() <= CHUNK_SIZE);
        match self.kind {
            Kind::None => Err(CorruptChunk),
            Kind::Xpress => xpress::decompress(src, dst),
            Kind::Lzx => lzx::decompress(src, dst),
        }
    }
}
