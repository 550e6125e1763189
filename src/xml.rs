//! The archive's XML data region, carried as an opaque property bag.
//!
//! The region is UTF-16LE XML describing the images; this crate neither
//! parses nor synthesizes it. Whatever was read is written back verbatim,
//! and freshly created archives carry an empty region.

#[derive(Debug, Clone, Default)]
pub struct XmlData {
    raw: Vec<u8>,
}

impl XmlData {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_raw(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}
