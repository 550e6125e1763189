use sha1::{Digest, Sha1};
use std::fmt;

use repr::HASH_SIZE;

/// A SHA-1 message digest, the key of the blob table.
///
/// The all-zero hash is reserved: streams with no content store it instead
/// of referencing a blob.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha1Hash(pub [u8; HASH_SIZE]);

impl Sha1Hash {
    pub const ZERO: Sha1Hash = Sha1Hash([0; HASH_SIZE]);

    /// Hash `data` in one shot.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finish()
    }

    pub fn is_zero(&self) -> bool {
        *self == Sha1Hash::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({})", hex::encode(self.0))
    }
}

impl From<[u8; HASH_SIZE]> for Sha1Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Sha1Hash(bytes)
    }
}

/// Incremental SHA-1, used wherever bytes stream past (capture, resource
/// writes, blob verification).
pub struct Hasher(Sha1);

impl Hasher {
    pub fn new() -> Self {
        Hasher(Sha1::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Sha1Hash {
        Sha1Hash(self.0.finalize().into())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // sha1("abc")
        assert_eq!(
            Sha1Hash::of(b"abc").to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut hasher = Hasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), Sha1Hash::of(b"hello world"));
    }

    #[test]
    fn zero_hash() {
        assert!(Sha1Hash::ZERO.is_zero());
        assert!(!Sha1Hash::of(b"").is_zero());
    }
}
