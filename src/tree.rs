//! The in-memory model of one image: dentries, inodes, and streams.
//!
//! Dentries and inodes live in arenas owned by the [`Image`] and refer to
//! each other through index ids, so hard links (several dentries, one
//! inode) need no shared ownership. Streams hold at most a blob key; blob
//! descriptors stay owned by the blob table.

use repr::FileAttributes;

use crate::errors::{MetadataError, Result};
use crate::hash::Sha1Hash;
use crate::security::SecurityData;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DentryId(pub(crate) usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InodeId(pub(crate) usize);

/// A data stream: the unnamed default stream (which doubles as the reparse
/// data stream on reparse points) or a named alternate stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    /// `None` names the unnamed stream.
    pub name: Option<String>,
    /// `None` means the stream is empty; empty content is never a blob.
    pub hash: Option<Sha1Hash>,
}

impl Stream {
    pub fn is_unnamed(&self) -> bool {
        self.name.is_none()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReparseInfo {
    pub tag: u32,
    pub not_rpfixed: bool,
}

/// The identity unit of an image: metadata plus an ordered stream list.
/// Several dentries may share one inode (hard links).
#[derive(Debug, Clone)]
pub struct Inode {
    pub attributes: FileAttributes,
    /// Index into the image's security table.
    pub security_id: Option<u32>,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub reparse: Option<ReparseInfo>,
    pub streams: Vec<Stream>,
    pub(crate) links: Vec<DentryId>,
}

impl Inode {
    pub fn new(attributes: FileAttributes) -> Self {
        Self {
            attributes,
            security_id: None,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
            reparse: None,
            streams: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.is_directory()
    }

    pub fn unnamed_stream(&self) -> Option<&Stream> {
        self.streams.iter().find(|s| s.is_unnamed())
    }

    pub fn named_streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter().filter(|s| !s.is_unnamed())
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

/// A name binding an inode into a directory.
#[derive(Debug, Clone)]
pub struct Dentry {
    pub name: String,
    pub short_name: Option<String>,
    pub(crate) parent: Option<DentryId>,
    pub(crate) children: Vec<DentryId>,
    /// The inode this name binds; shared between hard-link aliases.
    pub inode: InodeId,
}

/// One file-system image: a dentry tree, its inodes, and the security
/// table its inodes index into.
#[derive(Debug, Clone)]
pub struct Image {
    pub(crate) dentries: Vec<Dentry>,
    pub(crate) inodes: Vec<Inode>,
    root: DentryId,
    pub security: SecurityData,
    pub name: Option<String>,
}

/// Windows directory semantics: names collide case-insensitively.
pub(crate) fn names_equal_ci(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

impl Image {
    pub fn new() -> Self {
        let mut inodes = Vec::new();
        let mut root_inode = Inode::new(FileAttributes::DIRECTORY);
        root_inode.links.push(DentryId(0));
        inodes.push(root_inode);

        let dentries = vec![Dentry {
            name: String::new(),
            short_name: None,
            parent: None,
            children: Vec::new(),
            inode: InodeId(0),
        }];

        Self {
            dentries,
            inodes,
            root: DentryId(0),
            security: SecurityData::new(),
            name: None,
        }
    }

    pub fn root(&self) -> DentryId {
        self.root
    }

    pub fn dentry(&self, id: DentryId) -> &Dentry {
        &self.dentries[id.0]
    }

    pub(crate) fn dentry_mut(&mut self, id: DentryId) -> &mut Dentry {
        &mut self.dentries[id.0]
    }

    pub fn inode(&self, id: InodeId) -> &Inode {
        &self.inodes[id.0]
    }

    pub(crate) fn inode_mut(&mut self, id: InodeId) -> &mut Inode {
        &mut self.inodes[id.0]
    }

    pub fn inode_of(&self, dentry: DentryId) -> &Inode {
        self.inode(self.dentry(dentry).inode)
    }

    pub fn children(&self, dir: DentryId) -> &[DentryId] {
        &self.dentry(dir).children
    }

    pub(crate) fn add_inode(&mut self, inode: Inode) -> InodeId {
        let id = InodeId(self.inodes.len());
        self.inodes.push(inode);
        id
    }

    /// Bind `inode` into `parent` under `name`. Rejects duplicate names
    /// (case-insensitively, per Windows rules) and nondirectory parents.
    pub(crate) fn add_child(
        &mut self,
        parent: DentryId,
        name: String,
        short_name: Option<String>,
        inode: InodeId,
    ) -> Result<DentryId> {
        debug_assert!(self.inode_of(parent).is_directory());
        for &sibling in &self.dentry(parent).children {
            if names_equal_ci(&self.dentry(sibling).name, &name) {
                return Err(MetadataError::DuplicateName { name }.into());
            }
        }

        let id = DentryId(self.dentries.len());
        self.dentries.push(Dentry {
            name,
            short_name,
            parent: Some(parent),
            children: Vec::new(),
            inode,
        });
        self.dentry_mut(parent).children.push(id);
        self.inode_mut(inode).links.push(id);
        Ok(id)
    }

    pub fn child_by_name(&self, dir: DentryId, name: &str) -> Option<DentryId> {
        self.dentry(dir)
            .children
            .iter()
            .copied()
            .find(|&c| names_equal_ci(&self.dentry(c).name, name))
    }

    /// Look a `/`-separated path up from the root.
    pub fn lookup(&self, path: &str) -> Option<DentryId> {
        let mut at = self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            at = self.child_by_name(at, part)?;
        }
        Some(at)
    }

    /// All dentries in depth-first preorder, root first, children in
    /// directory order.
    pub fn preorder(&self) -> Vec<DentryId> {
        let mut out = Vec::with_capacity(self.dentries.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.dentry(id).children.iter().rev());
        }
        out
    }

    /// One blob key per referencing stream, inode-wise (hard links do not
    /// multiply references). This is what blob refcounts must sum to.
    pub(crate) fn stream_references(&self) -> impl Iterator<Item = Sha1Hash> + '_ {
        self.inodes
            .iter()
            .flat_map(|inode| inode.streams.iter())
            .filter_map(|stream| stream.hash)
    }

    pub fn dentry_count(&self) -> usize {
        self.dentries.len()
    }

    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }
}

impl Default for Image {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_look_up() {
        let mut image = Image::new();
        let root = image.root();

        let dir_inode = image.add_inode(Inode::new(FileAttributes::DIRECTORY));
        let dir = image
            .add_child(root, "Windows".into(), None, dir_inode)
            .unwrap();

        let file_inode = image.add_inode(Inode::new(FileAttributes::NORMAL));
        image
            .add_child(dir, "notepad.exe".into(), Some("NOTEPAD.EXE".into()), file_inode)
            .unwrap();

        assert_eq!(image.lookup("Windows/notepad.exe").unwrap(), DentryId(2));
        assert_eq!(image.lookup("/Windows/"), Some(dir));
        assert!(image.lookup("Windows/missing").is_none());
    }

    #[test]
    fn duplicate_names_collide_case_insensitively() {
        let mut image = Image::new();
        let root = image.root();
        let a = image.add_inode(Inode::new(FileAttributes::NORMAL));
        let b = image.add_inode(Inode::new(FileAttributes::NORMAL));

        image.add_child(root, "File.txt".into(), None, a).unwrap();
        let err = image
            .add_child(root, "file.TXT".into(), None, b)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidMetadata);
    }

    #[test]
    fn hard_links_share_an_inode() {
        let mut image = Image::new();
        let root = image.root();
        let inode = image.add_inode(Inode::new(FileAttributes::NORMAL));
        let x = image.add_child(root, "x".into(), None, inode).unwrap();
        let y = image.add_child(root, "y".into(), None, inode).unwrap();

        assert_eq!(image.dentry(x).inode, image.dentry(y).inode);
        assert_eq!(image.inode(inode).link_count(), 2);
    }

    #[test]
    fn preorder_visits_parents_first() {
        let mut image = Image::new();
        let root = image.root();
        let d1 = image.add_inode(Inode::new(FileAttributes::DIRECTORY));
        let dir = image.add_child(root, "a".into(), None, d1).unwrap();
        let f1 = image.add_inode(Inode::new(FileAttributes::NORMAL));
        image.add_child(dir, "b".into(), None, f1).unwrap();
        let f2 = image.add_inode(Inode::new(FileAttributes::NORMAL));
        image.add_child(root, "c".into(), None, f2).unwrap();

        let order = image.preorder();
        let names: Vec<&str> = order
            .iter()
            .map(|&id| image.dentry(id).name.as_str())
            .collect();
        assert_eq!(names, ["", "a", "b", "c"]);
    }

    #[test]
    fn stream_references_count_per_inode() {
        let mut image = Image::new();
        let root = image.root();
        let inode = image.add_inode(Inode::new(FileAttributes::NORMAL));
        let hash = Sha1Hash::of(b"content");
        image.inode_mut(inode).streams.push(Stream {
            name: None,
            hash: Some(hash),
        });
        image.add_child(root, "x".into(), None, inode).unwrap();
        image.add_child(root, "y".into(), None, inode).unwrap();

        // Two links, one inode: one stream reference.
        assert_eq!(image.stream_references().count(), 1);
    }
}
