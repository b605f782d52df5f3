//! The in-memory staging tree of future inodes.
//!
//! Per the design note on back-references, this is implemented as an arena
//! (a `HashMap` indexed by inode number) rather than `Rc<RefCell<_>>` nodes:
//! a child only ever appears in its parent's `children` list (the owning
//! edge), while each node's `parent` field is a plain inode number used
//! solely for path reconstruction — the arena index itself is the
//! non-owning "weak" back edge, so there is no reference cycle to break.
//! Back edges are never traversed for deletion; removal always walks down
//! from the parent.
//!
//! Hardlinks are not modeled as nodes: a link is just another name in some
//! directory's `aliases` list pointing at an existing node's inode number.
//! This keeps "one node == one on-disk inode" an invariant the commit code
//! can rely on without tracking phantom, never-written inode numbers.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ondisk::constants::{file_type_of_mode, mode, FileType, FIRST_USER_INODE, MAX_LINKS, ROOT_INODE};

/// A contiguous run of physical blocks allocated to a file's data.
#[derive(Debug, Clone, Copy)]
pub struct BlockRange {
    pub start: u64,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct Timestamps {
    pub atime: (u32, u32),
    pub ctime: (u32, u32),
    pub mtime: (u32, u32),
}

impl Timestamps {
    pub fn now() -> Self {
        let (sec, nsec) = crate::util::now();
        let t = (sec as u32, nsec);
        Self {
            atime: t,
            ctime: t,
            mtime: t,
        }
    }
}

/// A hardlink dentry living in some directory: `name` resolves to
/// `target`'s inode rather than owning a node of its own.
#[derive(Debug, Clone)]
pub struct Alias {
    pub name: Vec<u8>,
    pub target: u32,
}

/// One staged inode: a directory, regular file, or symlink, plus its
/// directory-tree position. Every `Node` gets exactly one on-disk inode
/// record at commit time.
#[derive(Debug, Clone)]
pub struct Node {
    pub inode: u32,
    pub name: Vec<u8>,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    pub aliases: Vec<Alias>,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub timestamps: Timestamps,
    /// Directory link count (2 + one per subdirectory child); for
    /// non-directories, the hardlink count (entries across all directories
    /// that resolve to this inode, including the node's own original name).
    pub links_count: u16,
    /// Byte size for regular files and symlinks; recomputed for
    /// directories at commit time once their dentry blocks are laid out.
    pub size: u64,
    pub primary_blocks: Option<BlockRange>,
    pub additional_blocks: Vec<BlockRange>,
    /// Inline symlink target, when short enough (<= 59 bytes).
    pub inline_symlink: Option<Vec<u8>>,
    pub xattrs: Vec<(String, Vec<u8>)>,
    /// Physical block holding the overflow xattr block, if any.
    pub file_acl: Option<u64>,
    pub inline_xattrs: [u8; 96],
    pub deleted: bool,
}

impl Node {
    pub fn file_type(&self) -> FileType {
        file_type_of_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & mode::IFMT == mode::IFDIR
    }
}

/// What a name inside a directory resolves to.
#[derive(Debug, Clone, Copy)]
pub enum Entry {
    /// A real node owned by this directory.
    Child(u32),
    /// A hardlink alias; the payload is the target's inode number.
    Alias(u32),
}

impl Entry {
    /// The inode number a reader would see when stat-ing this entry.
    pub fn inode(&self) -> u32 {
        match self {
            Entry::Child(i) | Entry::Alias(i) => *i,
        }
    }
}

pub struct FileTree {
    nodes: HashMap<u32, Node>,
    next_inode: u32,
}

impl FileTree {
    /// Builds a fresh tree containing `/` (inode 2) and the mandatory
    /// `/lost+found` (inode 11, mode 0700) required by `e2fsck`.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let now = Timestamps::now();
        nodes.insert(
            ROOT_INODE,
            Node {
                inode: ROOT_INODE,
                name: Vec::new(),
                parent: None,
                children: vec![FIRST_USER_INODE],
                aliases: Vec::new(),
                mode: mode::IFDIR | 0o755,
                uid: 0,
                gid: 0,
                timestamps: now.clone(),
                links_count: 3, // '.', '..', and lost+found's '..'
                size: 0,
                primary_blocks: None,
                additional_blocks: Vec::new(),
                inline_symlink: None,
                xattrs: Vec::new(),
                file_acl: None,
                inline_xattrs: [0; 96],
                deleted: false,
            },
        );
        nodes.insert(
            FIRST_USER_INODE,
            Node {
                inode: FIRST_USER_INODE,
                name: b"lost+found".to_vec(),
                parent: Some(ROOT_INODE),
                children: Vec::new(),
                aliases: Vec::new(),
                mode: mode::IFDIR | 0o700,
                uid: 0,
                gid: 0,
                timestamps: now,
                links_count: 2,
                size: 0,
                primary_blocks: None,
                additional_blocks: Vec::new(),
                inline_symlink: None,
                xattrs: Vec::new(),
                file_acl: None,
                inline_xattrs: [0; 96],
                deleted: false,
            },
        );
        Self {
            nodes,
            next_inode: FIRST_USER_INODE + 1,
        }
    }

    pub fn node(&self, inode: u32) -> Option<&Node> {
        self.nodes.get(&inode)
    }

    pub fn node_mut(&mut self, inode: u32) -> Option<&mut Node> {
        self.nodes.get_mut(&inode)
    }

    pub fn all_inodes(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes.keys().copied()
    }

    pub fn alloc_inode(&mut self) -> u32 {
        let n = self.next_inode;
        self.next_inode += 1;
        n
    }

    /// The highest inode number ever allocated (never reclaimed, even once
    /// unlinked), used to size the inode table at commit time.
    pub fn highest_inode(&self) -> u32 {
        self.next_inode - 1
    }

    /// Splits an absolute path (`/a/b/c`) into its component names.
    fn split(path: &str) -> Result<Vec<&[u8]>> {
        let path = path.strip_prefix('/').unwrap_or(path);
        if path.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for comp in path.split('/') {
            if comp.is_empty() || comp == "." || comp == ".." {
                return Err(Error::InvalidName(path.to_string()));
            }
            out.push(comp.as_bytes());
        }
        Ok(out)
    }

    /// Resolves a name within `parent` to a real child or a hardlink alias.
    pub fn find_entry(&self, parent: u32, name: &[u8]) -> Option<Entry> {
        let node = self.nodes.get(&parent)?;
        if let Some(child) = node
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes.get(&c).map(|n| n.name.as_slice()) == Some(name))
        {
            return Some(Entry::Child(child));
        }
        node.aliases
            .iter()
            .find(|a| a.name == name)
            .map(|a| Entry::Alias(a.target))
    }

    fn find_child_dir(&self, parent: u32, name: &[u8]) -> Option<u32> {
        match self.find_entry(parent, name)? {
            Entry::Child(c) if self.nodes.get(&c).map(|n| n.is_dir()).unwrap_or(false) => Some(c),
            _ => None,
        }
    }

    /// Resolves a path to an effective inode number (following the final
    /// component's alias if it is one), if present.
    pub fn lookup(&self, path: &str) -> Result<Option<u32>> {
        let comps = Self::split(path)?;
        let Some((last, dirs)) = comps.split_last() else {
            return Ok(Some(ROOT_INODE));
        };
        let mut cur = ROOT_INODE;
        for comp in dirs {
            match self.find_child_dir(cur, comp) {
                Some(next) => cur = next,
                None => return Ok(None),
            }
        }
        Ok(self.find_entry(cur, last).map(|e| e.inode()))
    }

    /// Resolves a path to the raw entry (distinguishing real children from
    /// aliases), if present.
    pub fn lookup_entry(&self, path: &str) -> Result<Option<Entry>> {
        let comps = Self::split(path)?;
        let Some((last, dirs)) = comps.split_last() else {
            return Ok(None); // root is never an alias/child entry
        };
        let mut cur = ROOT_INODE;
        for comp in dirs {
            match self.find_child_dir(cur, comp) {
                Some(next) => cur = next,
                None => return Ok(None),
            }
        }
        Ok(self.find_entry(cur, last))
    }

    /// Resolves the parent directory of `path`, creating missing
    /// intermediate directories with mode `IFDIR|0755` (inheriting uid/gid
    /// from the immediate parent), per §4.1.
    pub fn ensure_parent_dirs(&mut self, path: &str) -> Result<u32> {
        let comps = Self::split(path)?;
        let Some((_, dirs)) = comps.split_last() else {
            return Ok(ROOT_INODE);
        };
        let mut cur = ROOT_INODE;
        for comp in dirs {
            cur = match self.find_entry(cur, comp) {
                Some(Entry::Child(existing)) => {
                    let node = self.nodes.get(&existing).unwrap();
                    if !node.is_dir() {
                        return Err(Error::NotDirectory(String::from_utf8_lossy(comp).into_owned()));
                    }
                    existing
                }
                Some(Entry::Alias(_)) => {
                    return Err(Error::NotDirectory(String::from_utf8_lossy(comp).into_owned()));
                }
                None => self.create_directory(cur, comp, 0o755, None, None)?,
            };
        }
        Ok(cur)
    }

    /// Creates a directory named `name` under `parent`. Uid/gid default to
    /// the parent's when not given explicitly.
    pub fn create_directory(
        &mut self,
        parent: u32,
        name: &[u8],
        perm_bits: u16,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<u32> {
        self.check_link_budget(parent)?;
        let (puid, pgid) = {
            let p = self.nodes.get(&parent).ok_or_else(|| Error::internal("dangling parent"))?;
            (p.uid, p.gid)
        };
        let inode = self.alloc_inode();
        let now = Timestamps::now();
        self.nodes.insert(
            inode,
            Node {
                inode,
                name: name.to_vec(),
                parent: Some(parent),
                children: Vec::new(),
                aliases: Vec::new(),
                mode: mode::IFDIR | (perm_bits & 0o7777),
                uid: uid.unwrap_or(puid),
                gid: gid.unwrap_or(pgid),
                timestamps: now,
                links_count: 2,
                size: 0,
                primary_blocks: None,
                additional_blocks: Vec::new(),
                inline_symlink: None,
                xattrs: Vec::new(),
                file_acl: None,
                inline_xattrs: [0; 96],
                deleted: false,
            },
        );
        let p = self.nodes.get_mut(&parent).unwrap();
        p.children.push(inode);
        p.links_count += 1; // the new subdirectory's `..` points back here
        Ok(inode)
    }

    /// Errors with `MaximumLinksExceeded` if `parent` cannot take one more
    /// subdirectory.
    fn check_link_budget(&self, parent: u32) -> Result<()> {
        let p = self.nodes.get(&parent).ok_or_else(|| Error::internal("dangling parent"))?;
        if p.links_count as u32 + 1 > MAX_LINKS {
            return Err(Error::MaximumLinksExceeded(
                String::from_utf8_lossy(&p.name).into_owned(),
            ));
        }
        Ok(())
    }

    /// Inserts a freshly-built leaf node (regular file or symlink) as a
    /// child of `parent`.
    pub fn insert_leaf(&mut self, parent: u32, node: Node) {
        let inode = node.inode;
        self.nodes.insert(inode, node);
        self.nodes.get_mut(&parent).unwrap().children.push(inode);
    }

    /// Adds a directory entry in `parent` named `name` that refers to
    /// `target`'s inode (a hardlink), bumping the target's link count.
    pub fn insert_alias(&mut self, parent: u32, name: &[u8], target: u32) {
        self.nodes.get_mut(&parent).unwrap().aliases.push(Alias {
            name: name.to_vec(),
            target,
        });
        if let Some(t) = self.nodes.get_mut(&target) {
            t.links_count += 1;
        }
    }

    /// Removes `name` from `parent`, returning the entry that was removed.
    pub fn detach_entry(&mut self, parent: u32, name: &[u8]) -> Option<Entry> {
        let entry = self.find_entry(parent, name)?;
        let p = self.nodes.get_mut(&parent).unwrap();
        match entry {
            Entry::Child(c) => p.children.retain(|&x| x != c),
            Entry::Alias(_) => p.aliases.retain(|a| a.name != name),
        }
        Some(entry)
    }

    /// The combined, commit-ready directory entries for `dir`: real
    /// children plus hardlink aliases, sorted ascending by inode number as
    /// required by §4.1.3 step 1.
    pub fn directory_entries(&self, dir: u32) -> Vec<(Vec<u8>, u32, FileType)> {
        let Some(node) = self.nodes.get(&dir) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(node.children.len() + node.aliases.len());
        for &c in &node.children {
            if let Some(n) = self.nodes.get(&c) {
                out.push((n.name.clone(), c, n.file_type()));
            }
        }
        for a in &node.aliases {
            if let Some(target) = self.nodes.get(&a.target) {
                out.push((a.name.clone(), a.target, target.file_type()));
            }
        }
        out.sort_by_key(|(_, inode, _)| *inode);
        out
    }

    pub fn path_of(&self, inode: u32) -> String {
        let mut parts = Vec::new();
        let mut cur = inode;
        while let Some(node) = self.nodes.get(&cur) {
            if node.parent.is_none() {
                break;
            }
            parts.push(String::from_utf8_lossy(&node.name).into_owned());
            cur = node.parent.unwrap();
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_tree_has_root_and_lost_found() {
        let tree = FileTree::new();
        assert!(tree.node(ROOT_INODE).unwrap().is_dir());
        let lf = tree.node(FIRST_USER_INODE).unwrap();
        assert_eq!(lf.name, b"lost+found");
        assert_eq!(lf.mode & 0o777, 0o700);
    }

    #[test]
    fn ensure_parent_dirs_creates_missing_directories() {
        let mut tree = FileTree::new();
        let parent = tree.ensure_parent_dirs("/a/b/c").unwrap();
        assert_eq!(tree.path_of(parent), "/a/b");
        assert!(tree.lookup("/a").unwrap().is_some());
        assert!(tree.lookup("/a/b").unwrap().is_some());
    }

    #[test]
    fn ensure_parent_dirs_is_idempotent() {
        let mut tree = FileTree::new();
        let first = tree.ensure_parent_dirs("/a/file").unwrap();
        let second = tree.ensure_parent_dirs("/a/other").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn max_links_exceeded() {
        let mut tree = FileTree::new();
        let parent = tree.create_directory(ROOT_INODE, b"big", 0o755, None, None).unwrap();
        tree.node_mut(parent).unwrap().links_count = MAX_LINKS as u16;
        let err = tree.create_directory(parent, b"one-more", 0o755, None, None);
        assert!(err.is_err());
    }

    #[test]
    fn path_of_root_is_slash() {
        let tree = FileTree::new();
        assert_eq!(tree.path_of(ROOT_INODE), "/");
    }

    #[test]
    fn alias_resolves_to_target_inode_and_bumps_link_count() {
        let mut tree = FileTree::new();
        let inode = tree.alloc_inode();
        tree.insert_leaf(
            ROOT_INODE,
            Node {
                inode,
                name: b"x".to_vec(),
                parent: Some(ROOT_INODE),
                children: Vec::new(),
                aliases: Vec::new(),
                mode: mode::IFREG | 0o644,
                uid: 0,
                gid: 0,
                timestamps: Timestamps::now(),
                links_count: 1,
                size: 0,
                primary_blocks: None,
                additional_blocks: Vec::new(),
                inline_symlink: None,
                xattrs: Vec::new(),
                file_acl: None,
                inline_xattrs: [0; 96],
                deleted: false,
            },
        );
        tree.insert_alias(ROOT_INODE, b"y", inode);
        assert_eq!(tree.lookup("/y").unwrap(), Some(inode));
        assert_eq!(tree.node(inode).unwrap().links_count, 2);
    }
}
