use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Inode of the served root directory.
pub const ROOT_INODE: u64 = 1;

/// Maps inode numbers to paths relative to a served root.
///
/// Inodes are handed out on first lookup and stay stable for the lifetime
/// of the table. Renames and removals keep both directions in sync,
/// including every descendant of a renamed directory.
#[derive(Debug)]
pub struct InodeTable {
    root: PathBuf,
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
    next_inode: u64,
}

impl InodeTable {
    /// Create a table whose root inode is `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let mut paths = HashMap::new();
        let mut inodes = HashMap::new();
        paths.insert(ROOT_INODE, PathBuf::new());
        inodes.insert(PathBuf::new(), ROOT_INODE);
        Self {
            root: root.into(),
            paths,
            inodes,
            next_inode: ROOT_INODE + 1,
        }
    }

    /// The directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an inode relative to the root.
    pub fn relative(&self, inode: u64) -> Option<&Path> {
        self.paths.get(&inode).map(PathBuf::as_path)
    }

    /// Absolute path of an inode on the backing filesystem.
    pub fn absolute(&self, inode: u64) -> Option<PathBuf> {
        self.relative(inode).map(|rel| self.root.join(rel))
    }

    /// Relative path of `name` inside directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return None;
        }
        self.relative(parent).map(|dir| dir.join(name))
    }

    /// Inode of a relative path, assigning one if it has none yet.
    pub fn get_or_assign(&mut self, rel: &Path) -> u64 {
        if let Some(inode) = self.inodes.get(rel) {
            return *inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(inode, rel.to_path_buf());
        self.inodes.insert(rel.to_path_buf(), inode);
        inode
    }

    /// Inode of a relative path if one was assigned.
    pub fn lookup(&self, rel: &Path) -> Option<u64> {
        self.inodes.get(rel).copied()
    }

    /// Forget a path and everything below it.
    pub fn remove(&mut self, rel: &Path) {
        let doomed: Vec<PathBuf> = self
            .inodes
            .keys()
            .filter(|p| p.starts_with(rel) && !p.as_os_str().is_empty())
            .cloned()
            .collect();
        for path in doomed {
            if let Some(inode) = self.inodes.remove(&path) {
                self.paths.remove(&inode);
            }
        }
    }

    /// Move a path (and its descendants) to a new location, keeping inodes.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        self.remove(to);
        let moved: Vec<(PathBuf, u64)> = self
            .inodes
            .iter()
            .filter(|(p, _)| p.starts_with(from) && !p.as_os_str().is_empty())
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (old, inode) in moved {
            let suffix = old.strip_prefix(from).unwrap_or_else(|_| Path::new(""));
            let new = to.join(suffix);
            self.inodes.remove(&old);
            self.inodes.insert(new.clone(), inode);
            self.paths.insert(inode, new);
        }
    }

    /// Number of inodes currently known, including the root.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
