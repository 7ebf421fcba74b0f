//! Inode-to-path mapping for the dispatch layer.
//!
//! The overlay resolves operations by virtual path, so the table is a
//! bidirectional map between kernel inode numbers and paths relative to
//! the mount. Entries live for the session: the table never evicts, and
//! `forget` bookkeeping is unnecessary at that lifetime.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// Thread-safe inode ⇄ virtual-path table.
#[derive(Debug)]
pub struct InodeTable {
    by_ino: DashMap<u64, PathBuf>,
    by_path: DashMap<PathBuf, u64>,
    next_ino: AtomicU64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Creates the table with the virtual root registered as inode 1.
    pub fn new() -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_path: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INODE + 1),
        };
        table.by_ino.insert(ROOT_INODE, PathBuf::new());
        table.by_path.insert(PathBuf::new(), ROOT_INODE);
        table
    }

    /// The virtual path for an inode, if known.
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.by_ino.get(&ino).map(|entry| entry.clone())
    }

    /// The inode for a virtual path, assigning a fresh one on first sight.
    pub fn assign(&self, path: &Path) -> u64 {
        if let Some(existing) = self.by_path.get(path) {
            return *existing;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.by_path.insert(path.to_path_buf(), ino);
        self.by_ino.insert(ino, path.to_path_buf());
        ino
    }

    /// Drops the mapping for a removed path.
    pub fn forget_path(&self, path: &Path) {
        if let Some((_, ino)) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }

    /// Rewrites the mappings for a renamed path and everything under it.
    pub fn rename_subtree(&self, from: &Path, to: &Path) {
        let moved: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter(|entry| entry.key() == from || entry.key().starts_with(from))
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        for (old_path, ino) in moved {
            let suffix = old_path
                .strip_prefix(from)
                .unwrap_or_else(|_| Path::new(""));
            let new_path = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            self.by_path.remove(&old_path);
            self.by_path.insert(new_path.clone(), ino);
            self.by_ino.insert(ino, new_path);
        }
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// Whether only nothing is mapped (never true: the root is permanent).
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preregistered() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INODE), Some(PathBuf::new()));
        assert_eq!(table.assign(Path::new("")), ROOT_INODE);
    }

    #[test]
    fn assign_is_stable_per_path() {
        let table = InodeTable::new();
        let a = table.assign(Path::new("docs/a.txt"));
        let b = table.assign(Path::new("docs/b.txt"));
        assert_ne!(a, b);
        assert_eq!(table.assign(Path::new("docs/a.txt")), a);
        assert_eq!(table.path_of(a), Some(PathBuf::from("docs/a.txt")));
    }

    #[test]
    fn forget_removes_both_directions() {
        let table = InodeTable::new();
        let ino = table.assign(Path::new("tmp.bin"));
        table.forget_path(Path::new("tmp.bin"));
        assert_eq!(table.path_of(ino), None);
        // A fresh assignment gets a new inode.
        assert_ne!(table.assign(Path::new("tmp.bin")), ino);
    }

    #[test]
    fn rename_moves_the_whole_subtree() {
        let table = InodeTable::new();
        let dir = table.assign(Path::new("old"));
        let child = table.assign(Path::new("old/file"));
        let nested = table.assign(Path::new("old/sub/deep"));

        table.rename_subtree(Path::new("old"), Path::new("new"));

        assert_eq!(table.path_of(dir), Some(PathBuf::from("new")));
        assert_eq!(table.path_of(child), Some(PathBuf::from("new/file")));
        assert_eq!(table.path_of(nested), Some(PathBuf::from("new/sub/deep")));
        assert_eq!(table.assign(Path::new("new/file")), child);
    }

    #[test]
    fn rename_does_not_touch_similar_prefixes() {
        let table = InodeTable::new();
        let other = table.assign(Path::new("older/file"));
        table.assign(Path::new("old"));

        table.rename_subtree(Path::new("old"), Path::new("new"));

        // Path components, not string prefixes, decide what moves.
        assert_eq!(table.path_of(other), Some(PathBuf::from("older/file")));
    }
}
