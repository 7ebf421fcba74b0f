//! Open-handle tracking for the dispatch layer.
//!
//! Besides mapping FUSE handle numbers to open files, the table drives the
//! session's open-handle counters: the idle monitor refuses to unmount
//! while anything is open, so every insert and remove is mirrored into the
//! activity tracker.

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use veilfs_mount::FsActivity;

/// One open file handle.
#[derive(Debug)]
pub struct OpenHandle {
    /// Inode the handle was opened against.
    pub ino: u64,
    /// The backing file.
    pub file: Mutex<File>,
}

/// Thread-safe table of open handles with auto-assigned ids.
#[derive(Debug)]
pub struct HandleTable {
    entries: DashMap<u64, Arc<OpenHandle>>,
    next_fh: AtomicU64,
    activity: Arc<FsActivity>,
}

impl HandleTable {
    /// Creates an empty table wired to the given activity tracker.
    pub fn new(activity: Arc<FsActivity>) -> Self {
        Self {
            entries: DashMap::new(),
            next_fh: AtomicU64::new(1),
            activity,
        }
    }

    /// Registers an open file and returns its handle id.
    pub fn insert(&self, ino: u64, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            fh,
            Arc::new(OpenHandle {
                ino,
                file: Mutex::new(file),
            }),
        );
        self.activity.file_opened();
        fh
    }

    /// Looks up a live handle.
    pub fn get(&self, fh: u64) -> Option<Arc<OpenHandle>> {
        self.entries.get(&fh).map(|entry| Arc::clone(&entry))
    }

    /// Removes a handle, returning it for any final flush.
    pub fn remove(&self, fh: u64) -> Option<Arc<OpenHandle>> {
        let removed = self.entries.remove(&fh).map(|(_, handle)| handle);
        if removed.is_some() {
            self.activity.file_released();
        }
        removed
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handles are open.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
