//! The in-memory open-inode table of §3/§4.5: distinct opens of the same
//! on-disk sector share one record, reference-counted, with a
//! deny-write count that brackets executable loads. A kernel inode cache
//! typically distinguishes several lifecycle states (allocating,
//! referencing, valid, locked) to make this safe without blocking; this
//! crate collapses them into one mutex-guarded record since it has no
//! unsafe arena to thread those states through.

use super::inode::OnDiskInode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One inode shared by every open handle pointing at the same sector.
pub struct OpenInode {
    pub sector: u32,
    pub disk: Mutex<OnDiskInode>,
    open_count: Mutex<u32>,
    deny_write_count: Mutex<u32>,
    removed: Mutex<bool>,
}

impl OpenInode {
    fn new(sector: u32, disk: OnDiskInode) -> Arc<Self> {
        Arc::new(OpenInode {
            sector,
            disk: Mutex::new(disk),
            open_count: Mutex::new(0),
            deny_write_count: Mutex::new(0),
            removed: Mutex::new(false),
        })
    }

    pub fn is_writable(&self) -> bool {
        *self.deny_write_count.lock().unwrap() == 0
    }

    pub fn deny_write(&self) {
        *self.deny_write_count.lock().unwrap() += 1;
    }

    pub fn allow_write(&self) {
        let mut count = self.deny_write_count.lock().unwrap();
        debug_assert!(*count > 0);
        *count -= 1;
    }

    pub fn mark_removed(&self) {
        *self.removed.lock().unwrap() = true;
    }

    pub fn is_removed(&self) -> bool {
        *self.removed.lock().unwrap()
    }

    pub fn open_count(&self) -> u32 {
        *self.open_count.lock().unwrap()
    }
}

/// Process-wide set of open inodes keyed by sector number, a singleton per
/// §9's Design Notes.
pub struct OpenInodeTable {
    entries: HashMap<u32, Arc<OpenInode>>,
}

impl OpenInodeTable {
    pub fn new() -> Self {
        OpenInodeTable {
            entries: HashMap::new(),
        }
    }

    /// Open `sector`, bumping its refcount if already open, or installing
    /// `load` as the freshly-read on-disk image otherwise.
    pub fn open_with<F>(&mut self, sector: u32, load: F) -> Arc<OpenInode>
    where
        F: FnOnce() -> OnDiskInode,
    {
        let entry = self
            .entries
            .entry(sector)
            .or_insert_with(|| OpenInode::new(sector, load()))
            .clone();
        *entry.open_count.lock().unwrap() += 1;
        entry
    }

    /// Close one reference. Returns `true` if this was the last reference
    /// and the inode's sectors should now be released by the caller
    /// (because it was also marked removed).
    pub fn close(&mut self, sector: u32) -> Option<bool> {
        let should_delete = {
            let entry = self.entries.get(&sector)?;
            let mut count = entry.open_count.lock().unwrap();
            debug_assert!(*count > 0, "closing an inode with no opens");
            *count -= 1;
            *count == 0
        };
        if should_delete {
            let entry = self.entries.remove(&sector).unwrap();
            return Some(entry.is_removed());
        }
        Some(false)
    }
}

impl Default for OpenInodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::FileType;

    #[test]
    fn repeated_opens_share_one_record() {
        let mut table = OpenInodeTable::new();
        let a = table.open_with(5, || OnDiskInode::new(FileType::File));
        let b = table.open_with(5, || panic!("should not reload an already-open inode"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_count(), 2);
    }

    #[test]
    fn second_close_on_closed_fd_is_a_no_op() {
        let mut table = OpenInodeTable::new();
        table.open_with(5, || OnDiskInode::new(FileType::File));
        assert_eq!(table.close(5), Some(false));
        assert_eq!(table.close(5), None);
    }
}
