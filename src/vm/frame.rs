//! The frame table of §4.3: every physical page handed to a user process,
//! with two-pass second-chance eviction when the underlying allocator is
//! exhausted (pass A: unpinned, unaccessed, clean; pass B: unpinned,
//! unaccessed, dirty allowed), rather than simply evicting the first
//! unpinned frame found.

use super::ThreadId;
use crate::config::PAGE_SIZE;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// One physical page. Modeled as an owned buffer rather than a raw address
/// since the physical-page allocator is an external collaborator (§1); a
/// kernel's real allocator hands out addresses instead, but the contract
/// — "a page-sized block the frame table owns exclusively" — is the same.
pub struct PhysicalPage(Box<[u8; PAGE_SIZE]>);

impl PhysicalPage {
    pub fn zeroed() -> Self {
        PhysicalPage(Box::new([0u8; PAGE_SIZE]))
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.0
    }
}

/// The physical-page allocator: external per §1. `alloc` returning `None`
/// is exactly the condition that triggers frame eviction.
pub trait PhysicalAllocator: Send + Sync {
    fn alloc(&self) -> Option<PhysicalPage>;
    fn free(&self, page: PhysicalPage);
}

/// A fixed-size pool, the simplest allocator satisfying the trait; used by
/// tests and available to production glue that wants a bounded physical
/// memory simulation rather than talking to a real allocator.
pub struct PoolAllocator {
    remaining: Mutex<usize>,
}

impl PoolAllocator {
    pub fn new(pages: usize) -> Self {
        PoolAllocator {
            remaining: Mutex::new(pages),
        }
    }
}

impl PhysicalAllocator for PoolAllocator {
    fn alloc(&self) -> Option<PhysicalPage> {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(PhysicalPage::zeroed())
    }

    fn free(&self, page: PhysicalPage) {
        drop(page);
        *self.remaining.lock().unwrap() += 1;
    }
}

/// Implemented by a thread's supplemental page table so the frame table can
/// consult and evict its entries without depending on the `spt` module's
/// concrete type. Mirrors the "frame entries refer to an SPT entry by a
/// stable identifier" resolution in §9's Design Notes: the frame table
/// holds a `Weak<dyn PageOwner>` plus the `uaddr` key rather than a raw
/// pointer into another thread's table.
pub trait PageOwner: Send + Sync {
    fn pinned(&self, uaddr: usize) -> bool;
    fn accessed(&self, uaddr: usize) -> bool;
    fn dirty(&self, uaddr: usize) -> bool;
    fn clear_accessed(&self, uaddr: usize);

    /// Called once this `uaddr`'s frame has been chosen as an eviction
    /// victim, with the frame's current bytes. Must perform any
    /// writeback/swap-promotion, clear the page-table mapping, and mark
    /// the SPT entry no longer loaded; `dirty`/`accessed` are read again
    /// after this returns so they should be cleared too.
    fn evict(&self, uaddr: usize, bytes: &[u8; PAGE_SIZE]);
}

struct FrameEntry {
    page: PhysicalPage,
    thread: ThreadId,
    uaddr: usize,
    owner: Weak<dyn PageOwner>,
}

/// An opaque reference to one allocated frame, returned by
/// [`FrameTable::alloc`] and consumed by [`FrameTable::free`]. Carries a
/// monotonically increasing id rather than a slot position, so freeing one
/// frame can never shift another live handle onto the wrong entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle(u64);

struct Inner {
    next_id: u64,
    frames: HashMap<u64, FrameEntry>,
}

/// The process-wide frame table, a singleton per §9's Design Notes. Frames
/// are keyed by id in a map rather than held in a `Vec`, since removing a
/// `Vec` entry reshuffles every handle past it; ids are never reused within
/// a table's lifetime.
pub struct FrameTable<A: PhysicalAllocator> {
    allocator: Arc<A>,
    inner: Mutex<Inner>,
}

impl<A: PhysicalAllocator> FrameTable<A> {
    pub fn new(allocator: Arc<A>) -> Self {
        FrameTable {
            allocator,
            inner: Mutex::new(Inner { next_id: 0, frames: HashMap::new() }),
        }
    }

    /// Allocate a frame for `uaddr` owned by `thread`, running eviction if
    /// the underlying allocator is exhausted. Returns the handle and the
    /// page's initial (zeroed) bytes for the caller to populate.
    pub fn alloc(&self, thread: ThreadId, uaddr: usize, owner: Weak<dyn PageOwner>) -> FrameHandle {
        loop {
            if let Some(page) = self.allocator.alloc() {
                let mut inner = self.inner.lock().unwrap();
                let id = inner.next_id;
                inner.next_id += 1;
                inner.frames.insert(id, FrameEntry { page, thread, uaddr, owner });
                return FrameHandle(id);
            }
            self.evict_one();
        }
    }

    pub fn write(&self, handle: &FrameHandle, bytes: &[u8; PAGE_SIZE]) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.frames.get_mut(&handle.0).expect("stale frame handle");
        *entry.page.as_bytes_mut() = *bytes;
    }

    pub fn read(&self, handle: &FrameHandle, out: &mut [u8; PAGE_SIZE]) {
        let inner = self.inner.lock().unwrap();
        let entry = inner.frames.get(&handle.0).expect("stale frame handle");
        out.copy_from_slice(entry.page.as_bytes());
    }

    /// Release a frame this owner is done with directly (not via
    /// eviction), returning its physical page to the allocator.
    pub fn free(&self, handle: FrameHandle) {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            inner.frames.remove(&handle.0).expect("stale frame handle")
        };
        self.allocator.free(entry.page);
    }

    /// Targeted free on thread exit: release every frame tagged with
    /// `thread`, per §4.3.
    pub fn free_for_thread(&self, thread: ThreadId) {
        let removed: Vec<FrameEntry> = {
            let mut inner = self.inner.lock().unwrap();
            let ids: Vec<u64> = inner
                .frames
                .iter()
                .filter(|(_, entry)| entry.thread == thread)
                .map(|(&id, _)| id)
                .collect();
            ids.into_iter().map(|id| inner.frames.remove(&id).unwrap()).collect()
        };
        for entry in removed {
            self.allocator.free(entry.page);
        }
    }

    /// Two-pass second-chance eviction of §4.3: pass A looks for a frame
    /// that is both clean and unaccessed (the cheapest victim); pass B
    /// settles for merely unaccessed, clearing the accessed bit of every
    /// unpinned frame visited so the next pass has fresh candidates.
    fn evict_one(&self) {
        let victim = loop {
            if let Some(id) = self.scan(|owner, uaddr| !owner.accessed(uaddr) && !owner.dirty(uaddr)) {
                break id;
            }
            if let Some(id) = self.scan(|owner, uaddr| !owner.accessed(uaddr)) {
                break id;
            }
            // Every frame has its accessed bit set; the second scan just
            // cleared them all, so the next attempt is guaranteed to find
            // one. Loop rather than recurse to keep this frame-sized.
        };

        let (owner, uaddr, bytes) = {
            let inner = self.inner.lock().unwrap();
            let entry = inner.frames.get(&victim).expect("victim vanished under the frame lock");
            (entry.owner.clone(), entry.uaddr, *entry.page.as_bytes())
        };
        log::debug!("frame: evicting uaddr={:#x} (frame {})", uaddr, victim);
        if let Some(owner) = owner.upgrade() {
            owner.evict(uaddr, &bytes);
        }

        let entry = {
            let mut inner = self.inner.lock().unwrap();
            inner.frames.remove(&victim).expect("victim vanished under the frame lock")
        };
        self.allocator.free(entry.page);
    }

    /// Scan all unpinned frames for one matching `predicate`, clearing the
    /// accessed bit of every unpinned frame visited. Returns the id of the
    /// first match, if any.
    fn scan(&self, predicate: impl Fn(&Arc<dyn PageOwner>, usize) -> bool) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        let mut found = None;
        for (&id, entry) in inner.frames.iter() {
            let Some(owner) = entry.owner.upgrade() else { continue };
            if owner.pinned(entry.uaddr) {
                continue;
            }
            if found.is_none() && predicate(&owner, entry.uaddr) {
                found = Some(id);
            }
            owner.clear_accessed(entry.uaddr);
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeOwner {
        pinned: AtomicBool,
        accessed: AtomicBool,
        dirty: AtomicBool,
        evicted: AtomicBool,
    }

    impl PageOwner for FakeOwner {
        fn pinned(&self, _uaddr: usize) -> bool {
            self.pinned.load(Ordering::SeqCst)
        }
        fn accessed(&self, _uaddr: usize) -> bool {
            self.accessed.load(Ordering::SeqCst)
        }
        fn dirty(&self, _uaddr: usize) -> bool {
            self.dirty.load(Ordering::SeqCst)
        }
        fn clear_accessed(&self, _uaddr: usize) {
            self.accessed.store(false, Ordering::SeqCst);
        }
        fn evict(&self, _uaddr: usize, _bytes: &[u8; PAGE_SIZE]) {
            self.evicted.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn eviction_runs_when_allocator_is_exhausted() {
        let allocator = Arc::new(PoolAllocator::new(1));
        let table = FrameTable::new(allocator);

        let owner_a = Arc::new(FakeOwner {
            pinned: AtomicBool::new(false),
            accessed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
        });
        let _handle_a = table.alloc(1, 0x1000, Arc::downgrade(&owner_a) as Weak<dyn PageOwner>);

        let owner_b = Arc::new(FakeOwner {
            pinned: AtomicBool::new(false),
            accessed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
        });
        // The pool has only one page; this allocation must evict owner_a's.
        let _handle_b = table.alloc(1, 0x2000, Arc::downgrade(&owner_b) as Weak<dyn PageOwner>);

        assert!(owner_a.evicted.load(Ordering::SeqCst));
        assert!(!owner_b.evicted.load(Ordering::SeqCst));
    }

    #[test]
    fn pinned_frames_are_never_chosen_as_victims() {
        let allocator = Arc::new(PoolAllocator::new(1));
        let table = FrameTable::new(allocator);

        let pinned_owner = Arc::new(FakeOwner {
            pinned: AtomicBool::new(true),
            accessed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
        });
        let _handle = table.alloc(1, 0x1000, Arc::downgrade(&pinned_owner) as Weak<dyn PageOwner>);

        // Unpin, then allocate again with nothing else pinned: now it's
        // the only possible victim and must be evicted.
        pinned_owner.pinned.store(false, Ordering::SeqCst);
        let other_owner = Arc::new(FakeOwner {
            pinned: AtomicBool::new(false),
            accessed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
        });
        let _handle2 = table.alloc(1, 0x2000, Arc::downgrade(&other_owner) as Weak<dyn PageOwner>);
        assert!(pinned_owner.evicted.load(Ordering::SeqCst));
    }

    /// Freeing an earlier handle must not reinterpret a later one: this is
    /// exactly the mmap-two-pages-then-munmap-each-page shape, where the
    /// first `free` must not invalidate the handle the second `free` still
    /// holds.
    #[test]
    fn freeing_one_handle_leaves_another_handles_contents_intact() {
        let allocator = Arc::new(PoolAllocator::new(4));
        let table = FrameTable::new(allocator);
        let owner = Arc::new(FakeOwner {
            pinned: AtomicBool::new(false),
            accessed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&owner) as Weak<dyn PageOwner>;

        let handle_a = table.alloc(1, 0x1000, weak.clone());
        let handle_b = table.alloc(1, 0x2000, weak);

        let mut page_b = [0u8; PAGE_SIZE];
        page_b[0] = 0xBB;
        table.write(&handle_b, &page_b);

        table.free(handle_a);

        let mut out = [0u8; PAGE_SIZE];
        table.read(&handle_b, &mut out);
        assert_eq!(out, page_b);
    }
}
