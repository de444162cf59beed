//! Per-thread supplemental page table of §4.4: the FILE/SWAP/MMAP source
//! distinction, fault-time materialisation (`load`), stack growth, and the
//! mmap-record-per-page bookkeeping `munmap`/`destroy` walk on teardown.

use super::backing::FileBacking;
use super::frame::{FrameHandle, FrameTable, PageOwner, PhysicalAllocator};
use super::ThreadId;
use crate::config::{MAX_STACK_SIZE, PAGE_SIZE, STACK_GROWTH_SLACK, USER_BASE};
use crate::error::{Error, Result};
use crate::swap::{SwapArea, SwapSlot};
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

bitflags! {
    /// Per-entry state bits, mirroring the accessed/dirty/writable bits a
    /// real page-table entry packs into its spare bits rather than
    /// carrying five separate booleans.
    struct EntryFlags: u8 {
        const WRITABLE = 0b0000_0001;
        const LOADED    = 0b0000_0010;
        const PINNED    = 0b0000_0100;
        const ACCESSED  = 0b0000_1000;
        const DIRTY     = 0b0001_0000;
    }
}

/// Where an SPT entry's bytes come from.
pub enum Source {
    File {
        backing: Arc<dyn FileBacking>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    },
    Swap {
        slot: SwapSlot,
    },
    Mmap {
        backing: Arc<dyn FileBacking>,
        map_id: u32,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    },
}

/// One supplemental page table entry, per §3.
pub struct SptEntry {
    pub uaddr: usize,
    pub source: Source,
    flags: EntryFlags,
}

impl SptEntry {
    pub fn writable(&self) -> bool {
        self.flags.contains(EntryFlags::WRITABLE)
    }

    pub fn loaded(&self) -> bool {
        self.flags.contains(EntryFlags::LOADED)
    }

    pub fn pinned(&self) -> bool {
        self.flags.contains(EntryFlags::PINNED)
    }

    fn accessed(&self) -> bool {
        self.flags.contains(EntryFlags::ACCESSED)
    }

    fn dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }

    fn set(&mut self, bit: EntryFlags, value: bool) {
        self.flags.set(bit, value);
    }
}

/// One page of a logical `mmap` call, per §3's "Memory-map record".
pub struct MmapRecord {
    pub map_id: u32,
    pub uaddr: usize,
}

struct Inner {
    entries: HashMap<usize, SptEntry>,
    page_table: HashMap<usize, FrameHandle>,
    mmap_records: Vec<MmapRecord>,
    stack_top: usize,
}

/// A thread's supplemental page table. Accessed only by its owning thread
/// and by the frame-eviction path, per §5.
pub struct Spt<A: PhysicalAllocator> {
    thread: ThreadId,
    frames: Arc<FrameTable<A>>,
    swap: Arc<SwapArea>,
    inner: Mutex<Inner>,
}

impl<A: PhysicalAllocator + 'static> Spt<A> {
    pub fn new(thread: ThreadId, frames: Arc<FrameTable<A>>, swap: Arc<SwapArea>, stack_top: usize) -> Arc<Self> {
        Arc::new(Spt {
            thread,
            frames,
            swap,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                page_table: HashMap::new(),
                mmap_records: Vec::new(),
                stack_top,
            }),
        })
    }

    pub fn insert_file(
        &self,
        uaddr: usize,
        backing: Arc<dyn FileBacking>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        self.insert(uaddr, Source::File { backing, offset, read_bytes, zero_bytes }, writable);
    }

    pub fn insert_mmap(
        &self,
        uaddr: usize,
        map_id: u32,
        backing: Arc<dyn FileBacking>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) {
        self.insert(
            uaddr,
            Source::Mmap { backing, map_id, offset, read_bytes, zero_bytes },
            true,
        );
        let mut inner = self.inner.lock().unwrap();
        inner.mmap_records.push(MmapRecord { map_id, uaddr });
    }

    fn insert(&self, uaddr: usize, source: Source, writable: bool) {
        let mut flags = EntryFlags::empty();
        flags.set(EntryFlags::WRITABLE, writable);
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(uaddr, SptEntry { uaddr, source, flags });
    }

    /// §4.4 `load`: the fault-time materialiser. Allocates a frame (which
    /// may evict), fills it from the entry's source, installs the mapping,
    /// marks the entry loaded, and clears pinned.
    pub fn load(self: &Arc<Self>, uaddr: usize) -> Result<()> {
        let owner: Weak<dyn PageOwner> = Arc::downgrade(self) as Weak<dyn PageOwner>;
        {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.entries.get_mut(&uaddr).expect("load of unmapped uaddr");
            entry.set(EntryFlags::PINNED, true);
        }

        let handle = self.frames.alloc(self.thread, uaddr, owner);
        let mut page = [0u8; PAGE_SIZE];
        {
            let inner = self.inner.lock().unwrap();
            let entry = inner.entries.get(&uaddr).unwrap();
            match &entry.source {
                Source::File { backing, offset, read_bytes, .. }
                | Source::Mmap { backing, offset, read_bytes, .. } => {
                    backing.read_at(&mut page[..*read_bytes], *offset);
                }
                Source::Swap { slot } => {
                    self.swap.read(*slot, &mut page);
                }
            }
        }
        self.frames.write(&handle, &page);

        let mut inner = self.inner.lock().unwrap();
        inner.page_table.insert(uaddr, handle);
        let entry = inner.entries.get_mut(&uaddr).unwrap();
        entry.set(EntryFlags::LOADED, true);
        entry.set(EntryFlags::PINNED, false);
        entry.set(EntryFlags::ACCESSED, true);
        log::trace!("spt: loaded uaddr={:#x} for thread {}", uaddr, self.thread);
        Ok(())
    }

    /// §4.4 `grow_stack`: install a fresh zeroed page when `uaddr` is
    /// within [`STACK_GROWTH_SLACK`] bytes below `rsp` and the resulting
    /// stack would stay within [`MAX_STACK_SIZE`].
    pub fn grow_stack(self: &Arc<Self>, uaddr: usize, rsp: usize) -> Result<()> {
        let page_uaddr = uaddr & !(PAGE_SIZE - 1);
        if uaddr + STACK_GROWTH_SLACK < rsp {
            return Err(Error::BadUserPointer(uaddr));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            let stack_size = inner.stack_top.saturating_sub(page_uaddr);
            if stack_size > MAX_STACK_SIZE {
                log::warn!("spt: stack growth past the {}-byte limit rejected", MAX_STACK_SIZE);
                return Err(Error::BadUserPointer(uaddr));
            }
            inner.entries.insert(
                page_uaddr,
                SptEntry {
                    uaddr: page_uaddr,
                    // A fresh stack page has no swap contents yet; slot 0
                    // is never read since LOADED is set directly below
                    // instead of routing through `load`'s swap-read path.
                    source: Source::Swap { slot: 0 },
                    flags: EntryFlags::WRITABLE,
                },
            );
        }
        let owner: Weak<dyn PageOwner> = Arc::downgrade(self) as Weak<dyn PageOwner>;
        let handle = self.frames.alloc(self.thread, page_uaddr, owner);
        let mut inner = self.inner.lock().unwrap();
        inner.page_table.insert(page_uaddr, handle);
        let entry = inner.entries.get_mut(&page_uaddr).unwrap();
        entry.set(EntryFlags::LOADED, true);
        entry.set(EntryFlags::ACCESSED, true);
        Ok(())
    }

    /// §4.7 pointer validation: `uaddr` is valid if it is non-null, below
    /// [`USER_BASE`], and either already mapped in this table or within
    /// [`STACK_GROWTH_SLACK`] bytes below `rsp` (so it qualifies for
    /// [`Spt::grow_stack`] instead). A `write` access additionally
    /// requires the mapped entry, if any, to be writable.
    pub fn validate_pointer(&self, uaddr: usize, rsp: usize, write: bool) -> bool {
        if uaddr == 0 || uaddr >= USER_BASE {
            return false;
        }
        let page_uaddr = uaddr & !(PAGE_SIZE - 1);
        let inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get(&page_uaddr) {
            return !write || entry.writable();
        }
        drop(inner);
        uaddr + STACK_GROWTH_SLACK >= rsp
    }

    /// §4.7 buffer validation: walk `len` bytes starting at `addr` one
    /// page at a time, validating each page touched and faulting it in
    /// via [`Spt::load`] so the caller can dereference the whole range
    /// afterward without a further fault.
    pub fn validate_buffer(self: &Arc<Self>, addr: usize, len: usize, rsp: usize, write: bool) -> bool {
        if len == 0 {
            return self.validate_pointer(addr, rsp, write);
        }
        let end = addr.saturating_add(len);
        let mut page_uaddr = addr & !(PAGE_SIZE - 1);
        loop {
            if !self.validate_pointer(page_uaddr, rsp, write) {
                return false;
            }
            if !self.is_loaded(page_uaddr) && self.load(page_uaddr).is_err() {
                return false;
            }
            page_uaddr += PAGE_SIZE;
            if page_uaddr >= end {
                return true;
            }
        }
    }

    /// §4.7 string validation: scan forward from `addr` one byte at a
    /// time for a NUL terminator, faulting in whichever page currently
    /// covers the cursor, and validating every byte's address along the
    /// way. Fails closed at `max_len` so an unterminated string can't spin
    /// forever.
    pub fn validate_string(self: &Arc<Self>, addr: usize, rsp: usize, max_len: usize) -> bool {
        let mut uaddr = addr;
        let mut loaded_page = None;
        let mut page = [0u8; PAGE_SIZE];
        for _ in 0..max_len {
            if !self.validate_pointer(uaddr, rsp, false) {
                return false;
            }
            let page_uaddr = uaddr & !(PAGE_SIZE - 1);
            if loaded_page != Some(page_uaddr) {
                if !self.is_loaded(page_uaddr) && self.load(page_uaddr).is_err() {
                    return false;
                }
                let inner = self.inner.lock().unwrap();
                let Some(handle) = inner.page_table.get(&page_uaddr) else { return false };
                self.frames.read(handle, &mut page);
                drop(inner);
                loaded_page = Some(page_uaddr);
            }
            if page[uaddr - page_uaddr] == 0 {
                return true;
            }
            uaddr += 1;
        }
        false
    }

    /// Write one byte at `offset` within the page mapping `uaddr`'s frame,
    /// the in-scope half of a user store instruction (the CPU/MMU that
    /// would normally perform this directly against mapped physical memory
    /// is out of scope per §1; this is what it would call through once the
    /// fault, if any, has already been resolved by [`Spt::load`]). Sets the
    /// entry's dirty bit itself, the way a real MMU's store would, so a
    /// caller never needs a separate `mark_dirty` to make the write
    /// survive eviction or `munmap`'s writeback.
    pub fn write_byte(&self, uaddr: usize, offset: usize, value: u8) {
        let mut inner = self.inner.lock().unwrap();
        let Some(handle) = inner.page_table.get(&uaddr) else { return };
        let mut page = [0u8; PAGE_SIZE];
        self.frames.read(handle, &mut page);
        page[offset] = value;
        self.frames.write(handle, &page);
        if let Some(entry) = inner.entries.get_mut(&uaddr) {
            entry.set(EntryFlags::DIRTY, true);
        }
    }

    pub fn mark_accessed(&self, uaddr: usize) {
        if let Some(entry) = self.inner.lock().unwrap().entries.get_mut(&uaddr) {
            entry.set(EntryFlags::ACCESSED, true);
        }
    }

    pub fn mark_dirty(&self, uaddr: usize) {
        if let Some(entry) = self.inner.lock().unwrap().entries.get_mut(&uaddr) {
            entry.set(EntryFlags::DIRTY, true);
        }
    }

    pub fn is_loaded(&self, uaddr: usize) -> bool {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&uaddr)
            .map(|e| e.loaded())
            .unwrap_or(false)
    }

    pub fn is_pinned(&self, uaddr: usize) -> bool {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&uaddr)
            .map(|e| e.pinned())
            .unwrap_or(false)
    }

    /// `munmap`: write back dirty pages of `map_id` to their source file,
    /// free their frames, and remove their records.
    pub fn munmap(&self, map_id: u32) {
        let uaddrs: Vec<usize> = {
            let inner = self.inner.lock().unwrap();
            inner
                .mmap_records
                .iter()
                .filter(|r| r.map_id == map_id)
                .map(|r| r.uaddr)
                .collect()
        };
        for uaddr in uaddrs {
            self.unload_and_free(uaddr, true);
            self.inner.lock().unwrap().mmap_records.retain(|r| r.uaddr != uaddr);
            self.inner.lock().unwrap().entries.remove(&uaddr);
        }
        log::debug!("spt: munmap id={} released", map_id);
    }

    /// Destroy-on-exit: walk every entry, freeing loaded frames and writing
    /// back dirty mmap pages first.
    pub fn destroy(&self) {
        let uaddrs: Vec<usize> = self.inner.lock().unwrap().entries.keys().copied().collect();
        for uaddr in uaddrs {
            self.unload_and_free(uaddr, true);
        }
        self.frames.free_for_thread(self.thread);
    }

    fn unload_and_free(&self, uaddr: usize, writeback: bool) {
        let handle = self.inner.lock().unwrap().page_table.remove(&uaddr);
        let Some(handle) = handle else { return };
        if writeback {
            let mut bytes = [0u8; PAGE_SIZE];
            self.frames.read(&handle, &mut bytes);
            let inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.entries.get(&uaddr) {
                if entry.dirty() {
                    if let Source::Mmap { backing, offset, read_bytes, .. } = &entry.source {
                        backing.write_at(&bytes[..*read_bytes], *offset);
                    }
                }
            }
        }
        self.frames.free(handle);
        if let Some(entry) = self.inner.lock().unwrap().entries.get_mut(&uaddr) {
            entry.set(EntryFlags::LOADED, false);
        }
    }
}

impl<A: PhysicalAllocator> PageOwner for Spt<A> {
    fn pinned(&self, uaddr: usize) -> bool {
        self.inner.lock().unwrap().entries.get(&uaddr).map(|e| e.pinned()).unwrap_or(true)
    }

    fn accessed(&self, uaddr: usize) -> bool {
        self.inner.lock().unwrap().entries.get(&uaddr).map(|e| e.accessed()).unwrap_or(false)
    }

    fn dirty(&self, uaddr: usize) -> bool {
        self.inner.lock().unwrap().entries.get(&uaddr).map(|e| e.dirty()).unwrap_or(false)
    }

    fn clear_accessed(&self, uaddr: usize) {
        if let Some(entry) = self.inner.lock().unwrap().entries.get_mut(&uaddr) {
            entry.set(EntryFlags::ACCESSED, false);
        }
    }

    fn evict(&self, uaddr: usize, bytes: &[u8; PAGE_SIZE]) {
        let mut inner = self.inner.lock().unwrap();
        inner.page_table.remove(&uaddr);
        let Some(entry) = inner.entries.get_mut(&uaddr) else { return };
        let dirty = entry.dirty();
        match &entry.source {
            Source::Mmap { backing, offset, read_bytes, .. } => {
                if dirty {
                    backing.write_at(&bytes[..*read_bytes], *offset);
                }
            }
            Source::File { .. } => {
                if dirty {
                    let slot = self.swap.write(bytes);
                    entry.source = Source::Swap { slot };
                } // clean FILE pages are simply discarded
            }
            Source::Swap { .. } => {
                let slot = self.swap.write(bytes);
                entry.source = Source::Swap { slot };
            }
        }
        entry.set(EntryFlags::LOADED, false);
        entry.set(EntryFlags::ACCESSED, false);
        entry.set(EntryFlags::DIRTY, false);
        log::trace!("spt: evicted uaddr={:#x}", uaddr);
    }
}
