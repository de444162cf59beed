//! A single cache slot: a pinned `SECTOR_SIZE` buffer plus the bookkeeping
//! in §3's "Cache slot" data-model entry.

use crate::config::SECTOR_SIZE;
use crate::sync::RwLock;
use std::sync::Mutex;

/// The bytes and bookkeeping flags for one cache slot, guarded by a data
/// lock separate from the slot's reader/writer primitive so that the
/// memcpy/device-I/O critical section never nests inside the rw-lock's.
pub(super) struct SlotData {
    pub(super) sector: Option<u32>,
    pub(super) buf: [u8; SECTOR_SIZE],
    pub(super) dirty: bool,
    pub(super) in_use: bool,
    pub(super) accessed: bool,
    /// Set the instant a slot is handed to a `lookup_or_evict` caller,
    /// before the clock lock is released, and cleared by that caller once
    /// it holds the slot's `rw` lock. Keeps a second `lookup_or_evict` call
    /// from re-selecting this slot as empty or as a victim in the window
    /// between the clock lock being dropped and the original caller
    /// pinning the slot.
    pub(super) reserved: bool,
}

pub(super) struct Slot {
    /// Reader/writer accounting for this slot; also used by the eviction
    /// scan (`is_idle`) to skip slots with active readers, a writer, or
    /// waiters of either kind.
    pub(super) rw: RwLock<()>,
    pub(super) data: Mutex<SlotData>,
}

impl Slot {
    pub(super) fn new() -> Self {
        Slot {
            rw: RwLock::new(()),
            data: Mutex::new(SlotData {
                sector: None,
                buf: [0u8; SECTOR_SIZE],
                dirty: false,
                in_use: false,
                accessed: false,
                reserved: false,
            }),
        }
    }
}
