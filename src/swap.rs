//! Swap area: a dedicated block device treated as an array of page-sized
//! slots with a free-slot bitmap, per §4.2. The bitmap is the same
//! word-at-a-time representation [`crate::fs::freemap::FreeMap`] uses for
//! free sectors, reused here at page rather than sector granularity.

use crate::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};

/// Index of one page-sized swap slot.
pub type SwapSlot = u32;

struct Inner {
    free: Vec<u64>,
    slot_count: usize,
}

impl Inner {
    fn words_for(slots: usize) -> usize {
        (slots + 63) / 64
    }

    fn new(slot_count: usize) -> Self {
        let mut free = vec![u64::MAX; Self::words_for(slot_count)];
        // Clear the bits beyond slot_count in the final word so they never
        // look free.
        let total_bits = free.len() * 64;
        for bit in slot_count..total_bits {
            free[bit / 64] &= !(1u64 << (bit % 64));
        }
        Inner { free, slot_count }
    }

    fn allocate(&mut self) -> Option<SwapSlot> {
        for (word_idx, word) in self.free.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros() as usize;
                *word &= !(1u64 << bit);
                return Some((word_idx * 64 + bit) as SwapSlot);
            }
        }
        None
    }

    fn release(&mut self, slot: SwapSlot) {
        let slot = slot as usize;
        self.free[slot / 64] |= 1u64 << (slot % 64);
    }
}

/// A page-granularity swap area over a dedicated [`BlockDevice`]. All
/// operations hold a single swap lock, per §4.2. Holds the device as a
/// trait object rather than a generic parameter so it can be shared freely
/// between a [`crate::vm::Spt`] and anything else without infecting their
/// types with a swap-device type parameter.
pub struct SwapArea {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<Inner>,
}

impl SwapArea {
    pub fn new(device: Arc<dyn BlockDevice>, slot_count: usize) -> Self {
        SwapArea {
            device,
            inner: Mutex::new(Inner::new(slot_count)),
        }
    }

    /// Write one page out to a freshly allocated slot. Panics on exhaustion:
    /// swap running out is unrecoverable, per §7.
    pub fn write(&self, page: &[u8; PAGE_SIZE]) -> SwapSlot {
        let slot = {
            let mut inner = self.inner.lock().unwrap();
            inner.allocate().unwrap_or_else(|| {
                log::error!("swap exhausted: no free slots among {} total", inner.slot_count);
                panic!("swap exhausted: no free slots among {} total", inner.slot_count)
            })
        };
        self.write_to_slot(slot, page);
        slot
    }

    /// Fallible variant of [`SwapArea::write`] for callers that want to
    /// handle exhaustion themselves instead of panicking.
    pub fn try_write(&self, page: &[u8; PAGE_SIZE]) -> Result<SwapSlot> {
        let slot = {
            let mut inner = self.inner.lock().unwrap();
            inner.allocate().ok_or(Error::SwapExhausted)?
        };
        self.write_to_slot(slot, page);
        Ok(slot)
    }

    fn write_to_slot(&self, slot: SwapSlot, page: &[u8; PAGE_SIZE]) {
        let base = slot as u32 * SECTORS_PER_PAGE as u32;
        for i in 0..SECTORS_PER_PAGE {
            let mut sector_buf = [0u8; SECTOR_SIZE];
            sector_buf.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.device.write(base + i as u32, &sector_buf);
        }
    }

    /// Read a slot's contents into `page` and free the slot: callers that
    /// restore a swapped page take ownership of it thereafter.
    pub fn read(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) {
        let base = slot * SECTORS_PER_PAGE as u32;
        for i in 0..SECTORS_PER_PAGE {
            let mut sector_buf = [0u8; SECTOR_SIZE];
            self.device.read(base + i as u32, &mut sector_buf);
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector_buf);
        }
        self.inner.lock().unwrap().release(slot);
    }

    /// Mark a slot free without reading its contents.
    pub fn release(&self, slot: SwapSlot) {
        self.inner.lock().unwrap().release(slot);
    }
}
