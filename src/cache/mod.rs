//! Fixed-capacity write-back buffer cache over a [`BlockDevice`]: one lock
//! protecting sector→slot lookup, per-slot read/write synchronization, a
//! background flush thread, and the advance-then-inspect clock-eviction
//! cursor discipline of §4.1. Slots are plain `Vec`-indexed entries behind a
//! writer-priority [`crate::sync::RwLock`] rather than an unsafe
//! reference-counted arena: that machinery exists in `no_std` kernels to
//! make buffer reuse sound without a GC, a problem this crate does not have
//! running on a hosted allocator, so the functional design (global lookup
//! lock, per-slot read/write exclusion, clock-style second-chance eviction,
//! background flush, background read-ahead) is kept and the unsafe
//! recycling is not.

mod clock;
mod slot;

use crate::config::SECTOR_SIZE;
use crate::device::BlockDevice;
use slot::Slot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clock::Clock;

/// The fixed-capacity buffer cache described in §4.1.
pub struct BufferCache<D: BlockDevice> {
    device: Arc<D>,
    slots: Vec<Slot>,
    clock: Mutex<Clock>,
    read_ahead_tx: Mutex<Option<mpsc::Sender<u32>>>,
    stop: Arc<AtomicBool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: BlockDevice + 'static> BufferCache<D> {
    /// Build a cache of `capacity` slots and start its background flush and
    /// read-ahead threads. Mirrors the "explicit `init()`" entry point
    /// called for in §9's Design Notes.
    pub fn new(device: Arc<D>, capacity: usize) -> Arc<Self> {
        let slots = (0..capacity).map(|_| Slot::new()).collect();
        let (tx, rx) = mpsc::channel::<u32>();
        let stop = Arc::new(AtomicBool::new(false));

        let cache = Arc::new(BufferCache {
            device,
            slots,
            clock: Mutex::new(Clock::new(capacity)),
            read_ahead_tx: Mutex::new(Some(tx)),
            stop,
            background: Mutex::new(Vec::new()),
        });

        let flush_weak: Weak<Self> = Arc::downgrade(&cache);
        let flush_stop = cache.stop.clone();
        let flush_handle = thread::spawn(move || {
            while !flush_stop.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(crate::config::FLUSH_INTERVAL_MS));
                match flush_weak.upgrade() {
                    Some(cache) => cache.flush(),
                    None => break,
                }
            }
        });

        let readahead_weak: Weak<Self> = Arc::downgrade(&cache);
        let readahead_handle = thread::spawn(move || {
            for sector in rx {
                match readahead_weak.upgrade() {
                    Some(cache) => {
                        let mut scratch = [0u8; SECTOR_SIZE];
                        cache.read(sector, &mut scratch);
                    }
                    None => break,
                }
            }
        });

        {
            let mut background = cache.background.lock().unwrap();
            background.push(flush_handle);
            background.push(readahead_handle);
        }
        cache
    }

    /// Copy the full contents of `sector` into `dst`, loading it from the
    /// device on a cache miss.
    pub fn read(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE]) {
        let idx = self.lookup_or_evict(sector);
        let _guard = self.slots[idx].rw.read();
        let mut data = self.slots[idx].data.lock().unwrap();
        data.reserved = false;
        self.load_if_absent(sector, &mut data);
        dst.copy_from_slice(&data.buf);
        data.accessed = true;
    }

    /// Copy `len` bytes starting at `offset` within `sector` into `dst`.
    pub fn read_partial(&self, sector: u32, dst: &mut [u8], offset: usize, len: usize) {
        let idx = self.lookup_or_evict(sector);
        let _guard = self.slots[idx].rw.read();
        let mut data = self.slots[idx].data.lock().unwrap();
        data.reserved = false;
        self.load_if_absent(sector, &mut data);
        dst[..len].copy_from_slice(&data.buf[offset..offset + len]);
        data.accessed = true;
    }

    /// Overwrite the full contents of `sector`. `src = None` zero-fills the
    /// sector. Marks the slot dirty; no device write happens here.
    pub fn write(&self, sector: u32, src: Option<&[u8; SECTOR_SIZE]>) {
        let idx = self.lookup_or_evict(sector);
        let _guard = self.slots[idx].rw.write();
        let mut data = self.slots[idx].data.lock().unwrap();
        data.reserved = false;
        match src {
            Some(bytes) => data.buf.copy_from_slice(bytes),
            None => data.buf = [0u8; SECTOR_SIZE],
        }
        data.sector = Some(sector);
        data.in_use = true;
        data.dirty = true;
        data.accessed = true;
    }

    /// Overwrite `len` bytes starting at `offset` within `sector`,
    /// read-modify-write style so the rest of the sector survives.
    /// `src = None` zero-fills the range.
    pub fn write_partial(&self, sector: u32, src: Option<&[u8]>, offset: usize, len: usize) {
        let idx = self.lookup_or_evict(sector);
        let _guard = self.slots[idx].rw.write();
        let mut data = self.slots[idx].data.lock().unwrap();
        data.reserved = false;
        self.load_if_absent(sector, &mut data);
        match src {
            Some(bytes) => data.buf[offset..offset + len].copy_from_slice(&bytes[..len]),
            None => data.buf[offset..offset + len].fill(0),
        }
        data.dirty = true;
        data.accessed = true;
    }

    /// Write back every dirty slot. Required for durability of any
    /// particular write, since ordinary writes never touch the device.
    pub fn flush(&self) {
        let mut flushed = 0u32;
        for slot in &self.slots {
            let mut data = slot.data.lock().unwrap();
            if data.dirty {
                if let Some(sector) = data.sector {
                    self.device.write(sector, &data.buf);
                    data.dirty = false;
                    flushed += 1;
                }
            }
        }
        if flushed > 0 {
            log::debug!("cache: flushed {} dirty slots", flushed);
        }
    }

    /// Non-blocking request to prefetch `sector` into the cache.
    pub fn request_read_ahead(&self, sector: u32) {
        if let Some(tx) = self.read_ahead_tx.lock().unwrap().as_ref() {
            let _ = tx.send(sector);
        }
    }

    /// Flush, stop the background threads, and join them. Mirrors the
    /// explicit `shutdown()` entry point called for in §9's Design Notes.
    pub fn shutdown(&self) {
        self.flush();
        self.stop.store(true, Ordering::Release);
        self.read_ahead_tx.lock().unwrap().take();
        let handles: Vec<_> = self.background.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn load_if_absent(&self, sector: u32, data: &mut slot::SlotData) {
        if !data.in_use {
            self.device.read(sector, &mut data.buf);
            data.sector = Some(sector);
            data.in_use = true;
        }
    }

    /// Resolve `sector` to a slot index, evicting if necessary. Implements
    /// §4.1's lookup/eviction algorithm under the single global cache lock.
    /// A freshly assigned slot is marked `reserved` before this function's
    /// caller ever sees the index, while the clock lock is still held, so
    /// no concurrent call can re-select it as empty or as a victim before
    /// the original caller pins it via `rw`.
    fn lookup_or_evict(&self, sector: u32) -> usize {
        loop {
            let mut clock = self.clock.lock().unwrap();
            if let Some(&idx) = clock.index_of.get(&sector) {
                return idx;
            }
            if let Some(idx) = self.first_empty_slot() {
                let mut data = self.slots[idx].data.lock().unwrap();
                data.sector = Some(sector);
                data.reserved = true;
                drop(data);
                clock.index_of.insert(sector, idx);
                return idx;
            }
            match self.find_victim(&mut clock) {
                Some(idx) => {
                    self.evict(&mut clock, idx, sector);
                    return idx;
                }
                // All slots are pinned (readers/writers/waiters active).
                // Loop until one becomes evictable, per §4.1's failure
                // semantics for this case.
                None => {
                    drop(clock);
                    thread::yield_now();
                }
            }
        }
    }

    fn first_empty_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| {
            let data = slot.data.lock().unwrap();
            data.sector.is_none() && !data.reserved
        })
    }

    /// Clock/second-chance scan, advance-then-inspect per §9 note (b): the
    /// cursor moves before a slot is examined, and is left one past the
    /// victim so the next eviction resumes there.
    fn find_victim(&self, clock: &mut Clock) -> Option<usize> {
        let capacity = self.slots.len();
        for _ in 0..2 * capacity {
            let i = clock.advance();
            let slot = &self.slots[i];
            if !slot.rw.is_idle() {
                continue;
            }
            let mut data = slot.data.lock().unwrap();
            if data.sector.is_none() || data.reserved {
                continue;
            }
            if data.accessed {
                data.accessed = false;
                continue;
            }
            return Some(i);
        }
        None
    }

    /// Reserve `idx` for `new_sector`: flush the outgoing sector if dirty,
    /// drop its `index_of` entry, and install the new mapping while `data`
    /// is marked `reserved` so no other lookup can claim this slot before
    /// the caller that requested `new_sector` pins it.
    fn evict(&self, clock: &mut Clock, idx: usize, new_sector: u32) {
        let mut data = self.slots[idx].data.lock().unwrap();
        if let Some(old_sector) = data.sector.take() {
            if data.dirty {
                log::trace!("cache: flushing dirty sector {} before eviction", old_sector);
                self.device.write(old_sector, &data.buf);
            }
            clock.index_of.remove(&old_sector);
        }
        data.dirty = false;
        data.in_use = false;
        data.accessed = false;
        data.sector = Some(new_sector);
        data.reserved = true;
        clock.index_of.insert(new_sector, idx);
    }
}

impl<D: BlockDevice> Drop for BufferCache<D> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.read_ahead_tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn small_cache(sectors: u32, capacity: usize) -> Arc<BufferCache<MemBlockDevice>> {
        BufferCache::new(Arc::new(MemBlockDevice::new(sectors)), capacity)
    }

    #[test]
    fn write_then_flush_then_read_round_trips() {
        let cache = small_cache(4, 2);
        let mut pattern = [0u8; SECTOR_SIZE];
        pattern.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        cache.write(1, Some(&pattern));
        cache.flush();
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(1, &mut out);
        assert_eq!(out, pattern);
        cache.shutdown();
    }

    #[test]
    fn eviction_preserves_dirty_contents() {
        // Capacity 1 forces every distinct sector access to evict.
        let cache = small_cache(3, 1);
        let mut a = [0xAAu8; SECTOR_SIZE];
        let mut b = [0xBBu8; SECTOR_SIZE];
        cache.write(0, Some(&a));
        cache.write(1, Some(&b)); // evicts sector 0, flushing it first
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(0, &mut out);
        assert_eq!(out, a);
        cache.read(1, &mut out);
        assert_eq!(out, b);
        let _ = (&mut a, &mut b);
        cache.shutdown();
    }

    #[test]
    fn write_partial_preserves_surrounding_bytes() {
        let cache = small_cache(2, 2);
        cache.write(0, Some(&[0x11u8; SECTOR_SIZE]));
        cache.write_partial(0, Some(&[0x22, 0x33]), 10, 2);
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(0, &mut out);
        assert_eq!(out[9], 0x11);
        assert_eq!(out[10], 0x22);
        assert_eq!(out[11], 0x33);
        assert_eq!(out[12], 0x11);
        cache.shutdown();
    }

    #[test]
    fn concurrent_readers_of_many_sectors_match_device() {
        let device = Arc::new(MemBlockDevice::new(100));
        for s in 0..100u32 {
            let mut buf = [0u8; SECTOR_SIZE];
            buf[0] = s as u8;
            device.write(s, &buf);
        }
        let cache = BufferCache::new(device.clone(), crate::config::CACHE_CAPACITY);
        let handles: Vec<_> = (0..100u32)
            .map(|s| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut out = [0u8; SECTOR_SIZE];
                    cache.read(s, &mut out);
                    out
                })
            })
            .collect();
        for (s, handle) in handles.into_iter().enumerate() {
            let out = handle.join().unwrap();
            let mut expect = [0u8; SECTOR_SIZE];
            device.read(s as u32, &mut expect);
            assert_eq!(out, expect);
        }
        cache.shutdown();
    }
}
