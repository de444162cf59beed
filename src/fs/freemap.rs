//! Persistent free-sector bitmap: one bit per sector, packed into `u64`
//! words, with `is_allocated`/`try_allocate`/`deallocate` operations. §3
//! requires the inode layer to hold this map
//! across the several sectors touched by a single `grow`/`shrink` so a
//! partial failure can roll back; callers get that by taking the
//! [`FreeMap`]'s lock once per call and batching allocations inside it via
//! [`FreeMap::allocate_one`] / [`FreeMap::release`].

use std::sync::Mutex;

struct Bitmap {
    words: Vec<u64>,
    total: u32,
}

impl Bitmap {
    fn new(total: u32) -> Self {
        let word_count = (total as usize + 63) / 64;
        let mut words = vec![u64::MAX; word_count];
        let bit_capacity = word_count * 64;
        for bit in total as usize..bit_capacity {
            words[bit / 64] &= !(1u64 << (bit % 64));
        }
        Bitmap { words, total }
    }

    fn mark_used(&mut self, sector: u32) {
        self.words[sector as usize / 64] &= !(1u64 << (sector % 64));
    }

    fn mark_free(&mut self, sector: u32) {
        self.words[sector as usize / 64] |= 1u64 << (sector % 64);
    }

    fn is_free(&self, sector: u32) -> bool {
        self.words[sector as usize / 64] & (1u64 << (sector % 64)) != 0
    }

    fn allocate_one(&mut self) -> Option<u32> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros();
                let sector = word_idx as u32 * 64 + bit;
                if sector >= self.total {
                    return None;
                }
                *word &= !(1u64 << bit);
                return Some(sector);
            }
        }
        None
    }

    fn free_count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

/// The process-wide free-sector bitmap, a singleton per §9's Design Notes.
pub struct FreeMap {
    bitmap: Mutex<Bitmap>,
}

impl FreeMap {
    /// `total` is the number of data sectors this map governs; sectors
    /// reserved for the boot sector, root directory, and free-map metadata
    /// itself should already be marked used by the caller via
    /// [`FreeMap::reserve`] before the file system starts handing out
    /// allocations.
    pub fn new(total: u32) -> Self {
        FreeMap {
            bitmap: Mutex::new(Bitmap::new(total)),
        }
    }

    /// Mark a specific sector as permanently used (for fixed sectors such
    /// as the boot sector or root directory inode).
    pub fn reserve(&self, sector: u32) {
        self.bitmap.lock().unwrap().mark_used(sector);
    }

    /// Allocate one free sector, or `None` if the map is exhausted.
    pub fn allocate_one(&self) -> Option<u32> {
        self.bitmap.lock().unwrap().allocate_one()
    }

    /// Allocate `n` sectors, or release anything already taken and return
    /// `None` if the map cannot satisfy the whole request. This is the
    /// building block `grow`'s rollback-on-failure semantics are built on.
    pub fn allocate_many(&self, n: usize) -> Option<Vec<u32>> {
        let mut bitmap = self.bitmap.lock().unwrap();
        let mut taken = Vec::with_capacity(n);
        for _ in 0..n {
            match bitmap.allocate_one() {
                Some(sector) => taken.push(sector),
                None => {
                    for sector in taken {
                        bitmap.mark_free(sector);
                    }
                    return None;
                }
            }
        }
        Some(taken)
    }

    pub fn release(&self, sector: u32) {
        self.bitmap.lock().unwrap().mark_free(sector);
    }

    pub fn release_many(&self, sectors: &[u32]) {
        let mut bitmap = self.bitmap.lock().unwrap();
        for &sector in sectors {
            bitmap.mark_free(sector);
        }
    }

    pub fn is_free(&self, sector: u32) -> bool {
        self.bitmap.lock().unwrap().is_free(sector)
    }

    pub fn free_count(&self) -> u32 {
        self.bitmap.lock().unwrap().free_count()
    }
}
