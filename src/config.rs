//! Named constants for the storage and memory core: one file of plain
//! `const`s rather than a build-time config system, since every value here
//! is fixed by the on-disk format or this crate's own design and none of it
//! varies between runs.

/// Bytes per block-device sector.
pub const SECTOR_SIZE: usize = 512;

/// Bytes per virtual-memory page.
pub const PAGE_SIZE: usize = 4096;

/// Sectors per page; also the size in sectors of one swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Number of slots in the buffer cache.
pub const CACHE_CAPACITY: usize = 64;

cfg_if::cfg_if! {
    if #[cfg(test)] {
        /// Milliseconds between background flush passes. Shortened under
        /// `cfg(test)` so tests that exercise the background thread don't
        /// have to wait out the production interval.
        pub const FLUSH_INTERVAL_MS: u64 = 50;
    } else {
        /// Milliseconds between background flush passes.
        pub const FLUSH_INTERVAL_MS: u64 = 30_000;
    }
}

/// Direct sector numbers stored inline in an on-disk inode. Chosen so that
/// `length + magic + type + sectors[N_DIRECT] + indirect + double_indirect`
/// packs to exactly `SECTOR_SIZE` bytes (20 header bytes + 123 * 4 = 512).
pub const N_DIRECT: usize = 123;

/// Sector numbers per indirect block (`SECTOR_SIZE / size_of::<u32>()`).
pub const N_PER_INDIRECT: usize = SECTOR_SIZE / 4;

/// Largest byte offset addressable by an inode's direct/indirect/doubly
/// indirect sector arrays.
pub const MAX_FILE_SECTORS: usize = N_DIRECT + N_PER_INDIRECT + N_PER_INDIRECT * N_PER_INDIRECT;

/// Fixed magic value identifying a valid on-disk inode.
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Sentinel value marking an unallocated sector pointer on disk.
pub const INVALID_SECTOR_RAW: u32 = u32::MAX;

/// Sector reserved by convention for boot/free-map bookkeeping.
pub const BOOT_SECTOR: u32 = 0;

/// Fixed sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Byte distance below the stack pointer that still qualifies a fault for
/// stack growth.
pub const STACK_GROWTH_SLACK: usize = 32;

/// Largest total size the user stack is allowed to grow to.
pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Lowest user-space virtual address; addresses at or above this are kernel
/// space and always invalid for a user-supplied pointer.
pub const USER_BASE: usize = 0x0804_8000;

/// Reserved file descriptor numbers.
pub const FD_STDIN: i32 = 0;
pub const FD_STDOUT: i32 = 1;
pub const FD_FIRST_FREE: i32 = 2;

/// Largest number of descriptors one thread's fd table may hold open at
/// once (a classic kernel's equivalent limit is usually called `NOFILE`).
pub const MAX_OPEN_FILES: usize = 128;

/// Longest file name a directory entry can hold, matching the Pintos
/// on-disk directory-entry layout this crate's directories use.
pub const NAME_MAX: usize = 14;

/// Size in bytes of one on-disk directory entry: a sector number, a
/// NUL-padded name, and an in-use flag.
pub const DIRENT_SIZE: usize = 4 + (NAME_MAX + 1) + 1;

/// Runtime-tunable limits a host test harness may want to vary; production
/// glue uses [`Limits::default`].
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Number of slots in the buffer cache. Defaults to [`CACHE_CAPACITY`].
    pub cache_capacity: usize,
    /// Number of page-sized slots available on the swap device.
    pub swap_slots: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            cache_capacity: CACHE_CAPACITY,
            swap_slots: 256,
        }
    }
}
