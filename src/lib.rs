//! Storage and memory kernel core for a small teaching operating system:
//! a fixed-capacity write-back buffer cache (`cache`) over a
//! sector-addressed block device (`device`), a multi-level indexed-inode
//! file system (`fs`), a demand-paged virtual memory layer (`vm`, `swap`),
//! and the per-thread ownership that ties them together (`fd`).
//! Synchronization primitives live in `sync`, named constants in `config`,
//! and the crate-wide error type in `error`.
//!
//! One subsystem per top-level module, each owning its own lock(s) rather
//! than a single kernel-wide lock, with explicit `init()`/`shutdown()`
//! entry points on the singletons that run background threads.

pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod fd;
pub mod fs;
pub mod swap;
pub mod sync;
pub mod vm;

use cache::BufferCache;
use config::Limits;
use device::BlockDevice;
use fd::{Console, Process};
use fs::FileSystem;
use std::sync::Arc;
use swap::SwapArea;
use vm::frame::{FrameTable, PhysicalAllocator};
use vm::{Spt, ThreadId};

/// The process-wide singletons this crate's subsystems need: the buffer
/// cache, the file system built over it, the frame table, and the swap
/// area. Constructed once via [`Storage::init`] and torn down via
/// [`Storage::shutdown`], per §9's Design Notes on explicit entry points.
pub struct Storage<D: BlockDevice, A: PhysicalAllocator> {
    pub cache: Arc<BufferCache<D>>,
    pub fs: Arc<FileSystem<D>>,
    pub frames: Arc<FrameTable<A>>,
    pub swap: Arc<SwapArea>,
}

impl<D: BlockDevice + 'static, A: PhysicalAllocator + 'static> Storage<D, A> {
    /// Bring up the cache, file system, frame table, and swap area over
    /// `disk` and `swap_disk`. `fs_reserved` names sectors (boot, root
    /// directory, free-map metadata) the free-sector map must never hand
    /// out; `allocator` backs the frame table's physical pages.
    pub fn init(
        disk: Arc<D>,
        disk_sectors: u32,
        fs_reserved: &[u32],
        swap_disk: Arc<dyn BlockDevice>,
        allocator: Arc<A>,
        limits: Limits,
    ) -> Self {
        log::info!(
            "storage: starting with {} cache slots, {} swap slots",
            limits.cache_capacity,
            limits.swap_slots
        );
        let cache = BufferCache::new(disk, limits.cache_capacity);
        let fs = Arc::new(FileSystem::new(cache.clone(), disk_sectors, fs_reserved));
        let frames = Arc::new(FrameTable::new(allocator));
        let swap = Arc::new(SwapArea::new(swap_disk, limits.swap_slots));
        Storage { cache, fs, frames, swap }
    }

    /// Build a fresh per-thread [`Process`] (fd table + SPT + cwd handle)
    /// bound to this storage core's singletons.
    pub fn new_process(
        &self,
        thread: ThreadId,
        console: Option<Arc<dyn Console>>,
        cwd: u32,
        stack_top: usize,
    ) -> Process<D, A> {
        let spt = Spt::new(thread, self.frames.clone(), self.swap.clone(), stack_top);
        Process::new(self.fs.clone(), spt, console, cwd)
    }

    /// Flush the cache and stop its background threads. Does not touch
    /// in-flight per-thread [`Process`] state; callers should call
    /// [`Process::exit`] on every live process first.
    pub fn shutdown(&self) {
        log::info!("storage: shutting down");
        self.cache.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::fs::inode::FileType;
    use crate::vm::frame::PoolAllocator;

    fn storage() -> Storage<MemBlockDevice, PoolAllocator> {
        let disk = Arc::new(MemBlockDevice::new(40_000));
        let swap_disk: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(64 * config::SECTORS_PER_PAGE as u32));
        let allocator = Arc::new(PoolAllocator::new(16));
        Storage::init(disk, 40_000, &[0, 1], swap_disk, allocator, Limits::default())
    }

    #[test]
    fn a_process_can_create_write_and_read_back_a_file() {
        let storage = storage();
        let process = storage.new_process(1, None, config::ROOT_DIR_SECTOR, 0x8000_0000);
        let sector = storage.fs.create(FileType::File).unwrap();
        let fd = process.fds.open(sector).unwrap();
        process.fds.write(fd, b"hello, disk").unwrap();
        process.fds.seek(fd, 0).unwrap();
        let mut out = [0u8; 11];
        let n = process.fds.read(fd, &mut out).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&out, b"hello, disk");
        process.exit();
        storage.shutdown();
    }

    #[test]
    fn mmap_then_munmap_writes_back_through_to_the_file() {
        let storage = storage();
        let process = storage.new_process(1, None, config::ROOT_DIR_SECTOR, 0x8000_0000);
        let sector = storage.fs.create(FileType::File).unwrap();
        let fd = process.fds.open(sector).unwrap();
        process.fds.write(fd, &[0u8; 4096]).unwrap();

        let map_addr = 0x0100_0000usize;
        let map_id = process.mmap(fd, map_addr).unwrap();
        process.spt.load(map_addr).unwrap();
        process.spt.mark_dirty(map_addr);
        process.munmap(map_id);

        process.fds.seek(fd, 0).unwrap();
        let mut out = [0u8; 4096];
        process.fds.read(fd, &mut out).unwrap();
        process.exit();
        storage.shutdown();
    }
}
