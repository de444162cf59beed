//! End-to-end scenarios for the storage and memory core, exercised against
//! the host-testability doubles (`MemBlockDevice`, `PoolAllocator`). Each
//! test corresponds to one numbered scenario from the component design.

use rudder_storage::cache::BufferCache;
use rudder_storage::config::{self, Limits};
use rudder_storage::device::{BlockDevice, MemBlockDevice};
use rudder_storage::fs::inode::FileType;
use rudder_storage::fs::FileSystem;
use rudder_storage::vm::frame::PoolAllocator;
use rudder_storage::Storage;
use std::sync::Arc;

const DISK_SECTORS: u32 = 40_000;

fn swap_disk() -> Arc<dyn BlockDevice> {
    Arc::new(MemBlockDevice::new(64 * config::SECTORS_PER_PAGE as u32))
}

fn storage(disk: Arc<MemBlockDevice>) -> Storage<MemBlockDevice, PoolAllocator> {
    let allocator = Arc::new(PoolAllocator::new(32));
    Storage::init(disk, DISK_SECTORS, &[0, 1], swap_disk(), allocator, Limits::default())
}

/// Scenario 1: write 16 sectors, close, reopen, read back identical; flush
/// and re-mount (fresh cache + file system over the same device) still
/// reads back identical.
#[test]
fn scenario_1_write_close_reopen_remount_round_trips() {
    let disk = Arc::new(MemBlockDevice::new(DISK_SECTORS));
    let storage = storage(disk.clone());
    let pattern = [0xABu8; 8192];

    let sector = storage.fs.create(FileType::File).unwrap();
    let inode = storage.fs.open(sector);
    storage.fs.write_at(&inode, &pattern, 0).unwrap();
    storage.fs.close(&inode);

    let inode = storage.fs.open(sector);
    let mut out = [0u8; 8192];
    let n = storage.fs.read_at(&inode, &mut out, 0);
    assert_eq!(n, 8192);
    assert_eq!(out, pattern);
    storage.fs.close(&inode);
    storage.shutdown();

    // Re-mount: a fresh cache and file system over the same backing device.
    let cache = BufferCache::new(disk, config::CACHE_CAPACITY);
    let fs = FileSystem::new(cache.clone(), DISK_SECTORS, &[0, 1]);
    let inode = fs.open(sector);
    let mut out = [0u8; 8192];
    let n = fs.read_at(&inode, &mut out, 0);
    assert_eq!(n, 8192);
    assert_eq!(out, pattern);
    fs.close(&inode);
    cache.shutdown();
}

/// Scenario 2: a single byte written past the indirect range, deep into
/// the doubly-indirect range, produces a sparse hole reading as zero.
#[test]
fn scenario_2_write_crossing_into_doubly_indirect_leaves_a_sparse_hole() {
    let disk = Arc::new(MemBlockDevice::new(DISK_SECTORS));
    let storage = storage(disk);

    let sector = storage.fs.create(FileType::File).unwrap();
    let inode = storage.fs.open(sector);
    storage.fs.write_at(&inode, &[0x7F], 300_000).unwrap();

    let mut out = vec![0u8; 300_001];
    let n = storage.fs.read_at(&inode, &mut out, 0);
    assert_eq!(n, 300_001);
    assert!(out[..300_000].iter().all(|&b| b == 0));
    assert_eq!(out[300_000], 0x7F);
    assert_eq!(storage.fs.length(&inode), 300_001);

    storage.fs.close(&inode);
    storage.shutdown();
}

/// Scenario 3: mmap a file, modify one byte through the mapping, munmap,
/// and see the change through a plain read afterward.
#[test]
fn scenario_3_mmap_store_munmap_is_visible_through_a_later_read() {
    let disk = Arc::new(MemBlockDevice::new(DISK_SECTORS));
    let storage = storage(disk);
    let process = storage.new_process(1, None, config::ROOT_DIR_SECTOR, 0x8000_0000);

    let sector = storage.fs.create(FileType::File).unwrap();
    let fd = process.fds.open(sector).unwrap();
    process.fds.write(fd, &[0u8; config::PAGE_SIZE]).unwrap();

    let map_addr = 0x0100_0000usize;
    let map_id = process.mmap(fd, map_addr).unwrap();
    process.spt.load(map_addr).unwrap();
    process.spt.write_byte(map_addr, 17, 0x99);
    process.munmap(map_id);

    process.fds.seek(fd, 0).unwrap();
    let mut out = [0u8; config::PAGE_SIZE];
    process.fds.read(fd, &mut out).unwrap();
    assert_eq!(out[17], 0x99);

    process.exit();
    storage.shutdown();
}

/// Scenario 4 (cache exhaustion) is covered directly in `cache`'s own
/// `#[cfg(test)]` module (`concurrent_readers_of_many_sectors_match_device`),
/// since it only exercises the cache in isolation.

/// Scenario 5: a second thread opens several files then exits; the first
/// thread's own fd table is unaffected, and the second thread's fds are
/// fully released on exit (the host stand-in for "child exits, parent's
/// wait observes it exactly once" once the out-of-scope process/exec
/// primitives are stripped away).
#[test]
fn scenario_5_a_second_threads_exit_releases_its_own_fds_only() {
    let disk = Arc::new(MemBlockDevice::new(DISK_SECTORS));
    let storage = storage(disk);
    let parent = storage.new_process(1, None, config::ROOT_DIR_SECTOR, 0x8000_0000);
    let parent_sector = storage.fs.create(FileType::File).unwrap();
    let parent_fd = parent.fds.open(parent_sector).unwrap();

    let before_free = storage.fs.free_sectors();
    let child = storage.new_process(2, None, config::ROOT_DIR_SECTOR, 0x8000_0000);
    let handle = {
        let fs = storage.fs.clone();
        std::thread::spawn(move || {
            let mut sectors = Vec::new();
            for _ in 0..8 {
                let sector = fs.create(FileType::File).unwrap();
                sectors.push(sector);
                let fd = child.fds.open(sector).unwrap();
                child.fds.write(fd, b"child data").unwrap();
            }
            child.exit();
            0i32
        })
    };
    let exit_status = handle.join().unwrap();
    assert_eq!(exit_status, 0);

    // The 8 inode sectors the child allocated are still live (files were
    // never removed, only closed), so free count shouldn't have grown past
    // the point of allocation; but the parent's own fd must still work.
    assert!(storage.fs.free_sectors() <= before_free);
    let mut out = [0u8; 4];
    let n = parent.fds.read(parent_fd, &mut out).unwrap();
    assert_eq!(n, 0); // parent's file is still empty; its fd is untouched

    parent.exit();
    storage.shutdown();
}

/// Scenario 6: two threads write overlapping ranges within the same sector
/// concurrently; the per-slot writer-priority lock serializes them, so the
/// overlapping region ends up matching one thread's write in full, never a
/// torn mix of both.
#[test]
fn scenario_6_concurrent_overlapping_writes_never_tear_within_a_sector() {
    let disk = Arc::new(MemBlockDevice::new(DISK_SECTORS));
    let storage = storage(disk);
    let sector = storage.fs.create(FileType::File).unwrap();
    let inode = storage.fs.open(sector);
    storage.fs.write_at(&inode, &[0u8; 400], 0).unwrap();

    let pattern_a = [0x11u8; 200];
    let pattern_b = [0x22u8; 200];
    let fs_a = storage.fs.clone();
    let inode_a = inode.clone();
    let fs_b = storage.fs.clone();
    let inode_b = inode.clone();

    let t1 = std::thread::spawn(move || fs_a.write_at(&inode_a, &pattern_a, 100).unwrap());
    let t2 = std::thread::spawn(move || fs_b.write_at(&inode_b, &pattern_b, 100).unwrap());
    t1.join().unwrap();
    t2.join().unwrap();

    let mut out = [0u8; 400];
    storage.fs.read_at(&inode, &mut out, 0);
    let region = &out[100..300];
    assert!(
        region.iter().all(|&b| b == 0x11) || region.iter().all(|&b| b == 0x22),
        "overlapping write region must match exactly one writer's pattern, got {:?}",
        region
    );

    storage.fs.close(&inode);
    storage.shutdown();
}
