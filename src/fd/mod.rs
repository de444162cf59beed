//! Thread-local ownership: the file-descriptor table, the mmap surface,
//! and the working-directory handle that §1(d) singles out as what ties
//! the cache, file system, and VM layers together for one thread. The
//! `open`/`close`/`read`/`write`/`seek`/`mmap`/`munmap` surface follows
//! §4.6/§4.7; [`MAX_OPEN_FILES`] is this table's equivalent of a classic
//! kernel's `NOFILE` limit.

use crate::config::{DIRENT_SIZE, FD_FIRST_FREE, FD_STDIN, FD_STDOUT, MAX_OPEN_FILES, PAGE_SIZE, USER_BASE};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::fs::dirent::{self, DirEntry};
use crate::fs::inode::FileType;
use crate::fs::open_inode::OpenInode;
use crate::fs::FileSystem;
use crate::vm::backing::FileBacking;
use crate::vm::frame::PhysicalAllocator;
use crate::vm::Spt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The console a thread's fds 0/1 dispatch to; an external collaborator
/// per §1 (the driver behind stdin/stdout), modeled as a trait so this
/// crate never assumes a particular terminal implementation.
pub trait Console: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> usize;
    fn write(&self, buf: &[u8]) -> usize;
}

struct FdEntry {
    inode: Arc<OpenInode>,
    /// Directory iteration cursor, byte offset of the next entry to
    /// return; only meaningful when the inode is a directory.
    dir_cursor: u64,
    pos: u64,
}

/// Per-thread open-fd list of §4.6. `fd` values `0`/`1` are reserved for
/// stdin/stdout and never appear as keys here.
pub struct FdTable<D: BlockDevice> {
    fs: Arc<FileSystem<D>>,
    console: Option<Arc<dyn Console>>,
    entries: Mutex<HashMap<i32, FdEntry>>,
}

impl<D: BlockDevice + 'static> FdTable<D> {
    pub fn new(fs: Arc<FileSystem<D>>, console: Option<Arc<dyn Console>>) -> Self {
        FdTable {
            fs,
            console,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Open the inode at `sector` (already resolved by the caller; name
    /// resolution is out of scope per §1) under the smallest free id ≥ 2.
    pub fn open(&self, sector: u32) -> Result<i32> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= MAX_OPEN_FILES {
            return Err(Error::TooManyOpenFiles);
        }
        let inode = self.fs.open(sector);
        let mut fd = FD_FIRST_FREE;
        while entries.contains_key(&fd) {
            fd += 1;
        }
        entries.insert(fd, FdEntry { inode, dir_cursor: 0, pos: 0 });
        Ok(fd)
    }

    /// Tear down one descriptor. A second close on an already-closed fd is
    /// a no-op, per §8.
    pub fn close(&self, fd: i32) {
        let entry = self.entries.lock().unwrap().remove(&fd);
        if let Some(entry) = entry {
            log::trace!("fd: closing fd={} (sector {})", fd, entry.inode.sector);
            self.fs.close(&entry.inode);
        }
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        if fd == FD_STDIN {
            return Ok(self.console.as_ref().map(|c| c.read(buf)).unwrap_or(0));
        }
        if fd == FD_STDOUT {
            return Err(Error::BadFd(fd));
        }
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&fd).ok_or(Error::BadFd(fd))?;
        let n = self.fs.read_at(&entry.inode, buf, entry.pos);
        entry.pos += n as u64;
        Ok(n)
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> Result<usize> {
        if fd == FD_STDOUT {
            return Ok(self.console.as_ref().map(|c| c.write(buf)).unwrap_or(0));
        }
        if fd == FD_STDIN {
            return Err(Error::BadFd(fd));
        }
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&fd).ok_or(Error::BadFd(fd))?;
        let n = self.fs.write_at(&entry.inode, buf, entry.pos)?;
        entry.pos += n as u64;
        Ok(n)
    }

    pub fn seek(&self, fd: i32, pos: u64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&fd).ok_or(Error::BadFd(fd))?;
        entry.pos = pos;
        Ok(())
    }

    pub fn tell(&self, fd: i32) -> Result<u64> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(&fd).ok_or(Error::BadFd(fd))?.pos)
    }

    pub fn filesize(&self, fd: i32) -> Result<u64> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(&fd).ok_or(Error::BadFd(fd))?;
        Ok(self.fs.length(&entry.inode))
    }

    pub fn is_dir(&self, fd: i32) -> Result<bool> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(&fd).ok_or(Error::BadFd(fd))?;
        Ok(self.fs.file_type(&entry.inode) == FileType::Directory)
    }

    pub fn inumber(&self, fd: i32) -> Result<u32> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(&fd).ok_or(Error::BadFd(fd))?.inode.sector)
    }

    /// Return the next in-use entry of the directory open at `fd`,
    /// advancing its cursor past every slot visited (including skipped
    /// unused ones), or `None` once the cursor reaches the directory's
    /// length.
    pub fn readdir_next(&self, fd: i32) -> Result<Option<DirEntry>> {
        let inode = {
            let entries = self.entries.lock().unwrap();
            let entry = entries.get(&fd).ok_or(Error::BadFd(fd))?;
            entry.inode.clone()
        };
        if self.fs.file_type(&inode) != FileType::Directory {
            return Err(Error::NotADirectory(inode.sector));
        }
        loop {
            let cursor = {
                let entries = self.entries.lock().unwrap();
                entries.get(&fd).ok_or(Error::BadFd(fd))?.dir_cursor
            };
            let length = self.fs.length(&inode);
            if cursor >= length {
                return Ok(None);
            }
            let mut raw = [0u8; DIRENT_SIZE];
            self.fs.read_at(&inode, &mut raw, cursor);
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.get_mut(&fd).ok_or(Error::BadFd(fd))?;
            entry.dir_cursor = cursor + DIRENT_SIZE as u64;
            drop(entries);
            if let Some(parsed) = dirent::parse(&raw) {
                return Ok(Some(parsed));
            }
        }
    }

    fn inode_of(&self, fd: i32) -> Result<Arc<OpenInode>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(&fd).ok_or(Error::BadFd(fd))?.inode.clone())
    }

    /// Reopen `fd`'s inode for an mmap so closing the original descriptor
    /// doesn't disturb the mapping, per §4.6.
    fn reopen_for_mmap(&self, fd: i32) -> Result<Arc<OpenInode>> {
        let sector = self.inode_of(fd)?.sector;
        Ok(self.fs.open(sector))
    }
}

/// Wraps a [`FileSystem`] + [`OpenInode`] pair as the [`FileBacking`] a
/// demand-paged MMAP or FILE source reads/writes through.
struct InodeBacking<D: BlockDevice> {
    fs: Arc<FileSystem<D>>,
    inode: Arc<OpenInode>,
}

impl<D: BlockDevice + 'static> FileBacking for InodeBacking<D> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.fs.read_at(&self.inode, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) {
        let _ = self.fs.write_at(&self.inode, buf, offset);
    }
}

/// Everything one thread owns that ties the cache, file system, and VM
/// layers together, per §1(d): its fd table, its supplemental page table
/// (and through it, its mmap records), and its current-directory handle.
pub struct Process<D: BlockDevice, A: PhysicalAllocator> {
    pub fds: FdTable<D>,
    pub spt: Arc<Spt<A>>,
    fs: Arc<FileSystem<D>>,
    cwd: Mutex<u32>,
    next_map_id: Mutex<u32>,
}

impl<D: BlockDevice + 'static, A: PhysicalAllocator + 'static> Process<D, A> {
    pub fn new(fs: Arc<FileSystem<D>>, spt: Arc<Spt<A>>, console: Option<Arc<dyn Console>>, cwd: u32) -> Self {
        Process {
            fds: FdTable::new(fs.clone(), console),
            spt,
            fs,
            cwd: Mutex::new(cwd),
            next_map_id: Mutex::new(1),
        }
    }

    pub fn cwd(&self) -> u32 {
        *self.cwd.lock().unwrap()
    }

    pub fn chdir(&self, sector: u32) {
        *self.cwd.lock().unwrap() = sector;
    }

    /// §4.6 `mmap`: `addr` must be page-aligned, non-null, and below
    /// [`USER_BASE`]. Maps one page per [`PAGE_SIZE`] bytes of the file
    /// (the last page's tail zero-filled), returning the map id.
    pub fn mmap(&self, fd: i32, addr: usize) -> Result<u32> {
        if addr == 0 || addr % PAGE_SIZE != 0 || addr >= USER_BASE {
            return Err(Error::BadMmapAddress);
        }
        let inode = self.reopen_for_mmap_checked(fd)?;
        let length = self.fs.length(&inode);
        if length == 0 {
            self.fs.close(&inode);
            return Err(Error::EmptyMmap);
        }
        let backing: Arc<dyn FileBacking> = Arc::new(InodeBacking {
            fs: self.fs.clone(),
            inode,
        });

        let map_id = {
            let mut next = self.next_map_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };

        let mut offset = 0u64;
        let mut page_addr = addr;
        while offset < length {
            let read_bytes = std::cmp::min(PAGE_SIZE as u64, length - offset) as usize;
            let zero_bytes = PAGE_SIZE - read_bytes;
            self.spt
                .insert_mmap(page_addr, map_id, backing.clone(), offset, read_bytes, zero_bytes);
            offset += PAGE_SIZE as u64;
            page_addr += PAGE_SIZE;
        }
        Ok(map_id)
    }

    fn reopen_for_mmap_checked(&self, fd: i32) -> Result<Arc<OpenInode>> {
        self.fds.reopen_for_mmap(fd)
    }

    /// §4.6 `munmap`: write back dirty pages, free frames, drop records.
    pub fn munmap(&self, map_id: u32) {
        self.spt.munmap(map_id);
    }

    /// §4.7 dispatcher entry point: validate a single user pointer against
    /// this process's SPT, tearing the process down and returning the
    /// dispatcher's exit status (-1) on any invalid access. A dispatcher
    /// calls this (or [`Process::validate_string`]/[`Process::validate_buffer`])
    /// before touching any pointer argument a system call received.
    pub fn validate_pointer(&self, addr: usize, rsp: usize, write: bool) -> std::result::Result<(), i32> {
        if self.spt.validate_pointer(addr, rsp, write) {
            Ok(())
        } else {
            log::warn!("process: bad user pointer {:#x}, exiting with -1", addr);
            self.exit();
            Err(-1)
        }
    }

    /// §4.7 dispatcher entry point: validate a NUL-terminated string
    /// argument, same exit-on-failure contract as [`Process::validate_pointer`].
    pub fn validate_string(&self, addr: usize, rsp: usize, max_len: usize) -> std::result::Result<(), i32> {
        if self.spt.validate_string(addr, rsp, max_len) {
            Ok(())
        } else {
            log::warn!("process: bad user string at {:#x}, exiting with -1", addr);
            self.exit();
            Err(-1)
        }
    }

    /// §4.7 dispatcher entry point: validate a buffer argument of `len`
    /// bytes, same exit-on-failure contract as [`Process::validate_pointer`].
    pub fn validate_buffer(&self, addr: usize, len: usize, rsp: usize, write: bool) -> std::result::Result<(), i32> {
        if self.spt.validate_buffer(addr, len, rsp, write) {
            Ok(())
        } else {
            log::warn!("process: bad user buffer at {:#x} len {}, exiting with -1", addr, len);
            self.exit();
            Err(-1)
        }
    }

    /// Process exit: release every open fd, and every mmap record (via the
    /// SPT's own destroy), per §4.7's exit-protocol resource release list.
    pub fn exit(&self) {
        let fds: Vec<i32> = self.fds.entries.lock().unwrap().keys().copied().collect();
        for fd in fds {
            self.fds.close(fd);
        }
        self.spt.destroy();
    }
}
