//! Crate-wide error type: one `thiserror`-derived enum covering every
//! recoverable failure across the cache, file system, VM, and fd layers,
//! rather than ad hoc `String`s or one enum per subsystem.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no free sectors available")]
    NoFreeSectors,

    #[error("no free swap slots available")]
    SwapExhausted,

    #[error("file has reached the maximum addressable size")]
    FileTooLarge,

    #[error("inode at sector {0} is not a directory")]
    NotADirectory(u32),

    #[error("file descriptor table is full")]
    TooManyOpenFiles,

    #[error("invalid file descriptor {0}")]
    BadFd(i32),

    #[error("mmap address must be non-null, page-aligned, and below the user region")]
    BadMmapAddress,

    #[error("file is empty and cannot be memory-mapped")]
    EmptyMmap,

    #[error("user pointer {0:#x} is outside the valid address space")]
    BadUserPointer(usize),

    #[error("on-disk inode at sector {0} failed its magic check")]
    CorruptInode(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
