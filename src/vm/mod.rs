//! Demand-paged virtual memory: the frame table (`frame`), per-thread
//! supplemental page table (`spt`), and the file-backing contract that
//! lets an SPT entry read/write through an open inode without this module
//! depending on the concrete [`crate::device::BlockDevice`] type
//! (`backing`). `PageOwner`/`FileBacking` mirror the page-table/pager split
//! fault-time virtual memory code needs between "where a page's bytes live
//! on eviction" and "what mapped its bytes in the first place".

pub mod backing;
pub mod frame;
pub mod spt;

pub use backing::FileBacking;
pub use frame::{FrameTable, PhysicalAllocator, PhysicalPage};
pub use spt::{MmapRecord, Spt, SptEntry};

/// Identifies a thread for frame/SPT ownership purposes. The real thread
/// primitives are out of scope per §1; this is the stable key production
/// glue derives from whatever thread-control block it actually has.
pub type ThreadId = u64;
