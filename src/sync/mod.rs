//! Synchronization primitives, one file per lock type, built over
//! `std::sync` rather than raw atomics and interrupt disabling, since this
//! crate targets a hosted scheduler rather than bare metal.

mod rwlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
