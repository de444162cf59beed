//! A writer-preferring reader/writer lock, one per cache slot.
//!
//! §9's Design Notes call out that a default shared/exclusive primitive is
//! not good enough here if the platform's default happens to be
//! reader-preferring, and prescribe the fix explicitly: a mutex, two
//! condition variables, and explicit waiter counts. Readers and writers are
//! counted in state guarded by a single mutex; a thread that can't proceed
//! parks on a condvar rather than spinning, and a pending writer blocks new
//! readers from acquiring until it has run.

use std::sync::{Condvar, Mutex, MutexGuard};

struct State {
    readers: u32,
    writer: bool,
    read_waiters: u32,
    write_waiters: u32,
}

/// A reader/writer lock where a writer waiting for the lock blocks any
/// reader that arrives after it, preventing writer starvation.
pub struct RwLock<T> {
    state: Mutex<State>,
    read_ready: Condvar,
    write_ready: Condvar,
    data: std::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        RwLock {
            state: Mutex::new(State {
                readers: 0,
                writer: false,
                read_waiters: 0,
                write_waiters: 0,
            }),
            read_ready: Condvar::new(),
            write_ready: Condvar::new(),
            data: std::cell::UnsafeCell::new(value),
        }
    }

    /// Block until a shared read lock is held. A reader waits while any
    /// writer is active *or waiting*, so a writer can never be overtaken by
    /// a stream of readers that all arrive after it.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        state.read_waiters += 1;
        while state.writer || state.write_waiters > 0 {
            state = self.read_ready.wait(state).unwrap();
        }
        state.read_waiters -= 1;
        state.readers += 1;
        RwLockReadGuard { lock: self }
    }

    /// Block until the exclusive write lock is held.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        state.write_waiters += 1;
        while state.writer || state.readers > 0 {
            state = self.write_ready.wait(state).unwrap();
        }
        state.write_waiters -= 1;
        state.writer = true;
        RwLockWriteGuard { lock: self }
    }

    /// True if no thread currently holds or waits for this lock; used by
    /// the cache's eviction scan to skip slots that are in use.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.readers == 0
            && !state.writer
            && state.read_waiters == 0
            && state.write_waiters == 0
    }

    fn release_read(&self) {
        let mut state = self.state.lock().unwrap();
        state.readers -= 1;
        self.wake_next(&mut state);
    }

    fn release_write(&self) {
        let mut state = self.state.lock().unwrap();
        state.writer = false;
        self.wake_next(&mut state);
    }

    /// Writers go first; only once no writer is waiting do parked readers
    /// get woken, preserving write priority across the handoff.
    fn wake_next(&self, state: &mut MutexGuard<'_, State>) {
        if state.write_waiters > 0 {
            self.write_ready.notify_one();
        } else if state.read_waiters > 0 {
            self.read_ready.notify_all();
        }
    }
}

pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> std::ops::Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> std::ops::Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
