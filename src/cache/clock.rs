//! The global cache lookup table and clock cursor, split out of `mod.rs`
//! since both are held behind the same single lock (§5's "global cache
//! lock").

use std::collections::HashMap;

pub(super) struct Clock {
    pub(super) index_of: HashMap<u32, usize>,
    turn: usize,
    capacity: usize,
}

impl Clock {
    pub(super) fn new(capacity: usize) -> Self {
        Clock {
            index_of: HashMap::new(),
            turn: 0,
            capacity,
        }
    }

    /// Advance the cursor and return the slot index it now points at.
    /// Called before every slot is inspected during eviction, per §9 note
    /// (b): "advance-then-inspect".
    pub(super) fn advance(&mut self) -> usize {
        let current = self.turn;
        self.turn = (self.turn + 1) % self.capacity;
        current
    }
}
