//! Per-thread reusable visited marks for graph traversal.
//!
//! Each slot stores the epoch in which it was last marked. Starting a new
//! traversal bumps the epoch instead of clearing the array, so reuse is O(1).

use std::cell::RefCell;

const MIN_SLOTS: usize = 1024;
const POOL_LIMIT: usize = 4;

thread_local! {
    static FREE_MARKS: RefCell<Vec<EpochMarks>> = const { RefCell::new(Vec::new()) };
}

struct EpochMarks {
    slots: Vec<u32>,
    epoch: u32,
}

impl EpochMarks {
    fn with_slots(n: usize) -> Self {
        Self {
            slots: vec![0; n.max(MIN_SLOTS)],
            epoch: 0,
        }
    }

    fn next_epoch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            // wrapped: stale marks could alias the new epoch
            self.slots.fill(0);
            self.epoch = 1;
        }
    }
}

/// Visited set borrowed from the thread-local pool; returned on drop.
pub struct VisitedGuard {
    marks: EpochMarks,
}

impl VisitedGuard {
    /// Borrow a set able to track at least `capacity` ordinals.
    pub fn new(capacity: usize) -> Self {
        let reused = FREE_MARKS.with(|pool| {
            let mut pool = pool.borrow_mut();
            let idx = pool.iter().position(|m| m.slots.len() >= capacity)?;
            Some(pool.swap_remove(idx))
        });
        let mut marks = reused.unwrap_or_else(|| EpochMarks::with_slots(capacity));
        marks.next_epoch();
        Self { marks }
    }

    #[inline(always)]
    pub fn is_visited(&self, id: usize) -> bool {
        self.marks.slots.get(id) == Some(&self.marks.epoch)
    }

    /// Mark `id`; returns false if it was already marked.
    #[inline(always)]
    pub fn insert(&mut self, id: usize) -> bool {
        if id >= self.marks.slots.len() {
            let grown = id.saturating_add(1).next_power_of_two().max(MIN_SLOTS);
            self.marks.slots.resize(grown, 0);
        }
        let slot = &mut self.marks.slots[id];
        if *slot == self.marks.epoch {
            return false;
        }
        *slot = self.marks.epoch;
        true
    }
}

impl Drop for VisitedGuard {
    fn drop(&mut self) {
        let marks = std::mem::replace(
            &mut self.marks,
            EpochMarks {
                slots: Vec::new(),
                epoch: 0,
            },
        );
        FREE_MARKS.with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < POOL_LIMIT {
                pool.push(marks);
            }
        });
    }
}
