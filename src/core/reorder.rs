//! Sequence-ordered release of results that may complete out of order.

use std::collections::{BTreeMap, VecDeque};

/// Holds completed results until every earlier dispatched sequence has
/// completed, then releases them in dispatch order.
///
/// Sequence numbers need not be contiguous (dropped frames leave gaps);
/// only the order of [`dispatched`](Self::dispatched) calls matters.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    pending: VecDeque<u64>,
    ready: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            ready: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `sequence` was handed to a worker.
    pub fn dispatched(&mut self, sequence: u64) {
        debug_assert!(self.pending.back().is_none_or(|&last| last < sequence));
        self.pending.push_back(sequence);
    }

    /// Record a completion and return every result that is now releasable.
    pub fn complete(&mut self, sequence: u64, value: T) -> Vec<(u64, T)> {
        self.ready.insert(sequence, value);
        let mut released = Vec::new();
        while let Some(&head) = self.pending.front() {
            match self.ready.remove(&head) {
                Some(value) => {
                    self.pending.pop_front();
                    released.push((head, value));
                }
                None => break,
            }
        }
        released
    }

    /// Dispatched sequences that have not been released yet.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
