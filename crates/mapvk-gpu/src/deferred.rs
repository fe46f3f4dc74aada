//! Deferred destruction for multi-frame-in-flight rendering.
//!
//! A GPU object released while frame `G` is being recorded may still be read
//! by that frame's command buffers. It is tagged with `G` and only handed back
//! once the fence of the slot that recorded `G` (or a later generation) has
//! been observed.

use std::collections::VecDeque;

/// An item waiting for its generation to complete.
struct Pending<T> {
    item: T,
    generation: u64,
}

/// FIFO of items tagged with the frame generation they were released in.
pub struct DeferredQueue<T> {
    pending: VecDeque<Pending<T>>,
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeferredQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Queue an item released during `generation`.
    ///
    /// Generations must be pushed in non-decreasing order.
    pub fn push(&mut self, item: T, generation: u64) {
        debug_assert!(
            self.pending
                .back()
                .map_or(true, |last| last.generation <= generation),
            "deferred generations must not go backwards"
        );
        self.pending.push_back(Pending { item, generation });
    }

    /// Take every item released no later than `completed`.
    pub fn drain_mature(&mut self, completed: u64) -> Vec<T> {
        // Only the front can mature since generations are non-decreasing.
        let mut mature = Vec::new();
        while matches!(self.pending.front(), Some(p) if p.generation <= completed) {
            if let Some(pending) = self.pending.pop_front() {
                mature.push(pending.item);
            }
        }
        mature
    }

    /// Take everything. Only valid once the device is idle.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.pending.drain(..).map(|p| p.item).collect()
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_mature_by_generation() {
        let mut queue = DeferredQueue::new();
        queue.push("a", 1);
        queue.push("b", 1);
        queue.push("c", 2);
        queue.push("d", 4);

        assert!(queue.drain_mature(0).is_empty());
        assert_eq!(queue.drain_mature(1), vec!["a", "b"]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain_mature(3), vec!["c"]);
        assert_eq!(queue.drain_all(), vec!["d"]);
        assert!(queue.is_empty());
    }
}
