//! A generic binary min-heap over deadlines.
//!
//! Two instances of this type back the reactor: one keyed to timed
//! descriptor events, one to delayed posts. The timed-event heap needs to
//! support arbitrary-position removal (a scheduled read can complete, or
//! be cancelled, long before its deadline), which means every entry must
//! know its own index. Rather than store that index inside the heap
//! entry itself — which would require the entry to also know how to find
//! its owning record — every operation that can move an entry takes an
//! `on_move` callback invoked with the entry's new index. The delay heap
//! passes a no-op; the timed-event heap passes a closure that writes the
//! index back into the owning [`crate::node::EventRecord`].

/// Anything that can be ordered in the heap by a millisecond deadline.
pub trait Deadline {
    fn deadline(&self) -> i64;
}

pub struct Heap<T: Deadline> {
    items: Vec<T>,
}

impl<T: Deadline> Default for Heap<T> {
    fn default() -> Self {
        Heap { items: Vec::new() }
    }
}

impl<T: Deadline> Heap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.items.get(idx)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drain every entry in unspecified order. Used by the stop drain,
    /// which does not care about heap order once it has decided to fire
    /// everything.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }

    /// Insert `item`, restoring heap order, and return its final index.
    pub fn push<F: FnMut(&T, usize)>(&mut self, item: T, mut on_move: F) -> usize {
        let idx = self.items.len();
        self.items.push(item);
        self.sift_up(idx, &mut on_move)
    }

    /// Remove and return the minimum entry, restoring heap order among
    /// what remains.
    pub fn pop_min<F: FnMut(&T, usize)>(&mut self, mut on_move: F) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.remove(0, &mut on_move))
    }

    /// Remove the entry at `idx`, restoring heap order among what
    /// remains, and return it.
    ///
    /// Implemented as swap-with-last, pop, then sift the relocated entry
    /// in whichever direction its deadline requires. This is equivalent
    /// to, and simpler than, an approach that first forces the removed
    /// entry's key to `-infinity` and sifts it to the root before
    /// popping: both end with the same heap shape, but swap-then-sift
    /// does it in one pass instead of two.
    pub fn remove<F: FnMut(&T, usize)>(&mut self, idx: usize, mut on_move: F) -> T {
        let last = self.items.len() - 1;
        self.items.swap(idx, last);
        let removed = self.items.pop().expect("heap non-empty");
        if idx < self.items.len() {
            on_move(&self.items[idx], idx);
            let moved_down = self.sift_down(idx, &mut on_move);
            self.sift_up(moved_down, &mut on_move);
        }
        removed
    }

    fn sift_up<F: FnMut(&T, usize)>(&mut self, mut idx: usize, on_move: &mut F) -> usize {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.items[idx].deadline() < self.items[parent].deadline() {
                self.items.swap(idx, parent);
                on_move(&self.items[idx], idx);
                on_move(&self.items[parent], parent);
                idx = parent;
            } else {
                break;
            }
        }
        idx
    }

    fn sift_down<F: FnMut(&T, usize)>(&mut self, mut idx: usize, on_move: &mut F) -> usize {
        let len = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && self.items[left].deadline() < self.items[smallest].deadline() {
                smallest = left;
            }
            if right < len && self.items[right].deadline() < self.items[smallest].deadline() {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.items.swap(idx, smallest);
            on_move(&self.items[idx], idx);
            on_move(&self.items[smallest], smallest);
            idx = smallest;
        }
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Entry(i64, &'static str);

    impl Deadline for Entry {
        fn deadline(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn pop_min_returns_ascending_order() {
        let mut heap = Heap::new();
        for (d, name) in [(30, "c"), (10, "a"), (20, "b"), (5, "z")] {
            heap.push(Entry(d, name), |_, _| {});
        }
        let mut out = Vec::new();
        while let Some(e) = heap.pop_min(|_, _| {}) {
            out.push(e.1);
        }
        assert_eq!(out, vec!["z", "a", "b", "c"]);
    }

    #[test]
    fn remove_arbitrary_index_keeps_heap_property() {
        let mut heap = Heap::new();
        let mut indices = std::collections::HashMap::new();
        for (d, name) in [(30, "c"), (10, "a"), (20, "b"), (5, "z"), (15, "m")] {
            let idx = heap.push(Entry(d, name), |_, _| {});
            indices.insert(name, idx);
        }
        // track positions via on_move
        let mut positions: std::collections::HashMap<&'static str, usize> =
            indices.iter().map(|(k, v)| (*k, *v)).collect();
        let remove_idx = positions["b"];
        let removed = heap.remove(remove_idx, |e, i| {
            positions.insert(e.1, i);
        });
        assert_eq!(removed.1, "b");

        let mut out = Vec::new();
        while let Some(e) = heap.pop_min(|_, _| {}) {
            out.push(e.1);
        }
        assert_eq!(out, vec!["z", "a", "m", "c"]);
    }

    #[test]
    fn on_move_reflects_true_final_position() {
        let mut heap = Heap::new();
        let mut last_seen = std::collections::HashMap::new();
        for (d, name) in [(5, "a"), (4, "b"), (3, "c"), (2, "d"), (1, "e")] {
            heap.push(Entry(d, name), |e, i| {
                last_seen.insert(e.1, i);
            });
        }
        for (name, idx) in last_seen.iter() {
            assert_eq!(heap.get(*idx).unwrap().1, *name);
        }
    }
}
