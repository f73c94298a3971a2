//! Priority Queue with lazy deletion
//!
//! A BinaryHeap of keys plus a HashMap holding the live entries. The map is the
//! source of truth; heap keys that no longer match it are skipped on peek/pop
//! and dropped wholesale once they outnumber the live entries.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Key for the priority queue heap, ordered by (deadline, tie, id).
#[derive(Clone, Debug)]
struct Key<T> {
    deadline: f64,
    tie: T,
    id: u64,
}

impl<T: Ord> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for Key<T> {}

impl<T: Ord> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so the ordering is reversed.
// total_cmp keeps float ordering deterministic.
impl<T: Ord> Ord for Key<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .total_cmp(&other.deadline)
            .then_with(|| self.tie.cmp(&other.tie))
            .then_with(|| self.id.cmp(&other.id))
            .reverse()
    }
}

struct Entry<T, M> {
    deadline: f64,
    tie: T,
    meta: M,
}

impl<T: Ord + Copy, M> Entry<T, M> {
    fn matches(&self, key: &Key<T>) -> bool {
        self.deadline.to_bits() == key.deadline.to_bits() && self.tie == key.tie
    }
}

/// A min-priority queue supporting removal and rekeying by id.
pub struct MinPq<T, M> {
    heap: BinaryHeap<Key<T>>,
    live: HashMap<u64, Entry<T, M>>,
}

impl<T: Ord + Copy, M> Default for MinPq<T, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Copy, M> MinPq<T, M> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    /// Add an item to the queue. Returns false if id already exists.
    pub fn add(&mut self, id: u64, deadline: f64, tie: T, meta: M) -> bool {
        if self.live.contains_key(&id) {
            return false;
        }
        self.live.insert(id, Entry { deadline, tie, meta });
        self.heap.push(Key { deadline, tie, id });
        true
    }

    /// Remove an item by id. Returns the metadata if found.
    pub fn remove(&mut self, id: u64) -> Option<M> {
        let entry = self.live.remove(&id)?;
        self.maybe_compact();
        Some(entry.meta)
    }

    /// Move an existing item to a new deadline, keeping its tie.
    /// Returns false if id not found.
    pub fn adjust_deadline(&mut self, id: u64, new_deadline: f64) -> bool {
        let Some(entry) = self.live.get_mut(&id) else {
            return false;
        };
        if entry.deadline.to_bits() == new_deadline.to_bits() {
            return true;
        }
        entry.deadline = new_deadline;
        self.heap.push(Key {
            deadline: new_deadline,
            tie: entry.tie,
            id,
        });
        self.maybe_compact();
        true
    }

    /// Peek the minimum deadline without removing. Returns None if empty.
    pub fn peek_deadline(&mut self) -> Option<f64> {
        self.clean_top();
        self.heap.peek().map(|k| k.deadline)
    }

    /// Peek the minimum item as (id, deadline, metadata).
    pub fn peek(&mut self) -> Option<(u64, f64, &M)> {
        self.clean_top();
        let k = self.heap.peek()?;
        let entry = self.live.get(&k.id)?;
        Some((k.id, entry.deadline, &entry.meta))
    }

    /// Pop the minimum item. Returns (id, deadline, tie, metadata).
    pub fn pop(&mut self) -> Option<(u64, f64, T, M)> {
        loop {
            let k = self.heap.pop()?;
            match self.live.get(&k.id) {
                Some(entry) if entry.matches(&k) => {}
                _ => continue, // stale entry
            }
            let entry = self.live.remove(&k.id)?;
            return Some((k.id, entry.deadline, entry.tie, entry.meta));
        }
    }

    pub fn get(&self, id: u64) -> Option<&M> {
        self.live.get(&id).map(|e| &e.meta)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut M> {
        self.live.get_mut(&id).map(|e| &mut e.meta)
    }

    pub fn deadline(&self, id: u64) -> Option<f64> {
        self.live.get(&id).map(|e| e.deadline)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.live.contains_key(&id)
    }

    /// Ids of all live items, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.live.keys().copied()
    }

    /// Remove stale entries from the top of the heap.
    fn clean_top(&mut self) {
        while let Some(k) = self.heap.peek() {
            let ok = self.live.get(&k.id).is_some_and(|e| e.matches(k));
            if ok {
                break;
            }
            self.heap.pop();
        }
    }

    /// Rebuild the heap from the live set once stale keys dominate.
    fn maybe_compact(&mut self) {
        if self.heap.len() <= 2 * self.live.len() + 32 {
            return;
        }
        self.heap = self
            .live
            .iter()
            .map(|(&id, e)| Key {
                deadline: e.deadline,
                tie: e.tie,
                id,
            })
            .collect();
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Get the number of live items.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }
}
