//! LRU Tracker Module
//!
//! Implements Least Recently Used tracking for cache eviction.

use std::collections::HashMap;

use bytes::Bytes;

// == Slot ==
/// One link of the access-order list, stored in a slab.
#[derive(Debug)]
struct Slot {
    key: Bytes,
    /// Neighbour towards the most recently used end
    prev: Option<usize>,
    /// Neighbour towards the least recently used end
    next: Option<usize>,
}

// == LRU Tracker ==
/// Tracks access order for LRU eviction strategy.
///
/// Keys live in a slab-backed doubly linked list indexed by a hash map, so
/// touch, remove and eviction are all O(1):
/// - `head` = Most recently used
/// - `tail` = Least recently used
#[derive(Debug, Default)]
pub struct LruTracker {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<Bytes, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruTracker {
    // == Constructor ==
    /// Creates a new empty LRU tracker.
    pub fn new() -> Self {
        Self::default()
    }

    // == Touch ==
    /// Marks a key as recently used (moves to front).
    ///
    /// Unknown keys are inserted at the front.
    pub fn touch(&mut self, key: &Bytes) {
        if let Some(&idx) = self.index.get(key) {
            self.unlink(idx);
            self.push_front(idx);
            return;
        }

        let slot = Slot {
            key: key.clone(),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key.clone(), idx);
        self.push_front(idx);
    }

    // == Remove ==
    /// Removes a key from the tracker. Unknown keys are ignored.
    pub fn remove(&mut self, key: &[u8]) {
        if let Some(idx) = self.index.remove(key) {
            self.unlink(idx);
            self.slots[idx] = None;
            self.free.push(idx);
        }
    }

    // == Evict Oldest ==
    /// Returns and removes the least recently used key.
    ///
    /// Returns None if tracker is empty.
    pub fn evict_oldest(&mut self) -> Option<Bytes> {
        let idx = self.tail?;
        self.unlink(idx);
        let slot = self.slots[idx].take()?;
        self.free.push(idx);
        self.index.remove(&slot.key);
        Some(slot.key)
    }

    // == Peek Oldest ==
    /// Returns the least recently used key without removing it.
    pub fn peek_oldest(&self) -> Option<&Bytes> {
        self.tail
            .and_then(|idx| self.slots[idx].as_ref())
            .map(|slot| &slot.key)
    }

    /// Keys from most to least recently used.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = self.slots[cursor?].as_ref()?;
            cursor = slot.next;
            Some(&slot.key)
        })
    }

    // == Length ==
    /// Returns the number of tracked keys.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Checks if a key is being tracked.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = old_head;
        }
        match old_head.and_then(|h| self.slots[h].as_mut()) {
            Some(head) => head.prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };
        match prev.and_then(|p| self.slots[p].as_mut()) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.slots[n].as_mut()) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = None;
        }
    }
}
