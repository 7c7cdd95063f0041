//! Fixed-capacity rolling buffer with oldest-first eviction.

use serde::{Serialize, Serializer, ser::SerializeSeq};
use std::collections::VecDeque;
use tracing::{instrument, trace};

/// Bounded, insertion-ordered buffer.
///
/// Items are stored oldest first. Pushing past capacity evicts the oldest
/// item. Serializes newest first, which is the order observers display.
#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` items.
    #[instrument]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an item, returning the evicted oldest item if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }

        let evicted = if self.items.len() >= self.capacity {
            trace!(capacity = self.capacity, "Evicting oldest entry");
            self.items.pop_front()
        } else {
            None
        };

        self.items.push_back(item);
        evicted
    }

    /// Maximum number of items retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no items are held.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Removes every item. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Most recently pushed item.
    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    /// Iterates newest to oldest.
    pub fn newest_first(&self) -> impl Iterator<Item = &T> {
        self.items.iter().rev()
    }
}

impl<T: Serialize> Serialize for RingBuffer<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.items.len()))?;
        for item in self.newest_first() {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}
