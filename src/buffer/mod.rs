//! Bounded FIFO ring with an explicit overflow policy.
//!
//! Used for the sender's retained-chunk buffer, the receiver's retained
//! chunks, and the receiver's pending-append queue. Writing into a slot that
//! still holds an unconsumed entry is never allowed to happen silently:
//! either the push is refused or the oldest entry is evicted first and
//! handed back to the caller.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new entry when full
    Reject,
    /// Evict the oldest entry to make room
    DropOldest,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full ({capacity} slots), refusing to overwrite an unconsumed entry")]
    Full { capacity: usize },
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
    policy: OverflowPolicy,
    evicted: u64,
    high_water: usize,
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
            policy,
            evicted: 0,
            high_water: 0,
        }
    }

    /// Append at the tail. Returns the evicted entry under `DropOldest`.
    pub fn push(&mut self, item: T) -> Result<Option<T>, QueueError> {
        let capacity = self.capacity();
        let mut evicted = None;
        if self.len == capacity {
            match self.policy {
                OverflowPolicy::Reject => return Err(QueueError::Full { capacity }),
                OverflowPolicy::DropOldest => {
                    evicted = self.pop();
                    self.evicted += 1;
                }
            }
        }

        let tail = (self.head + self.len) % capacity;
        let slot = &mut self.slots[tail];
        assert!(slot.is_none(), "ring overwrite of unconsumed slot {}", tail);
        *slot = Some(item);
        self.len += 1;
        self.high_water = self.high_water.max(self.len);
        Ok(evicted)
    }

    /// Remove from the head.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Entries lost to `DropOldest` eviction so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Largest length ever observed.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Iterate head to tail, across the wraparound point.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
    }

    /// Take everything out in FIFO order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }
}
