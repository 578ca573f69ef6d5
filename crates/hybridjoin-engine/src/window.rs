//! Bounded, key-indexed, insertion-ordered set of tuples awaiting a match.
//!
//! Entries live in a [`Slab`] arena and are threaded onto two intrusive
//! doubly-linked lists: the global FIFO (`order`) and a per-key bucket
//! (`index`). Both lists splice in O(1), so admitting an entry, removing an
//! arbitrary entry by handle, and peeking the oldest key are all constant
//! time regardless of window size.

use std::collections::HashMap;

use hybridjoin_types::{JoinKey, StreamTuple};
use slab::Slab;

/// Direct handle to a window entry.
///
/// Handles are generation-checked: once an entry is removed its handle never
/// resolves again, even if the slot is reused by a later admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    slot: usize,
    generation: u64,
}

/// Returned by [`Window::admit`] when no slot is free. Hands the tuple back.
#[derive(Debug, thiserror::Error)]
#[error("window is full ({capacity} entries)")]
pub struct WindowFull {
    pub capacity: usize,
    pub tuple: StreamTuple,
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Entry {
    key: JoinKey,
    tuple: StreamTuple,
    generation: u64,
    order: Links,
    bucket: Links,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    head: usize,
    tail: usize,
    len: usize,
}

/// Per-stage join window. Never shared between stages.
#[derive(Debug)]
pub struct Window {
    capacity: usize,
    entries: Slab<Entry>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<JoinKey, Bucket>,
    next_generation: u64,
}

impl Window {
    /// Create an empty window. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Slab::with_capacity(capacity),
            head: None,
            tail: None,
            index: HashMap::with_capacity(capacity),
            next_generation: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of admittable slots; always `capacity - len`.
    #[must_use]
    pub fn free(&self) -> usize {
        self.capacity - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Number of keys with at least one pending entry.
    #[must_use]
    pub fn distinct_keys(&self) -> usize {
        self.index.len()
    }

    /// Append `tuple` under `key` at the FIFO tail.
    ///
    /// # Errors
    ///
    /// Returns [`WindowFull`] carrying the tuple back if no slot is free.
    pub fn admit(&mut self, key: JoinKey, tuple: StreamTuple) -> Result<EntryHandle, WindowFull> {
        if self.is_full() {
            return Err(WindowFull {
                capacity: self.capacity,
                tuple,
            });
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let bucket_tail = self.index.get(&key).map(|b| b.tail);
        let slot = self.entries.insert(Entry {
            key: key.clone(),
            tuple,
            generation,
            order: Links {
                prev: self.tail,
                next: None,
            },
            bucket: Links {
                prev: bucket_tail,
                next: None,
            },
        });

        match self.tail {
            Some(tail) => self.entries[tail].order.next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);

        match bucket_tail {
            Some(tail) => {
                self.entries[tail].bucket.next = Some(slot);
                if let Some(bucket) = self.index.get_mut(&key) {
                    bucket.tail = slot;
                    bucket.len += 1;
                }
            }
            None => {
                self.index.insert(
                    key,
                    Bucket {
                        head: slot,
                        tail: slot,
                        len: 1,
                    },
                );
            }
        }

        Ok(EntryHandle { slot, generation })
    }

    /// Detach the entry from both lists and return its tuple. Stale handles
    /// return `None` and leave the window untouched.
    pub fn remove(&mut self, handle: EntryHandle) -> Option<StreamTuple> {
        if self.entries.get(handle.slot)?.generation != handle.generation {
            return None;
        }
        let entry = self.entries.remove(handle.slot);

        match entry.order.prev {
            Some(prev) => self.entries[prev].order.next = entry.order.next,
            None => self.head = entry.order.next,
        }
        match entry.order.next {
            Some(next) => self.entries[next].order.prev = entry.order.prev,
            None => self.tail = entry.order.prev,
        }

        if let Some(prev) = entry.bucket.prev {
            self.entries[prev].bucket.next = entry.bucket.next;
        }
        if let Some(next) = entry.bucket.next {
            self.entries[next].bucket.prev = entry.bucket.prev;
        }
        let emptied = match self.index.get_mut(&entry.key) {
            Some(bucket) => {
                bucket.len -= 1;
                if bucket.head == handle.slot {
                    if let Some(next) = entry.bucket.next {
                        bucket.head = next;
                    }
                }
                if bucket.tail == handle.slot {
                    if let Some(prev) = entry.bucket.prev {
                        bucket.tail = prev;
                    }
                }
                bucket.len == 0
            }
            None => false,
        };
        if emptied {
            self.index.remove(&entry.key);
        }

        Some(entry.tuple)
    }

    /// Key of the oldest pending entry.
    #[must_use]
    pub fn peek_oldest(&self) -> Option<&JoinKey> {
        self.head.map(|slot| &self.entries[slot].key)
    }

    /// Handles of every entry pending under `key`, in admission order.
    pub fn bucket(&self, key: &JoinKey) -> impl Iterator<Item = EntryHandle> + '_ {
        let mut cursor = self.index.get(key).map(|b| b.head);
        std::iter::from_fn(move || {
            let slot = cursor?;
            let entry = &self.entries[slot];
            cursor = entry.bucket.next;
            Some(EntryHandle {
                slot,
                generation: entry.generation,
            })
        })
    }

    /// Number of entries pending under `key`.
    #[must_use]
    pub fn bucket_len(&self, key: &JoinKey) -> usize {
        self.index.get(key).map_or(0, |b| b.len)
    }

    /// Remove every entry under `key`, returning the tuples in admission order.
    pub fn take_bucket(&mut self, key: &JoinKey) -> Vec<StreamTuple> {
        let handles: Vec<EntryHandle> = self.bucket(key).collect();
        handles
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .collect()
    }

    /// Keys in FIFO order, oldest first. Diagnostic view.
    pub fn keys_in_order(&self) -> impl Iterator<Item = &JoinKey> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = cursor?;
            let entry = &self.entries[slot];
            cursor = entry.order.next;
            Some(&entry.key)
        })
    }

    /// Verify that the FIFO and the key index describe the same entries and
    /// that occupancy respects capacity.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.entries.len() > self.capacity {
            return Err(format!(
                "{} entries exceed capacity {}",
                self.entries.len(),
                self.capacity
            ));
        }

        let mut in_order = 0usize;
        let mut cursor = self.head;
        let mut prev = None;
        while let Some(slot) = cursor {
            let entry = self
                .entries
                .get(slot)
                .ok_or_else(|| format!("order references vacant slot {slot}"))?;
            if entry.order.prev != prev {
                return Err(format!("order back-link broken at slot {slot}"));
            }
            in_order += 1;
            if in_order > self.entries.len() {
                return Err("order list contains a cycle".to_string());
            }
            prev = cursor;
            cursor = entry.order.next;
        }
        if prev != self.tail {
            return Err("order tail does not match last entry".to_string());
        }
        if in_order != self.entries.len() {
            return Err(format!(
                "order holds {in_order} entries, arena holds {}",
                self.entries.len()
            ));
        }

        let mut in_index = 0usize;
        for (key, bucket) in &self.index {
            let mut walked = 0usize;
            let mut cursor = Some(bucket.head);
            let mut last = None;
            while let Some(slot) = cursor {
                let entry = self
                    .entries
                    .get(slot)
                    .ok_or_else(|| format!("bucket {key} references vacant slot {slot}"))?;
                if entry.key != *key {
                    return Err(format!("entry for {} filed under bucket {key}", entry.key));
                }
                walked += 1;
                if walked > bucket.len {
                    return Err(format!("bucket {key} longer than recorded {}", bucket.len));
                }
                last = cursor;
                cursor = entry.bucket.next;
            }
            if walked != bucket.len || last != Some(bucket.tail) {
                return Err(format!("bucket {key} bookkeeping is inconsistent"));
            }
            in_index += walked;
        }
        if in_index != in_order {
            return Err(format!(
                "index holds {in_index} entries, order holds {in_order}"
            ));
        }

        Ok(())
    }
}
