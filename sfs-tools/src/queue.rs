//! Bounded blocking producer/consumer queue.
//!
//! Elements carry an id, an operation code and a byte payload. The queue is
//! constructed with a size budget in bytes; a zero budget makes it
//! unbounded and only the element count is tracked. Producers block on the
//! `space` semaphore, consumers on the `items` semaphore, and the mutex is
//! held only over the list splicing itself.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{bail, Error};

use crate::sem::Semaphore;

#[derive(Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: u32,
    pub op: u32,
    pub data: Vec<u8>,
}

impl QueueEntry {
    fn cost(&self) -> u64 {
        self.data.len() as u64
    }
}

pub struct BoundedQueue {
    byte_budget: u64,
    list: Mutex<VecDeque<QueueEntry>>,
    items: Semaphore,
    space: Semaphore,
}

impl BoundedQueue {
    pub fn new(byte_budget: u64) -> Self {
        Self {
            byte_budget,
            list: Mutex::new(VecDeque::new()),
            items: Semaphore::new(0),
            space: Semaphore::new(byte_budget),
        }
    }

    fn is_bounded(&self) -> bool {
        self.byte_budget > 0
    }

    /// Append an entry, blocking while the byte budget is exhausted.
    pub fn put(&self, entry: QueueEntry) -> Result<(), Error> {
        let cost = entry.cost();
        if self.is_bounded() {
            if cost > self.byte_budget {
                bail!(
                    "queue element of {} bytes exceeds the queue budget of {}",
                    cost,
                    self.byte_budget
                );
            }
            self.space.acquire(cost);
        }
        self.list.lock().unwrap().push_back(entry);
        self.items.release(1);
        Ok(())
    }

    /// Append an entry if it fits right now.
    pub fn try_put(&self, entry: QueueEntry) -> Result<bool, Error> {
        let cost = entry.cost();
        if self.is_bounded() {
            if cost > self.byte_budget {
                bail!(
                    "queue element of {} bytes exceeds the queue budget of {}",
                    cost,
                    self.byte_budget
                );
            }
            if !self.space.try_acquire(cost) {
                return Ok(false);
            }
        }
        self.list.lock().unwrap().push_back(entry);
        self.items.release(1);
        Ok(true)
    }

    /// Remove the oldest entry, blocking while the queue is empty.
    pub fn get(&self) -> QueueEntry {
        self.items.acquire(1);
        let entry = self
            .list
            .lock()
            .unwrap()
            .pop_front()
            .expect("items semaphore out of sync with the list");
        if self.is_bounded() {
            self.space.release(entry.cost());
        }
        entry
    }

    pub fn try_get(&self) -> Option<QueueEntry> {
        if !self.items.try_acquire(1) {
            return None;
        }
        let entry = self
            .list
            .lock()
            .unwrap()
            .pop_front()
            .expect("items semaphore out of sync with the list");
        if self.is_bounded() {
            self.space.release(entry.cost());
        }
        Some(entry)
    }

    pub fn elements(&self) -> usize {
        self.list.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().unwrap().is_empty()
    }

    /// Unused budget in bytes; `u64::MAX` for an unbounded queue.
    pub fn size_left(&self) -> u64 {
        if self.is_bounded() {
            self.space.resources()
        } else {
            u64::MAX
        }
    }
}
