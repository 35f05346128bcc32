//! Counting semaphore.
//!
//! Used in pairs by the bounded queue: producers wait on free space,
//! consumers on available items. `broadcast_release` exists for shutdown
//! paths that must wake every waiter at once.

use std::sync::{Condvar, Mutex};

pub struct Semaphore {
    resources: Mutex<u64>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(resources: u64) -> Self {
        Self {
            resources: Mutex::new(resources),
            available: Condvar::new(),
        }
    }

    /// Block until `n` resources can be taken.
    pub fn acquire(&self, n: u64) {
        let mut count = self.resources.lock().unwrap();
        while *count < n {
            count = self.available.wait(count).unwrap();
        }
        *count -= n;
    }

    /// Take `n` resources if they are available right now.
    pub fn try_acquire(&self, n: u64) -> bool {
        let mut count = self.resources.lock().unwrap();
        if *count < n {
            return false;
        }
        *count -= n;
        true
    }

    pub fn release(&self, n: u64) {
        let mut count = self.resources.lock().unwrap();
        *count += n;
        drop(count);
        // waiters may need different amounts, so wake them all
        self.available.notify_all();
    }

    /// Release and wake every waiter, including those whose demand still
    /// cannot be met. Used together with an external shutdown flag.
    pub fn broadcast_release(&self, n: u64) {
        let mut count = self.resources.lock().unwrap();
        *count += n;
        drop(count);
        self.available.notify_all();
    }

    pub fn resources(&self) -> u64 {
        *self.resources.lock().unwrap()
    }
}
