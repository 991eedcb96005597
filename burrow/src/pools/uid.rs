//! Per-container user id pool.

use std::collections::VecDeque;

use burrow_shared::{BurrowError, BurrowResult};
use parking_lot::Mutex;

pub struct UidPool {
    initial_size: u32,
    free: Mutex<VecDeque<u32>>,
}

impl UidPool {
    pub fn new(start: u32, count: u32) -> Self {
        Self {
            initial_size: count,
            free: Mutex::new((start..).take(count as usize).collect()),
        }
    }

    /// Take any free uid, in ascending order.
    pub fn acquire(&self) -> BurrowResult<u32> {
        self.free
            .lock()
            .pop_front()
            .ok_or(BurrowError::PoolExhausted { pool: "uid" })
    }

    /// Return a uid to the free list. Releasing an element that is already
    /// free is a programming error; it is logged and dropped.
    pub fn release(&self, uid: u32) {
        let mut free = self.free.lock();
        if free.contains(&uid) {
            tracing::warn!(uid, "double release into uid pool");
            return;
        }
        free.push_back(uid);
    }

    /// Reserve a specific uid, used while restoring snapshots.
    pub fn remove(&self, uid: u32) -> BurrowResult<()> {
        let mut free = self.free.lock();
        match free.iter().position(|&u| u == uid) {
            Some(idx) => {
                free.remove(idx);
                Ok(())
            }
            None => Err(BurrowError::AlreadyTaken {
                pool: "uid",
                element: uid.to_string(),
            }),
        }
    }

    /// Configured capacity, independent of current usage.
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    pub fn free_count(&self) -> u32 {
        self.free.lock().len() as u32
    }
}
