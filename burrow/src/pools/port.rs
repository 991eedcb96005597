//! Mapped host port pool.

use std::collections::VecDeque;

use burrow_shared::{BurrowError, BurrowResult};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct PortPool {
    initial_size: u32,
    free: Mutex<VecDeque<u32>>,
}

impl PortPool {
    pub fn new(start: u32, count: u32) -> Self {
        Self {
            initial_size: count,
            free: Mutex::new((start..).take(count as usize).collect()),
        }
    }

    pub fn acquire(&self) -> BurrowResult<u32> {
        self.free
            .lock()
            .pop_front()
            .ok_or(BurrowError::PoolExhausted { pool: "port" })
    }

    pub fn release(&self, port: u32) {
        let mut free = self.free.lock();
        if free.contains(&port) {
            tracing::warn!(port, "double release into port pool");
            return;
        }
        free.push_back(port);
    }

    pub fn remove(&self, port: u32) -> BurrowResult<()> {
        let mut free = self.free.lock();
        match free.iter().position(|&p| p == port) {
            Some(idx) => {
                free.remove(idx);
                Ok(())
            }
            None => Err(BurrowError::AlreadyTaken {
                pool: "port",
                element: port.to_string(),
            }),
        }
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    pub fn free_count(&self) -> u32 {
        self.free.lock().len() as u32
    }
}
