//! Pooled splice buffers.
//!
//! Each circuit direction borrows one buffer for its lifetime; pooling
//! keeps long-lived relays from churning the allocator.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Fixed-size pool of copy buffers.
pub struct CopyBufferPool {
    buffer_size: usize,
    max_pooled: usize,
    available: Mutex<VecDeque<Vec<u8>>>,
}

impl CopyBufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self { buffer_size, max_pooled, available: Mutex::new(VecDeque::new()) }
    }

    /// Borrow a buffer, allocating when the pool is empty.
    pub fn acquire(&self) -> Vec<u8> {
        let reused = self.available.lock().unwrap().pop_front();
        reused.unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    /// Return a buffer. Buffers beyond `max_pooled` are dropped.
    pub fn release(&self, buf: Vec<u8>) {
        if buf.len() != self.buffer_size {
            return;
        }
        let mut available = self.available.lock().unwrap();
        if available.len() < self.max_pooled {
            available.push_back(buf);
        }
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().unwrap().len()
    }
}
