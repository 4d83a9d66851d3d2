//! Connection buffer and buffer pool.
//!
//! A [`ConnBuf`] owns a growable byte region plus a logical `len` (valid
//! bytes written) and `off` (bytes already consumed/transmitted). Write
//! buffers form an ordered queue per connection; once a buffer is fully
//! drained it migrates to [`BufferPool`]'s free list for reuse.

use crate::error::{Error, Result};
use std::collections::VecDeque;

/// A single buffer: either accumulating inbound bytes or draining outbound
/// ones.
#[derive(Debug)]
pub struct ConnBuf {
    data: Vec<u8>,
    /// Valid bytes in `data`, starting at index 0.
    len: usize,
    /// Bytes already consumed (read dispatch) or transmitted (write).
    off: usize,
}

impl ConnBuf {
    fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0u8; cap.max(1)],
            len: 0,
            off: 0,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            data: bytes,
            len,
            off: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn off(&self) -> usize {
        self.off
    }

    /// Bytes left to consume: invariant 1, `off <= len`.
    pub fn remaining(&self) -> usize {
        debug_assert!(self.off <= self.len);
        self.len - self.off
    }

    pub fn unconsumed(&self) -> &[u8] {
        &self.data[self.off..self.len]
    }

    pub fn advance(&mut self, n: usize) {
        self.off = (self.off + n).min(self.len);
    }

    pub fn is_drained(&self) -> bool {
        self.off >= self.len
    }

    /// Room available for more writes (`capacity - len`).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.data.len());
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if self.len + bytes.len() > self.data.len() {
            self.data.resize(self.len + bytes.len(), 0);
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    /// Grow capacity to at least `min_cap`, rounding up to the next power
    /// of two.
    pub fn grow_to(&mut self, min_cap: usize) {
        if self.data.len() >= min_cap {
            return;
        }
        let new_cap = min_cap.next_power_of_two();
        self.data.resize(new_cap, 0);
    }

    /// Shift the unconsumed tail to offset zero, as required at the end of
    /// each decode loop iteration.
    pub fn compact(&mut self) {
        if self.off == 0 {
            return;
        }
        self.data.copy_within(self.off..self.len, 0);
        self.len -= self.off;
        self.off = 0;
    }

    fn reset(&mut self) {
        self.len = 0;
        self.off = 0;
    }
}

/// Reusable pool of write buffers for one connection, following the same
/// power-of-two growth policy.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: VecDeque<ConnBuf>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: VecDeque::new(),
        }
    }

    /// Returns a buffer with capacity >= `len`, preferring reuse from the
    /// free list. Fails with a resource error on allocation failure (in
    /// practice, an absurdly large request).
    pub fn get_free_buf(&mut self, len: usize) -> Result<ConnBuf> {
        if len as u64 > u32::MAX as u64 {
            return Err(Error::resource("requested buffer exceeds allocation limit"));
        }
        if let Some(pos) = self.free.iter().position(|b| b.capacity() >= len) {
            let mut buf = self.free.remove(pos).unwrap();
            buf.reset();
            return Ok(buf);
        }
        Ok(ConnBuf::with_capacity(len.next_power_of_two().max(64)))
    }

    /// Return a drained buffer to the free list for reuse.
    pub fn release(&mut self, mut buf: ConnBuf) {
        buf.reset();
        self.free.push_back(buf);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// A connection's ordered queue of pending write buffers: at most one is
/// "in flight" (the head), with `off <= len` (invariant 1).
#[derive(Debug, Default)]
pub struct WriteQueue {
    queue: VecDeque<ConnBuf>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, buf: ConnBuf) {
        self.queue.push_back(buf);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn front_mut(&mut self) -> Option<&mut ConnBuf> {
        self.queue.front_mut()
    }

    /// Pop the head buffer once fully drained, recycling it into `pool`.
    pub fn pop_drained(&mut self, pool: &mut BufferPool) {
        if matches!(self.queue.front(), Some(b) if b.is_drained()) {
            if let Some(buf) = self.queue.pop_front() {
                pool.release(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_rounds_to_power_of_two() {
        let mut buf = ConnBuf::with_capacity(4);
        buf.grow_to(9);
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn pool_reuses_buffers_of_sufficient_capacity() {
        let mut pool = BufferPool::new();
        let buf = pool.get_free_buf(100).unwrap();
        assert_eq!(pool.free_count(), 0);
        pool.release(buf);
        assert_eq!(pool.free_count(), 1);
        let reused = pool.get_free_buf(50).unwrap();
        assert_eq!(pool.free_count(), 0);
        assert!(reused.capacity() >= 50);
    }

    #[test]
    fn compact_shifts_unconsumed_tail_to_zero() {
        let mut buf = ConnBuf::from_bytes(vec![1, 2, 3, 4]);
        buf.advance(2);
        buf.compact();
        assert_eq!(buf.off(), 0);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.unconsumed(), &[3, 4]);
    }
}
