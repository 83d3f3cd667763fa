// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reusable read buffers for the response pipeline.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
const DEFAULT_MAX_IDLE: usize = 64;

/// A bounded free-list of [`BytesMut`] buffers.
///
/// Buffers handed out by [`BufferPool::get`] are empty and have at least
/// `buffer_size` bytes of capacity.  Returning a buffer is optional; a buffer
/// that is never returned is simply freed.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<VecDeque<BytesMut>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE)
    }
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            max_idle,
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Convenience constructor for sharing one pool across pipelines.
    pub fn shared(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self::new(buffer_size, DEFAULT_MAX_IDLE))
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer from the pool, allocating when none is idle.
    pub fn get(&self) -> BytesMut {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop_front());
        match reused {
            Some(mut buf) => {
                buf.clear();
                buf.reserve(self.buffer_size);
                buf
            }
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    /// Hand a buffer back.  Buffers that are shared with frozen chunks or
    /// would overflow the idle list are dropped.
    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() < self.buffer_size {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push_back(buf);
            }
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates_requested_capacity() {
        let pool = BufferPool::new(1024, 4);
        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 1024);
    }

    #[test]
    fn test_put_recycles_buffer() {
        let pool = BufferPool::new(128, 4);
        let mut buf = pool.get();
        buf.extend_from_slice(b"leftover");
        pool.put(buf);
        assert_eq!(pool.idle(), 1);

        let again = pool.get();
        assert!(again.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_idle_list_is_bounded() {
        let pool = BufferPool::new(16, 2);
        for _ in 0..5 {
            pool.put(BytesMut::with_capacity(16));
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_undersized_buffers_are_dropped() {
        let pool = BufferPool::new(4096, 2);
        pool.put(BytesMut::with_capacity(8));
        assert_eq!(pool.idle(), 0);
    }
}
