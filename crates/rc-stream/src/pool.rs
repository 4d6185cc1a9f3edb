//! Process-wide NV12 buffer pool.
//!
//! The pool recognizes a single active resolution at a time. Concurrent
//! encoders may contend for buffers, and a monitor switch can change the
//! active resolution mid-stream, so both `acquire` and `release` validate
//! sizes: a buffer sized for a stale resolution is never handed out and
//! never re-pooled.

use std::sync::{Mutex, OnceLock};

use crate::convert::nv12_len;

/// Maximum number of idle buffers kept per resolution.
const MAX_POOLED: usize = 4;

pub struct Nv12Pool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    width: u32,
    height: u32,
    buffers: Vec<Vec<u8>>,
}

impl Nv12Pool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                width: 0,
                height: 0,
                buffers: Vec::new(),
            }),
        }
    }

    /// Get a buffer of exactly `nv12_len(width, height)` bytes.
    ///
    /// Registers `(width, height)` as the active resolution; buffers pooled
    /// for a previous resolution are discarded.
    pub fn acquire(&self, width: u32, height: u32) -> Vec<u8> {
        let want = nv12_len(width, height);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.width != width || inner.height != height {
            inner.width = width;
            inner.height = height;
            inner.buffers.clear();
        }

        while let Some(buf) = inner.buffers.pop() {
            if buf.len() == want {
                return buf;
            }
            // Stale size slipped in concurrently; drop it.
        }

        vec![0u8; want]
    }

    /// Return a buffer to the pool. Buffers whose length does not match the
    /// currently registered resolution are dropped.
    pub fn release(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let want = nv12_len(inner.width, inner.height);
        if buf.len() == want && inner.buffers.len() < MAX_POOLED {
            inner.buffers.push(buf);
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .buffers
            .len()
    }
}

impl Default for Nv12Pool {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide pool shared by all sessions.
pub fn global_pool() -> &'static Nv12Pool {
    static POOL: OnceLock<Nv12Pool> = OnceLock::new();
    POOL.get_or_init(Nv12Pool::new)
}
