//! Fixed-size buffer pools
//!
//! Message traffic allocates two kinds of scratch storage: encode buffers
//! (native message -> wire bytes) and block buffers (device reads). Both come
//! from thread-safe pools that recycle returned buffers and keep allocation
//! statistics. A pool refuses requests larger than its per-buffer cap rather
//! than growing to accommodate them.

use bytes::{Bytes, BytesMut};
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock};

/// Largest message any pool will hand out a buffer for. Radar messages top
/// out well under this; anything bigger is a malformed frame or a bug.
pub const MAX_MESSAGE_SIZE: usize = 40 * 1024;

/// Snapshot of a pool's allocation behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    /// Buffers created fresh because the free list was empty
    pub allocations: u64,
    /// Buffers returned to the free list or retired via freeze
    pub frees: u64,
    /// Buffers currently checked out
    pub in_use: u64,
    /// Largest number of buffers ever simultaneously checked out
    pub high_water: u64,
}

struct PoolInner {
    free: Vec<BytesMut>,
    stats: AllocationStats,
}

/// A thread-safe pool of reusable byte buffers.
pub struct Pool {
    name: &'static str,
    max_size: usize,
    inner: Mutex<PoolInner>,
}

impl Pool {
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    fn new(name: &'static str, max_size: usize) -> Self {
        Self {
            name,
            max_size,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                stats: AllocationStats::default(),
            }),
        }
    }

    /// Check out a buffer with at least `size` bytes of capacity.
    pub fn acquire(&'static self, size: usize) -> anyhow::Result<PoolBuf> {
        if size > self.max_size {
            anyhow::bail!(
                "{} pool: requested {} bytes exceeds the {} byte limit",
                self.name,
                size,
                self.max_size
            );
        }

        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let mut buf = inner.free.pop().unwrap_or_else(|| {
            inner.stats.allocations += 1;
            BytesMut::with_capacity(size.max(1024))
        });
        buf.clear();
        if buf.capacity() < size {
            buf.reserve(size - buf.capacity());
        }

        inner.stats.in_use += 1;
        if inner.stats.in_use > inner.stats.high_water {
            inner.stats.high_water = inner.stats.in_use;
        }

        Ok(PoolBuf {
            pool: self,
            buf: Some(buf),
        })
    }

    pub fn stats(&self) -> AllocationStats {
        self.inner.lock().expect("pool mutex poisoned").stats
    }

    fn give_back(&self, buf: BytesMut) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.stats.in_use = inner.stats.in_use.saturating_sub(1);
        inner.stats.frees += 1;
        inner.free.push(buf);
    }

    fn retire(&self) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.stats.in_use = inner.stats.in_use.saturating_sub(1);
        inner.stats.frees += 1;
    }
}

/// A buffer checked out of a [`Pool`]. Returns itself to the pool on drop;
/// [`PoolBuf::freeze`] retires it instead, handing the storage over to the
/// resulting shared [`Bytes`].
pub struct PoolBuf {
    pool: &'static Pool,
    buf: Option<BytesMut>,
}

impl PoolBuf {
    /// Convert the accumulated contents into immutable shared bytes.
    pub fn freeze(mut self) -> Bytes {
        let buf = self.buf.take().expect("pool buffer already consumed");
        self.pool.retire();
        buf.freeze()
    }
}

impl Deref for PoolBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("pool buffer already consumed")
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("pool buffer already consumed")
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

/// Pool used for encoding native messages into wire frames.
pub fn encode_pool() -> &'static Pool {
    static POOL: OnceLock<Pool> = OnceLock::new();
    POOL.get_or_init(|| Pool::new("encode", MAX_MESSAGE_SIZE))
}

/// Pool used for device-read scratch blocks.
pub fn block_pool() -> &'static Pool {
    static POOL: OnceLock<Pool> = OnceLock::new();
    POOL.get_or_init(|| Pool::new("block", MAX_MESSAGE_SIZE))
}

/// Combined snapshot of every pool, for status reporting.
#[derive(Debug, Clone, Copy)]
pub struct PoolReport {
    pub encode: AllocationStats,
    pub blocks: AllocationStats,
}

pub fn report() -> PoolReport {
    PoolReport {
        encode: encode_pool().stats(),
        blocks: block_pool().stats(),
    }
}
