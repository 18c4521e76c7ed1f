//! Frame buffer pool: preallocated, fixed-capacity data buffers that never
//! shrink once expanded. One instance backs media frames (512 KiB
//! buffers), another backs control frames (128 B buffers).

use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::pool::slab::SlabPool;

/// Media frame buffer capacity: 512 KiB, the maximum frame size.
pub const MEDIA_FRAME_CAPACITY: usize = 512 * 1024;
/// Control frame buffer capacity: 128 B, enough for a single USER payload.
pub const CONTROL_FRAME_CAPACITY: usize = 128;

/// Number of frame buffers preallocated when a pool is created.
const INITIAL_POOL_SIZE: usize = 2;

/// Point-in-time snapshot of a frame pool's allocation state.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total_count: u64,
    pub free_count: u64,
    pub used_count: u64,
    pub peak_used: u64,
    pub acquire_count: u64,
    pub release_count: u64,
}

struct PoolStatsInner {
    total_count: u64,
    free_count: u64,
    used_count: u64,
    peak_used: u64,
    acquire_count: u64,
    release_count: u64,
}

impl PoolStatsInner {
    fn new(initial: u64) -> Self {
        Self {
            total_count: initial,
            free_count: initial,
            used_count: 0,
            peak_used: 0,
            acquire_count: 0,
            release_count: 0,
        }
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            total_count: self.total_count,
            free_count: self.free_count,
            used_count: self.used_count,
            peak_used: self.peak_used,
            acquire_count: self.acquire_count,
            release_count: self.release_count,
        }
    }
}

/// The pool's shared state, held behind an `Arc` so frames can hold a
/// `Weak` back-reference and return their buffer on last drop.
pub struct FramePoolShared {
    data_capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    stats: Mutex<PoolStatsInner>,
}

impl FramePoolShared {
    pub(crate) fn release_buffer(&self, mut buf: Vec<u8>) {
        buf.clear(); // retained, not zeroed: only the length resets
        let mut free = self.free.lock().unwrap();
        free.push(buf);
        let mut stats = self.stats.lock().unwrap();
        stats.free_count += 1;
        stats.used_count = stats.used_count.saturating_sub(1);
        stats.release_count += 1;
    }
}

/// A two-size-capable frame buffer pool (construct one per size class).
pub struct FramePool {
    shared: Arc<FramePoolShared>,
    /// The slab pool new frames are linked against for retransmit state.
    /// Populated lazily by the transmitter via [`FramePool::with_slab`].
    slab: Mutex<Weak<SlabPool>>,
    data_capacity: usize,
}

impl FramePool {
    /// Creates a pool of `data_capacity`-byte buffers with `initial`
    /// preallocated.
    pub fn new(data_capacity: usize, initial: usize) -> Self {
        let free = (0..initial)
            .map(|_| Vec::with_capacity(data_capacity))
            .collect();
        Self {
            shared: Arc::new(FramePoolShared {
                data_capacity,
                free: Mutex::new(free),
                stats: Mutex::new(PoolStatsInner::new(initial as u64)),
            }),
            slab: Mutex::new(Weak::new()),
            data_capacity,
        }
    }

    /// Creates a media frame pool (512 KiB buffers).
    pub fn media() -> Self {
        Self::new(MEDIA_FRAME_CAPACITY, INITIAL_POOL_SIZE)
    }

    /// Creates a control frame pool (128 B buffers).
    pub fn control() -> Self {
        Self::new(CONTROL_FRAME_CAPACITY, INITIAL_POOL_SIZE)
    }

    /// Associates a slab pool with frames acquired from this pool, so
    /// sender-side protected frames can return their descriptor array on
    /// release. Receiver-side pools never call this.
    pub fn with_slab(self, slab: &Arc<SlabPool>) -> Self {
        *self.slab.lock().unwrap() = Arc::downgrade(slab);
        self
    }

    /// Acquires a buffer with refcount 1 and state `Free`. Expands the free
    /// list (allocates a new buffer) if it's empty; the pool never shrinks.
    pub fn acquire(&self) -> Result<Frame> {
        let buf = {
            let mut free = self.shared.free.lock().unwrap();
            free.pop()
        };

        let mut stats = self.shared.stats.lock().unwrap();
        let data = match buf {
            Some(b) => b,
            None => {
                stats.total_count += 1;
                log::debug!(
                    "frame pool ({}B) expanded to {} buffers",
                    self.data_capacity,
                    stats.total_count
                );
                Vec::with_capacity(self.data_capacity)
            }
        };
        stats.used_count += 1;
        stats.peak_used = stats.peak_used.max(stats.used_count);
        stats.acquire_count += 1;
        if data.capacity() < self.data_capacity {
            return Err(Error::NoMemory);
        }

        let slab = self.slab.lock().unwrap().clone();
        Ok(Frame::new(data, Arc::downgrade(&self.shared), slab))
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats.lock().unwrap().snapshot()
    }

    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }
}
