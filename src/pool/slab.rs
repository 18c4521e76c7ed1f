//! Fragment-descriptor slab pool: five free-lists keyed by capacity bucket.

use std::sync::Mutex;

use crate::error::{Error, Result};

/// Capacity buckets a descriptor array can be drawn from. A 512-KiB frame
/// fragmented at the minimum practical MTU (~1388 B payload) needs at most
/// ~378 descriptors, comfortably inside the largest bucket.
pub const BUCKETS: [usize; 5] = [1, 32, 128, 256, 512];

/// Picks the smallest bucket capacity `>= n`, or `None` if `n` exceeds the
/// largest bucket.
pub fn bucket_for(n: usize) -> Option<usize> {
    BUCKETS.iter().copied().find(|&cap| cap >= n)
}

/// A fragment descriptor: per-fragment retransmission bookkeeping kept by
/// the sender for a protected frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FragDescriptor {
    pub frag_index: u16,
    pub seq_num: u32,
    pub send_time_ms: u64,
    pub retrans_count: u32,
    pub acked: bool,
}

struct Bucket {
    capacity: usize,
    free: Vec<Vec<FragDescriptor>>,
}

/// Pool of fragment-descriptor arrays, one free-list per bucket capacity.
pub struct SlabPool {
    buckets: Mutex<Vec<Bucket>>,
}

impl SlabPool {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(
                BUCKETS
                    .iter()
                    .map(|&capacity| Bucket {
                        capacity,
                        free: Vec::new(),
                    })
                    .collect(),
            ),
        }
    }

    /// Acquires a descriptor array with at least `n` slots, all reset to
    /// their default state. Expands the bucket's free list on demand; never
    /// shrinks it.
    pub fn acquire(&self, n: usize) -> Result<Vec<FragDescriptor>> {
        let capacity = bucket_for(n).ok_or(Error::NoMemory)?;
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .iter_mut()
            .find(|b| b.capacity == capacity)
            .expect("bucket_for returned a capacity with no matching bucket");

        let mut array = bucket.free.pop().unwrap_or_else(|| Vec::with_capacity(capacity));
        array.clear();
        array.resize(n, FragDescriptor::default());
        Ok(array)
    }

    /// Returns a descriptor array to its bucket's free list.
    pub fn release(&self, mut array: Vec<FragDescriptor>) {
        let capacity = array.capacity();
        array.clear();
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets
            .iter_mut()
            .find(|b| capacity <= b.capacity && array.capacity() <= b.capacity)
        {
            bucket.free.push(array);
        }
        // An array whose capacity doesn't match any bucket (shouldn't
        // happen in practice) is simply dropped.
    }
}

impl Default for SlabPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_selection() {
        assert_eq!(bucket_for(1), Some(1));
        assert_eq!(bucket_for(2), Some(32));
        assert_eq!(bucket_for(32), Some(32));
        assert_eq!(bucket_for(33), Some(128));
        assert_eq!(bucket_for(378), Some(512));
        assert_eq!(bucket_for(512), Some(512));
        assert_eq!(bucket_for(513), None);
    }

    #[test]
    fn acquire_release_round_trip() {
        let pool = SlabPool::new();
        let arr = pool.acquire(10).unwrap();
        assert_eq!(arr.len(), 10);
        pool.release(arr);
        let arr2 = pool.acquire(5).unwrap();
        assert_eq!(arr2.len(), 5);
    }

    #[test]
    fn over_max_is_no_memory() {
        let pool = SlabPool::new();
        assert_eq!(pool.acquire(513).unwrap_err(), Error::NoMemory);
    }
}
