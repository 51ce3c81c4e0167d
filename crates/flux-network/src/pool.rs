//! Size-classed byte buffer pool (C1).
//!
//! The engine rents a buffer on every receive and returns it after dispatch
//! completes; avoiding a per-packet heap allocation is what keeps the
//! framer/dispatch path off the allocator on the steady-state path.

use spin::Mutex;

/// Smallest size class handed out by [`BytePool::rent`].
const MIN_CLASS: usize = 64;
/// Largest size class kept on the free lists; bigger requests bypass the
/// pool entirely and are returned straight to the allocator.
const MAX_CLASS: usize = 128 * 1024;
/// Cap on how many buffers each free list retains, to keep idle peers from
/// pinning an unbounded amount of memory in the pool.
const MAX_FREE_PER_CLASS: usize = 256;

const NUM_CLASSES: usize = MAX_CLASS.ilog2() as usize - MIN_CLASS.ilog2() as usize + 1;

/// Thread-safe rent/return pool of power-of-two-sized `Vec<u8>` buffers.
pub struct BytePool {
    classes: [Mutex<Vec<Vec<u8>>>; NUM_CLASSES],
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

impl BytePool {
    pub fn new() -> Self {
        Self { classes: std::array::from_fn(|_| Mutex::new(Vec::new())) }
    }

    /// Class index for a buffer of capacity `cap`, if it falls within the
    /// pooled range. `cap` must already be a power of two in `[MIN_CLASS,
    /// MAX_CLASS]`.
    #[inline]
    fn class_index(cap: usize) -> Option<usize> {
        if cap < MIN_CLASS || cap > MAX_CLASS {
            return None;
        }
        Some((cap.ilog2() - MIN_CLASS.ilog2()) as usize)
    }

    /// Rents a buffer of length exactly `len`, backed by a capacity rounded
    /// up to the next power of two (clamped to `[MIN_CLASS, MAX_CLASS]`).
    /// Requests above `MAX_CLASS` bypass the pool and allocate directly.
    pub fn rent(&self, len: usize) -> Vec<u8> {
        let class_cap = len.max(MIN_CLASS).next_power_of_two();
        let Some(class) = Self::class_index(class_cap) else {
            return vec![0; len];
        };

        let mut buf = {
            let mut free = self.classes[class].lock();
            free.pop()
        }
        .unwrap_or_else(|| Vec::with_capacity(class_cap));

        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Returns `buf` to its size class's free list. Buffers whose capacity
    /// doesn't line up with a pooled class (oversize, or an odd capacity a
    /// caller constructed by hand) are simply dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        let Some(class) = Self::class_index(buf.capacity()) else {
            return;
        };
        buf.clear();
        let mut free = self.classes[class].lock();
        if free.len() < MAX_FREE_PER_CLASS {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rents_power_of_two_capacity() {
        let pool = BytePool::new();
        let buf = pool.rent(5);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.capacity(), MIN_CLASS);
    }

    #[test]
    fn reuses_returned_buffers() {
        let pool = BytePool::new();
        let buf = pool.rent(100);
        let cap = buf.capacity();
        pool.put(buf);
        let buf2 = pool.rent(100);
        assert_eq!(buf2.capacity(), cap);
    }

    #[test]
    fn oversize_bypasses_pool() {
        let pool = BytePool::new();
        let buf = pool.rent(MAX_CLASS + 1);
        assert_eq!(buf.len(), MAX_CLASS + 1);
        pool.put(buf);
        // Nothing to assert structurally; the pool must not panic on an
        // unpooled capacity.
    }
}
