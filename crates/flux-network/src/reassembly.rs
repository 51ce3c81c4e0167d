//! Big-data reassembler (C5): merges multi-chunk payloads keyed by
//! `(peer, packet_id)`.
//!
//! Correctness relies on the producer sending each chunk at most once and
//! the transport delivering at most once per ordered stream (TCP) or
//! tolerating loss (UDP: the TTL below garbage-collects stranded partials).

use std::collections::HashMap;

use flux_timing::{Duration, Instant};
use tracing::debug;

use crate::pool::BytePool;

/// 1,500ms TTL for inactive reassembly entries, per spec.
#[inline]
pub fn reassembly_ttl() -> Duration {
    Duration::from_millis(1_500)
}

struct Pending {
    buffer: Vec<u8>,
    bytes_remaining: u32,
    last_touched: Instant,
}

/// Reassembles chunked frames into complete payloads, one instance per peer
/// (owned by that peer's `ClientState`/connection, matching the single
/// critical section per lookup the spec calls for).
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<u32, Pending>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self { pending: HashMap::new() }
    }

    /// Feeds one chunk in. Returns the completed buffer once the last chunk
    /// for `packet_id` arrives; `None` while chunks are still outstanding.
    ///
    /// `chunk_offset + chunk_payload.len()` must not exceed `total_length`;
    /// violations are dropped (treated as a malformed chunk) rather than
    /// panicking, since chunk placement comes straight off the wire.
    pub fn accept_chunk(
        &mut self,
        pool: &BytePool,
        packet_id: u32,
        chunk_payload: &[u8],
        chunk_offset: u32,
        total_length: u32,
    ) -> Option<Vec<u8>> {
        let chunk_offset = chunk_offset as usize;
        let chunk_len = chunk_payload.len();
        let total_length_usize = total_length as usize;

        let entry = self.pending.entry(packet_id).or_insert_with(|| Pending {
            buffer: pool.rent(total_length_usize),
            bytes_remaining: total_length,
            last_touched: Instant::now(),
        });

        // Validate against the buffer actually allocated for this `packet_id`,
        // not the `total_length` this particular chunk claims — a later chunk
        // can't widen an already-allocated reassembly by lying about the total.
        if chunk_offset.checked_add(chunk_len)? > entry.buffer.len() {
            return None;
        }

        entry.buffer[chunk_offset..chunk_offset + chunk_len].copy_from_slice(chunk_payload);
        entry.bytes_remaining = entry.bytes_remaining.saturating_sub(chunk_len as u32);
        entry.last_touched = Instant::now();

        if entry.bytes_remaining == 0 {
            let Pending { buffer, .. } = self.pending.remove(&packet_id)?;
            Some(buffer)
        } else {
            None
        }
    }

    /// Removes and returns-to-pool every entry that's been inactive for
    /// longer than [`reassembly_ttl`]. Called periodically from the owning
    /// peer's poll loop.
    pub fn expire_stale(&mut self, pool: &BytePool) {
        let ttl = reassembly_ttl();
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.last_touched.elapsed() >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                debug!(packet_id = id, "reassembly: entry expired before completion, discarding");
                pool.put(p.buffer);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, packet_id: u32) -> bool {
        self.pending.contains_key(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_four_chunks_in_order() {
        let pool = BytePool::new();
        let mut r = Reassembler::new();
        let total = 131_072u32;
        let chunk_size = 32_768u32;

        for i in 0..3 {
            let chunk = vec![i as u8; chunk_size as usize];
            assert!(r.accept_chunk(&pool, 1, &chunk, i * chunk_size, total).is_none());
        }
        let last_chunk = vec![3u8; chunk_size as usize];
        let full = r.accept_chunk(&pool, 1, &last_chunk, 3 * chunk_size, total).unwrap();
        assert_eq!(full.len(), total as usize);
        assert!(!r.contains(1));
    }

    #[test]
    fn reassembles_out_of_order_chunks_by_offset() {
        let pool = BytePool::new();
        let mut r = Reassembler::new();
        let total = 12u32;

        assert!(r.accept_chunk(&pool, 5, &[9, 9, 9, 9], 8, total).is_none());
        assert!(r.accept_chunk(&pool, 5, &[0, 1, 2, 3], 0, total).is_none());
        let full = r.accept_chunk(&pool, 5, &[4, 5, 6, 7], 4, total).unwrap();
        assert_eq!(full, vec![0, 1, 2, 3, 4, 5, 6, 7, 9, 9, 9, 9]);
    }

    #[test]
    fn interleaved_packet_ids_dont_corrupt_each_other() {
        let pool = BytePool::new();
        let mut r = Reassembler::new();

        assert!(r.accept_chunk(&pool, 1, &[1, 1], 0, 4).is_none());
        assert!(r.accept_chunk(&pool, 2, &[2, 2], 0, 4).is_none());
        let a = r.accept_chunk(&pool, 1, &[1, 1], 2, 4).unwrap();
        let b = r.accept_chunk(&pool, 2, &[2, 2], 2, 4).unwrap();
        assert_eq!(a, vec![1, 1, 1, 1]);
        assert_eq!(b, vec![2, 2, 2, 2]);
    }

    #[test]
    fn oversized_chunk_placement_is_dropped_not_panicking() {
        let pool = BytePool::new();
        let mut r = Reassembler::new();
        assert!(r.accept_chunk(&pool, 1, &[1, 2, 3], 10, 4).is_none());
        assert!(!r.contains(1));
    }

    #[test]
    fn later_chunk_lying_about_total_length_is_dropped_not_panicking() {
        let pool = BytePool::new();
        let mut r = Reassembler::new();
        // First chunk allocates a 10-byte buffer for packet_id 1.
        assert!(r.accept_chunk(&pool, 1, &[0; 10], 0, 10).is_none());
        // A later chunk for the same packet_id claims a much larger
        // total_length; its own offset+len fits that claim but not the
        // buffer actually allocated, so it must be dropped, not panic.
        assert!(r.accept_chunk(&pool, 1, &[1, 2, 3, 4, 5], 50, 1000).is_none());
        assert!(r.contains(1));
    }
}
