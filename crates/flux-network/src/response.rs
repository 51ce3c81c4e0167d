//! Response table (C7): client-local `response_id -> pending completion`
//! map with cancellation/timeout.
//!
//! Exactly one of `complete`, `cancel`, or a timeout sweep observes a given
//! entry; the others become no-ops once it's gone.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use flux_timing::{Duration, Instant};
use spin::Mutex;
use tracing::debug;

use crate::{error::ResponseOutcome, pool::BytePool};

/// Default `send_r` timeout per spec.
pub fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

enum Slot {
    Pending,
    Done(Vec<u8>),
    Resolved(ResponseOutcome),
}

struct PendingRequest {
    slot: Arc<Mutex<Slot>>,
    deadline: Instant,
}

/// Handle a caller awaits after `register`. Resolves exactly once via
/// `poll`, which the owning client engine's receive/timer loop calls
/// repeatedly until it returns `Some`.
pub struct ResponseHandle {
    response_id: u32,
    slot: Arc<Mutex<Slot>>,
}

impl ResponseHandle {
    pub fn response_id(&self) -> u32 {
        self.response_id
    }

    /// Non-blocking poll: `Some(Ok(payload))` once the response lands,
    /// `Some(Err(_))` once timed out/cancelled, `None` while still pending.
    pub fn poll(&self) -> Option<Result<Vec<u8>, ResponseOutcome>> {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Pending => None,
            Slot::Done(_) => {
                let Slot::Done(payload) =
                    std::mem::replace(&mut *slot, Slot::Resolved(ResponseOutcome::Cancelled))
                else {
                    unreachable!()
                };
                Some(Ok(payload))
            }
            Slot::Resolved(reason) => Some(Err(*reason)),
        }
    }
}

/// Client-local `response_id -> pending completion` table.
pub struct ResponseTable {
    next_response_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

impl Default for ResponseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTable {
    pub fn new() -> Self {
        // Start at 1: 0 means "not a response to a prior request" and is
        // never handed out, skipped uniformly on wraparound too.
        Self { next_response_id: AtomicU32::new(1), pending: Mutex::new(HashMap::new()) }
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_response_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Allocates a fresh `response_id` and a pending completion that expires
    /// after `timeout`.
    pub fn register(&self, timeout: Duration) -> (u32, ResponseHandle) {
        let id = self.next_id();
        let slot = Arc::new(Mutex::new(Slot::Pending));
        let deadline = Instant::now() + timeout;
        self.pending.lock().insert(id, PendingRequest { slot: slot.clone(), deadline });
        (id, ResponseHandle { response_id: id, slot })
    }

    /// Fulfils `response_id` with `payload`. If the entry is already gone
    /// (cancelled or timed out), `payload` is returned to `pool` instead.
    pub fn complete(&self, pool: &BytePool, response_id: u32, payload: Vec<u8>) {
        let Some(req) = self.pending.lock().remove(&response_id) else {
            pool.put(payload);
            return;
        };
        *req.slot.lock() = Slot::Done(payload);
    }

    /// Removes `response_id` and signals cancellation to its awaiter.
    pub fn cancel(&self, response_id: u32) {
        if let Some(req) = self.pending.lock().remove(&response_id) {
            *req.slot.lock() = Slot::Resolved(ResponseOutcome::Cancelled);
        }
    }

    /// Removes and times out every entry whose deadline has passed. Called
    /// periodically from the client engine's poll loop.
    pub fn expire_timed_out(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let expired: Vec<u32> =
            pending.iter().filter(|(_, r)| now >= r.deadline).map(|(id, _)| *id).collect();
        for id in expired {
            if let Some(req) = pending.remove(&id) {
                debug!(response_id = id, "response: request timed out waiting for reply");
                *req.slot.lock() = Slot::Resolved(ResponseOutcome::Timeout);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, response_id: u32) -> bool {
        self.pending.lock().contains_key(&response_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_fulfils_handle_and_clears_table() {
        let table = ResponseTable::new();
        let pool = BytePool::new();
        let (id, handle) = table.register(default_timeout());
        assert!(table.contains(id));
        table.complete(&pool, id, vec![1, 2, 3]);
        assert!(!table.contains(id));
        assert_eq!(handle.poll(), Some(Ok(vec![1, 2, 3])));
    }

    #[test]
    fn cancel_signals_handle_and_clears_table() {
        let table = ResponseTable::new();
        let (id, handle) = table.register(default_timeout());
        table.cancel(id);
        assert!(!table.contains(id));
        assert_eq!(handle.poll(), Some(Err(ResponseOutcome::Cancelled)));
    }

    #[test]
    fn late_completion_after_cancel_returns_buffer_to_pool() {
        let table = ResponseTable::new();
        let pool = BytePool::new();
        let (id, _handle) = table.register(default_timeout());
        table.cancel(id);
        // Simulates a response arriving after the slot was already resolved.
        table.complete(&pool, id, vec![9; 64]);
        assert!(!table.contains(id));
    }

    #[test]
    fn timeout_sweep_cancels_expired_entries() {
        let table = ResponseTable::new();
        let (id, handle) = table.register(Duration::ZERO);
        std::thread::sleep(std::time::Duration::from_millis(1));
        table.expire_timed_out();
        assert!(!table.contains(id));
        assert_eq!(handle.poll(), Some(Err(ResponseOutcome::Timeout)));
    }

    #[test]
    fn response_id_never_zero() {
        let table = ResponseTable::new();
        for _ in 0..10 {
            let (id, _) = table.register(default_timeout());
            assert_ne!(id, 0);
        }
    }
}
