//! Client table (C8, server-side): `peer_key -> client_state` under one
//! lock. Exclusively owned by the server engine.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use spin::Mutex;

/// Maps a transport-level peer identity (`mio::Token` for TCP,
/// `SocketAddr` for UDP) to the user's own per-client state `S`.
pub struct ClientTable<K, S> {
    clients: Mutex<HashMap<K, Arc<S>>>,
}

impl<K: Eq + Hash + Copy, S> Default for ClientTable<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Copy, S> ClientTable<K, S> {
    pub fn new() -> Self {
        Self { clients: Mutex::new(HashMap::new()) }
    }

    /// Invokes `create_client(peer)` and, if it returns `Some`, inserts the
    /// result. Returns the freshly-inserted state so the caller can raise
    /// `on_connected` with it; returns `None` if the user rejected the peer.
    pub fn insert_if<F>(&self, peer: K, create_client: F) -> Option<Arc<S>>
    where
        F: FnOnce(K) -> Option<S>,
    {
        let state = Arc::new(create_client(peer)?);
        self.clients.lock().insert(peer, state.clone());
        Some(state)
    }

    pub fn get(&self, peer: &K) -> Option<Arc<S>> {
        self.clients.lock().get(peer).cloned()
    }

    /// Removes and returns the client state so the caller can invoke
    /// `on_disconnected(reason)` with it outside the lock.
    pub fn remove(&self, peer: &K) -> Option<Arc<S>> {
        self.clients.lock().remove(peer)
    }

    pub fn contains(&self, peer: &K) -> bool {
        self.clients.lock().contains_key(peer)
    }

    /// Snapshots every `(peer, state)` pair under the lock, then releases
    /// it. `send_to_all` sends outside the lock using this snapshot.
    pub fn snapshot(&self) -> Vec<(K, Arc<S>)> {
        self.clients.lock().iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}
