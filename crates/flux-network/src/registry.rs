//! Command registry (C6): maps `command_id -> {deserializer, subscribers}`.
//!
//! One registry is shared across every receive path (both TCP and UDP, and
//! every peer). Dynamic dispatch is done by type erasure rather than
//! reflection: callers register a concrete `fn(&[u8]) -> Option<T>` per id,
//! and a concrete `FnMut(&T) -> bool` per subscription; the registry only
//! ever juggles `Box<dyn Any + Send>`.

use std::{
    any::Any,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use spin::Mutex;

use crate::{error::ProtocolMisuse, frame::is_reserved_command};

type Decoded = Box<dyn Any + Send>;
type DeserializeFn = Arc<dyn Fn(&[u8]) -> Option<Decoded> + Send + Sync>;
type Subscriber = Box<dyn FnMut(&Decoded) -> bool + Send>;

/// Opaque handle returned by [`CommandRegistry::add_data_received`], used to
/// remove that exact subscription later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct CommandEntry {
    deserializer: DeserializeFn,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
}

/// Thread-safe `command_id -> {deserializer, subscribers}` map.
pub struct CommandRegistry {
    commands: Mutex<HashMap<u16, Arc<CommandEntry>>>,
    next_subscription: AtomicU64,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self { commands: Mutex::new(HashMap::new()), next_subscription: AtomicU64::new(1) }
    }

    /// Registers `deserializer` under every id in `ids`. Ids above
    /// `USER_COMMAND_LIMIT` are rejected outright. If an id is already
    /// registered its existing entry (and subscribers) is left alone.
    pub fn add_command<F, T>(&self, ids: &[u16], deserializer: F) -> Result<(), ProtocolMisuse>
    where
        F: Fn(&[u8]) -> Option<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        if let Some(&bad) = ids.iter().find(|&&id| is_reserved_command(id)) {
            return Err(ProtocolMisuse::ReservedCommandId(bad));
        }

        let deser: DeserializeFn =
            Arc::new(move |bytes| deserializer(bytes).map(|v| Box::new(v) as Decoded));

        let mut map = self.commands.lock();
        for &id in ids {
            map.entry(id).or_insert_with(|| {
                Arc::new(CommandEntry { deserializer: deser.clone(), subscribers: Mutex::new(Vec::new()) })
            });
        }
        Ok(())
    }

    /// Removes every listed id. Returns whether any was actually present.
    pub fn remove_commands(&self, ids: &[u16]) -> bool {
        let mut map = self.commands.lock();
        ids.iter().fold(false, |any, id| map.remove(id).is_some() || any)
    }

    /// Appends `handler` to `id`'s subscriber list. Fails with
    /// [`ProtocolMisuse::UnknownCommandId`] if `id` has no deserializer
    /// registered yet.
    pub fn add_data_received<F, T>(
        &self,
        id: u16,
        mut handler: F,
    ) -> Result<SubscriptionId, ProtocolMisuse>
    where
        F: FnMut(&T) -> bool + Send + 'static,
        T: Send + 'static,
    {
        let entry = {
            let map = self.commands.lock();
            map.get(&id).cloned()
        }
        .ok_or(ProtocolMisuse::UnknownCommandId(id))?;

        let sub_id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let boxed: Subscriber = Box::new(move |decoded: &Decoded| match decoded.downcast_ref::<T>() {
            Some(v) => handler(v),
            None => true,
        });
        entry.subscribers.lock().push((sub_id, boxed));
        Ok(SubscriptionId(sub_id))
    }

    /// Removes the subscription identified by `subscription`, if `id` still
    /// has a registered entry and that subscription is still present.
    pub fn remove_data_received(&self, id: u16, subscription: SubscriptionId) {
        let entry = {
            let map = self.commands.lock();
            map.get(&id).cloned()
        };
        let Some(entry) = entry else { return };
        let mut subs = entry.subscribers.lock();
        if let Some(pos) = subs.iter().position(|(sid, _)| *sid == subscription.0) {
            subs.remove(pos);
        }
    }

    /// Deserializes `payload` under `id` and dispatches it to every
    /// subscriber newest-first. A subscriber returning `false` is dropped
    /// once the pass over the whole list finishes — the list is never
    /// mutated mid-iteration. Returns `false` if `id` is unregistered or
    /// deserialization fails.
    pub fn dispatch(&self, id: u16, payload: &[u8]) -> bool {
        let entry = {
            let map = self.commands.lock();
            map.get(&id).cloned()
        };
        let Some(entry) = entry else { return false };
        let Some(decoded) = (entry.deserializer)(payload) else { return false };

        let mut subs = entry.subscribers.lock();
        let mut keep = vec![true; subs.len()];
        for i in (0..subs.len()).rev() {
            if !(subs[i].1)(&decoded) {
                keep[i] = false;
            }
        }
        let mut idx = 0;
        subs.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
        true
    }

    pub fn is_registered(&self, id: u16) -> bool {
        self.commands.lock().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::AtomicUsize};

    use super::*;

    #[test]
    fn reserved_ids_rejected() {
        let reg = CommandRegistry::new();
        let err = reg.add_command::<_, u32>(&[crate::frame::PING], |b| {
            Some(u32::from_le_bytes(b.try_into().ok()?))
        });
        assert_eq!(err, Err(ProtocolMisuse::ReservedCommandId(crate::frame::PING)));
    }

    #[test]
    fn subscribe_requires_existing_deserializer() {
        let reg = CommandRegistry::new();
        let err = reg.add_data_received::<_, u32>(7, |_| true);
        assert_eq!(err, Err(ProtocolMisuse::UnknownCommandId(7)));
    }

    #[test]
    fn dispatch_calls_subscribers_newest_first() {
        let reg = CommandRegistry::new();
        reg.add_command::<_, u32>(&[1], |b| Some(u32::from_le_bytes(b.try_into().ok()?))).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        reg.add_data_received::<_, u32>(1, move |_| {
            o1.lock().push(1);
            true
        })
        .unwrap();
        let o2 = order.clone();
        reg.add_data_received::<_, u32>(1, move |_| {
            o2.lock().push(2);
            true
        })
        .unwrap();

        assert!(reg.dispatch(1, &42u32.to_le_bytes()));
        assert_eq!(*order.lock(), vec![2, 1]);
    }

    #[test]
    fn one_shot_subscriber_invoked_exactly_once() {
        let reg = CommandRegistry::new();
        reg.add_command::<_, u32>(&[1], |b| Some(u32::from_le_bytes(b.try_into().ok()?))).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        reg.add_data_received::<_, u32>(1, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            false
        })
        .unwrap();

        for _ in 0..5 {
            reg.dispatch(1, &1u32.to_le_bytes());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_unsubscribe_removes_handler() {
        let reg = CommandRegistry::new();
        reg.add_command::<_, u32>(&[1], |b| Some(u32::from_le_bytes(b.try_into().ok()?))).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = reg.add_data_received::<_, u32>(1, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        reg.dispatch(1, &1u32.to_le_bytes());
        reg.remove_data_received(1, sub);
        reg.dispatch(1, &1u32.to_le_bytes());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn existing_entry_kept_on_duplicate_registration() {
        let reg = CommandRegistry::new();
        reg.add_command::<_, u32>(&[1], |b| Some(u32::from_le_bytes(b.try_into().ok()?))).unwrap();
        let sub = reg.add_data_received::<_, u32>(1, |_| true).unwrap();
        reg.add_command::<_, u32>(&[1], |_| None::<u32>).unwrap();
        // Re-registering must not have wiped the subscriber list.
        reg.remove_data_received(1, sub);
    }
}
