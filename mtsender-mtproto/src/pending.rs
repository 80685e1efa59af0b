//! In-flight requests keyed by message id.

use std::collections::HashMap;
use std::collections::hash_map;

use crate::message::MessageId;

/// Correlates outgoing message ids with whatever state the sender keeps for
/// them until a response arrives.
///
/// The table is owned by exactly one dispatch path; it does no locking of its
/// own. Entries never outlive the connection that sent them: on teardown the
/// owner [`drain`](Self::drain)s the table and fails or resends every entry.
#[derive(Debug)]
pub struct PendingTable<T> {
    entries: HashMap<MessageId, T>,
}

impl<T> PendingTable<T> {
    /// An empty table.
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Register `state` under `id`, returning any entry it replaced.
    pub fn insert(&mut self, id: MessageId, state: T) -> Option<T> {
        let prev = self.entries.insert(id, state);
        if prev.is_some() {
            log::warn!("[pending] message id {id} was already in flight; replaced");
        }
        prev
    }

    /// Look up an entry without removing it.
    pub fn get(&self, id: MessageId) -> Option<&T> {
        self.entries.get(&id)
    }

    /// Mutable lookup, e.g. to record an acknowledgement.
    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    /// Remove and return the entry; a second call for the same id returns
    /// `None`, so a response can resolve its request at most once.
    pub fn take(&mut self, id: MessageId) -> Option<T> {
        self.entries.remove(&id)
    }

    /// Drop the entry (request cancelled). Returns whether it existed.
    pub fn remove(&mut self, id: MessageId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Whether `id` is in flight.
    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id)
    }

    /// All in-flight states, for the periodic resend scan.
    pub fn values(&self) -> hash_map::Values<'_, MessageId, T> {
        self.entries.values()
    }

    /// All in-flight entries with their ids.
    pub fn iter(&self) -> hash_map::Iter<'_, MessageId, T> {
        self.entries.iter()
    }

    /// Mutable iteration, e.g. to mark every entry dirty.
    pub fn values_mut(&mut self) -> hash_map::ValuesMut<'_, MessageId, T> {
        self.entries.values_mut()
    }

    /// Keep only the entries for which `keep` returns `true`; the rest are
    /// returned with their ids.
    pub fn retain(&mut self, mut keep: impl FnMut(MessageId, &T) -> bool) -> Vec<(MessageId, T)> {
        let dropped: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(id, state)| !keep(**id, state))
            .map(|(id, _)| *id)
            .collect();
        dropped
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|state| (id, state)))
            .collect()
    }

    /// Remove everything and hand it back to the caller.
    pub fn drain(&mut self) -> Vec<(MessageId, T)> {
        self.entries.drain().collect()
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of requests in flight.
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self { Self::new() }
}
