//! Poller working set.
//!
//! Owned exclusively by the poller thread. Slots live in a slot map so
//! eviction is O(1) and never reorders the remaining entries; each cycle
//! the poller takes an index-paired snapshot of keys and interests.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};

use crate::identifiers::ConnectionId;
use crate::transport::Descriptor;

use super::connection::Connection;
use super::readiness::Interest;

// ============================================================================
// Types
// ============================================================================

new_key_type! {
    /// Key of a registry slot.
    pub(crate) struct SlotKey;
}

/// One registered connection.
pub(crate) struct Slot {
    pub connection: Connection,
    pub descriptor: Descriptor,
    /// Prefix of a message still being reassembled.
    pub partial: Vec<u8>,
}

// ============================================================================
// Registry
// ============================================================================

/// Registered connections keyed by slot, with an identity index.
#[derive(Default)]
pub(crate) struct Registry {
    slots: SlotMap<SlotKey, Slot>,
    by_id: FxHashMap<ConnectionId, SlotKey>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Adds a connection. A connection already present keeps its slot.
    pub(crate) fn insert(&mut self, connection: Connection, descriptor: Descriptor) -> SlotKey {
        let id = connection.id();
        if let Some(&key) = self.by_id.get(&id) {
            return key;
        }

        let key = self.slots.insert(Slot {
            connection,
            descriptor,
            partial: Vec::new(),
        });
        self.by_id.insert(id, key);
        key
    }

    pub(crate) fn get_mut(&mut self, key: SlotKey) -> Option<&mut Slot> {
        self.slots.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: SlotKey) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.by_id.remove(&slot.connection.id());
        self.release_if_empty();
        Some(slot)
    }

    pub(crate) fn remove_by_id(&mut self, id: ConnectionId) -> Option<Slot> {
        let key = self.by_id.get(&id).copied()?;
        self.remove(key)
    }

    /// Removes every slot, returning their connections in slot order.
    pub(crate) fn drain(&mut self) -> Vec<Connection> {
        let connections = self.slots.drain().map(|(_, slot)| slot.connection).collect();
        self.by_id.clear();
        self.release_if_empty();
        connections
    }

    /// Fills index-paired key, interest and buffered-data arrays.
    pub(crate) fn snapshot(
        &self,
        keys: &mut Vec<SlotKey>,
        interests: &mut Vec<Interest>,
        buffered: &mut Vec<bool>,
    ) {
        keys.clear();
        interests.clear();
        buffered.clear();

        for (key, slot) in &self.slots {
            let (has_buffered, wants_write) = slot.connection.poll_flags();
            keys.push(key);
            interests.push(Interest {
                descriptor: slot.descriptor,
                writable: wants_write,
            });
            buffered.push(has_buffered);
        }
    }

    /// Returns registered identities in slot order.
    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        self.slots.values().map(|slot| slot.connection.id()).collect()
    }

    /// Drops backing storage so an idle registry holds no allocation.
    fn release_if_empty(&mut self) {
        if self.slots.is_empty() {
            self.slots = SlotMap::with_key();
            self.by_id = FxHashMap::default();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Weak};

    use crate::pool::connection::Callbacks;
    use crate::pool::options::PoolOptions;
    use crate::transport::Transport;
    use crate::transport::scripted::ScriptedTransport;

    fn connection(transport: &ScriptedTransport) -> (Connection, Descriptor) {
        let handle = transport.open("scripted://r").expect("open");
        let descriptor = handle.descriptor().expect("descriptor");
        let connection = Connection::new(
            ConnectionId::next(),
            "scripted://r",
            handle,
            Callbacks::new(),
            Arc::new(PoolOptions::new()),
            Weak::new(),
        );
        (connection, descriptor)
    }

    #[test]
    fn test_insert_and_snapshot_are_paired() {
        let transport = ScriptedTransport::new();
        let mut registry = Registry::new();

        let mut expected = Vec::new();
        for _ in 0..3 {
            let (conn, fd) = connection(&transport);
            let key = registry.insert(conn, fd);
            expected.push((key, fd));
        }

        let (mut keys, mut interests, mut buffered) = (Vec::new(), Vec::new(), Vec::new());
        registry.snapshot(&mut keys, &mut interests, &mut buffered);

        assert_eq!(registry.len(), 3);
        assert_eq!(keys.len(), interests.len());
        for (key, fd) in expected {
            let index = keys.iter().position(|k| *k == key).expect("key present");
            assert_eq!(interests[index], Interest::readable(fd));
        }
        assert!(buffered.iter().all(|b| !b));
    }

    #[test]
    fn test_remove_preserves_order() {
        let transport = ScriptedTransport::new();
        let mut registry = Registry::new();

        let mut keys = Vec::new();
        for _ in 0..4 {
            let (conn, fd) = connection(&transport);
            keys.push(registry.insert(conn, fd));
        }
        let before = registry.ids();

        let removed = registry.remove(keys[1]).expect("slot");
        let after = registry.ids();

        let expected: Vec<_> = before
            .into_iter()
            .filter(|id| *id != removed.connection.id())
            .collect();
        assert_eq!(after, expected);
    }

    #[test]
    fn test_duplicate_insert_keeps_one_slot() {
        let transport = ScriptedTransport::new();
        let mut registry = Registry::new();
        let (conn, fd) = connection(&transport);

        let first = registry.insert(conn.clone(), fd);
        let second = registry.insert(conn, fd);

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_by_id_and_drain() {
        let transport = ScriptedTransport::new();
        let mut registry = Registry::new();

        let (a, fd_a) = connection(&transport);
        let (b, fd_b) = connection(&transport);
        let a_id = a.id();
        registry.insert(a, fd_a);
        registry.insert(b, fd_b);

        assert!(registry.remove_by_id(a_id).is_some());
        assert!(registry.remove_by_id(a_id).is_none());
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }
}
