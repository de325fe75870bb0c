//! Connection identifiers.
//!
//! Ids are generational: the low 32 bits name a slot in the connection
//! arena, the high 32 bits count how many times that slot has been handed
//! out. A recycled slot therefore never reproduces an id that a handler or
//! a group might still be holding.

use std::fmt;
use std::str::FromStr;

use slab::Slab;

/// Opaque connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn new(slot: usize, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | slot as u64)
    }

    /// Arena slot this id points at.
    pub(crate) fn slot(self) -> usize {
        (self.0 & u64::from(u32::MAX)) as usize
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(ConnectionId)
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Slab arena that hands out generational ids for its entries.
pub struct IdArena<T> {
    entries: Slab<(ConnectionId, T)>,
    generations: Vec<u32>,
}

impl<T> IdArena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
        }
    }

    /// Insert a value built from its freshly allocated id.
    pub fn insert_with(&mut self, make: impl FnOnce(ConnectionId) -> T) -> ConnectionId {
        let entry = self.entries.vacant_entry();
        let slot = entry.key();
        if slot >= self.generations.len() {
            self.generations.resize(slot + 1, 0);
        }
        let id = ConnectionId::new(slot, self.generations[slot]);
        entry.insert((id, make(id)));
        id
    }

    /// Look up a live entry. Stale ids from a recycled slot miss.
    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        match self.entries.get(id.slot()) {
            Some((live, value)) if *live == id => Some(value),
            _ => None,
        }
    }

    /// Remove an entry and retire its id.
    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let slot = id.slot();
        match self.entries.get(slot) {
            Some((live, _)) if *live == id => {}
            _ => return None,
        }
        let (_, value) = self.entries.remove(slot);
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &T)> {
        self.entries.iter().map(|(_, (id, value))| (*id, value))
    }
}
