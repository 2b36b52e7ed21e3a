//! Last-Writer-Wins (LWW) registers for scalar fields.
//!
//! Every field of a block, day, thread or comment is an LWW register inside an
//! [`LwwMap`]. Concurrent writes to the same field resolve to the write with
//! the highest [`Timestamp`]: higher Lamport counter first, higher client id as
//! the tie-breaker. Writes to different keys never interfere.
//!
//! # Example
//!
//! ```
//! use itinerary_collab::clock::Timestamp;
//! use itinerary_collab::lww_register::LwwRegister;
//! use itinerary_collab::op_id::ClientId;
//!
//! let mut title = LwwRegister::new("Museum".to_string(), Timestamp::new(1, ClientId::new(1)));
//! title.set("Gallery".to_string(), Timestamp::new(2, ClientId::new(2)));
//!
//! assert_eq!(title.get(), "Gallery");
//! ```

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// One field: a value and the timestamp of the write that set it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    timestamp: Timestamp,
}

impl<T> LwwRegister<T> {
    pub fn new(value: T, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Accept the write only if `timestamp` is newer than the stored one.
    pub fn set(&mut self, value: T, timestamp: Timestamp) -> bool {
        if timestamp > self.timestamp {
            self.value = value;
            self.timestamp = timestamp;
            true
        } else {
            false
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Field map with per-key last-writer-wins.
///
/// Values are wrapped in `Option<V>` internally so that removal is itself a
/// timestamped write (a tombstone) and races correctly with concurrent sets.
#[derive(Clone, Debug)]
pub struct LwwMap<K, V> {
    registers: HashMap<K, LwwRegister<Option<V>>>,
}

impl<K, V> Default for LwwMap<K, V> {
    fn default() -> Self {
        Self {
            registers: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> LwwMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key; `None` if absent or removed.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.registers.get(key).and_then(|reg| reg.get().as_ref())
    }

    /// Apply a write (`None` removes the key).
    ///
    /// Returns `true` if the write won and changed the register.
    pub fn apply(&mut self, key: K, value: Option<V>, timestamp: Timestamp) -> bool {
        match self.registers.get_mut(&key) {
            Some(register) => register.set(value, timestamp),
            None => {
                self.registers.insert(key, LwwRegister::new(value, timestamp));
                true
            }
        }
    }

    /// Live entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.registers
            .iter()
            .filter_map(|(k, v)| v.get().as_ref().map(|val| (k, val)))
    }

    /// Live keys
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
