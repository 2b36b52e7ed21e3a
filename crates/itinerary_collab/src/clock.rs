//! Logical time.
//!
//! [`Timestamp`]s order field writes and sibling inserts; wall-clock time
//! never decides a conflict. A [`VectorClock`] is a replica's state vector:
//! for every client, the highest sequence number integrated so far.

use crate::op_id::ClientId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Lamport counter owned by one replica.
#[derive(Debug, Clone, Default)]
pub struct LamportClock {
    counter: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u64 {
        self.counter
    }

    /// Advance for a local event.
    pub fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Catch up with a counter seen in a remote op.
    pub fn sync(&mut self, seen: u64) {
        if seen > self.counter {
            self.counter = seen;
        }
    }
}

/// Total order over writes: counter first, then the writer's client id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub counter: u64,
    pub client_id: ClientId,
}

impl Timestamp {
    pub fn new(counter: u64, client_id: ClientId) -> Self {
        Self { counter, client_id }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::new(0, ClientId::new(0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.client_id.0)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.counter, self.client_id).cmp(&(other.counter, other.client_id))
    }
}

/// State vector.
///
/// Ops of one client are integrated in sequence order, so `get(c) == n`
/// means ops `1..=n` of `c` are all present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    seqs: BTreeMap<ClientId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest integrated sequence number of a client (0 if none).
    pub fn get(&self, client_id: ClientId) -> u64 {
        self.seqs.get(&client_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, client_id: ClientId, seq: u64) {
        self.seqs.insert(client_id, seq);
    }

    /// True when every op this clock covers is also covered by `self`.
    pub fn covers(&self, other: &VectorClock) -> bool {
        other.seqs.iter().all(|(&client, &seq)| self.get(client) >= seq)
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }
}
