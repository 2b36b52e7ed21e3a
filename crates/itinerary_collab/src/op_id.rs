//! Replica, operation and transaction-origin identifiers.
//!
//! This module provides types for uniquely identifying replicas and the
//! operations they produce, plus the origin tag every transaction carries so
//! observers can tell their own edits from a peer's.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Replica id, drawn at random when a session opens.
///
/// Tie-breaker for concurrent writes and the key of presence records.
/// `ClientId(0)` belongs to the root containers and is never handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Random non-zero id.
    pub fn random() -> Self {
        let (high, low) = Uuid::new_v4().as_u64_pair();
        Self((high ^ low).max(1))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Id of one op: its author plus the author's sequence number.
///
/// Sequence numbers start at 1 and have no gaps, so a state vector entry
/// names exactly which of a client's ops a replica holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub client_id: ClientId,
    pub seq: u64,
}

impl OpId {
    pub fn new(client_id: impl Into<ClientId>, seq: u64) -> Self {
        Self {
            client_id: client_id.into(),
            seq,
        }
    }

    /// Head of every sequence.
    pub fn root() -> Self {
        Self::new(ClientId(0), 0)
    }

    pub fn is_root(&self) -> bool {
        *self == Self::root()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id.0, self.seq)
    }
}

/// Identifier of one editing session (one live bundle in one process).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a transaction came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// An edit made through the mutation API of a session.
    Local(SessionId),
    /// First-sync seeding from a caller supplied snapshot.
    Seed(SessionId),
    /// A transaction replaying an undo step.
    Undo(SessionId),
    /// A transaction replaying a redo step.
    Redo(SessionId),
    /// Operations received from a peer or the relay.
    Remote,
    /// Operations replayed from the durable local store.
    Persistence,
}

impl Origin {
    /// True when the transaction was produced by the given session.
    pub fn is_from(&self, session: SessionId) -> bool {
        match self {
            Origin::Local(id) | Origin::Seed(id) | Origin::Undo(id) | Origin::Redo(id) => {
                *id == session
            }
            Origin::Remote | Origin::Persistence => false,
        }
    }

    /// True for operations that arrived over the transport.
    pub fn is_remote(&self) -> bool {
        matches!(self, Origin::Remote)
    }
}
