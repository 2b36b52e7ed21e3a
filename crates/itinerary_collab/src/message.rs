//! Wire protocol between clients and the relay.
//!
//! Messages are JSON objects tagged by a `type` field. A session looks like:
//!
//! 1. client → `join` with its auth token and state vector
//! 2. relay → `syncStep` with the ops the client lacks and the relay's state vector
//! 3. client → `update` with the ops the relay lacks (computed from that vector)
//! 4. both directions: `update` and `awareness` as edits and presence change
//!
//! Failures are reported with `error`.

use crate::awareness::AwarenessState;
use crate::clock::VectorClock;
use crate::op_id::ClientId;
use crate::operation::Update;
use serde::{Deserialize, Serialize};

/// Messages sent from client to relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Enter an itinerary room.
    #[serde(rename_all = "camelCase")]
    Join {
        itinerary_id: String,
        token: String,
        client_id: ClientId,
        state_vector: VectorClock,
    },

    /// Ops produced locally (or the catch-up diff after a sync step).
    Update { update: Update },

    /// Presence of the sender; `None` clears it.
    Awareness { state: Option<AwarenessState> },

    /// Leave the room.
    Leave,
}

/// Messages sent from relay to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// First reconciliation after join.
    #[serde(rename_all = "camelCase")]
    SyncStep {
        update: Update,
        state_vector: VectorClock,
    },

    /// Ops from another peer.
    Update { update: Update },

    /// Presence of another peer; `None` means the peer left.
    #[serde(rename_all = "camelCase")]
    Awareness {
        client_id: ClientId,
        state: Option<AwarenessState>,
    },

    /// The relay refused or could not process a request.
    Error { message: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
