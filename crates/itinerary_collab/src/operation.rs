//! Replicated operations, update batches and the operation log.
//!
//! Every mutation of a document is one [`Op`]. A transaction produces an
//! [`Update`] (a batch of ops), which is the unit that travels over the
//! transport and is appended to the durable store. An [`OpLog`] keeps every
//! integrated op in causal order together with the state vector describing
//! it, so a replica can answer "what is this peer missing?".

use crate::clock::{Timestamp, VectorClock};
use crate::op_id::{ClientId, OpId};
use crate::value::{ContainerId, Value};
use serde::{Deserialize, Serialize};

/// A single replicated operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Op {
    /// Insert an element into an array after `after` (None = at the start)
    Insert {
        id: OpId,
        stamp: Timestamp,
        array: ContainerId,
        after: Option<OpId>,
        value: Value,
    },

    /// Tombstone an array element
    Delete {
        id: OpId,
        array: ContainerId,
        target: OpId,
    },

    /// Write a map key (None removes it)
    Set {
        id: OpId,
        stamp: Timestamp,
        map: ContainerId,
        key: String,
        value: Option<Value>,
    },
}

impl Op {
    /// Get the operation ID
    pub fn id(&self) -> OpId {
        match self {
            Op::Insert { id, .. } | Op::Delete { id, .. } | Op::Set { id, .. } => *id,
        }
    }

    /// Get the client who created this operation
    pub fn client_id(&self) -> ClientId {
        self.id().client_id
    }

    /// The container this operation writes to
    pub fn container(&self) -> ContainerId {
        match self {
            Op::Insert { array, .. } | Op::Delete { array, .. } => *array,
            Op::Set { map, .. } => *map,
        }
    }

    /// The logical timestamp carried by the op, if it takes part in ordering
    pub fn stamp(&self) -> Option<Timestamp> {
        match self {
            Op::Insert { stamp, .. } | Op::Set { stamp, .. } => Some(*stamp),
            Op::Delete { .. } => None,
        }
    }

    /// Check if this is a delete operation
    pub fn is_delete(&self) -> bool {
        matches!(self, Op::Delete { .. })
    }
}

/// A batch of operations produced by one transaction (or a state diff)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
}

impl Update {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON string
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Log of integrated operations in causal order.
///
/// Operations from one client are accepted strictly in sequence; an op that
/// arrives ahead of its predecessors is parked in `pending` until the gap is
/// filled.
#[derive(Clone, Debug, Default)]
pub struct OpLog {
    ops: Vec<Op>,
    state: VectorClock,
    pending: Vec<Op>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The state vector of everything recorded
    pub fn state_vector(&self) -> &VectorClock {
        &self.state
    }

    /// Whether the op has already been recorded
    pub fn has_seen(&self, id: OpId) -> bool {
        id.seq <= self.state.get(id.client_id)
    }

    /// Whether the op is the next one expected from its client
    pub fn is_next(&self, id: OpId) -> bool {
        id.seq == self.state.get(id.client_id) + 1
    }

    /// Next sequence number for a locally generated op
    pub fn next_seq(&self, client_id: ClientId) -> u64 {
        self.state.get(client_id) + 1
    }

    /// Append an op. The caller guarantees [`OpLog::is_next`].
    pub fn record(&mut self, op: Op) {
        let id = op.id();
        debug_assert!(self.is_next(id));
        self.state.set(id.client_id, id.seq);
        self.ops.push(op);
    }

    /// Park an op whose predecessors are missing
    pub fn park(&mut self, op: Op) {
        self.pending.push(op);
    }

    /// Take the parked ops for another integration attempt
    pub fn take_pending(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.pending)
    }

    /// Number of parked ops
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record every op of `update` that is new, honouring per-client order.
    ///
    /// Returns the ops that were actually recorded, in recording order.
    pub fn merge(&mut self, update: &Update) -> Update {
        let mut queue = self.take_pending();
        queue.extend(update.ops.iter().cloned());

        let mut accepted = Vec::new();
        loop {
            let mut progressed = false;
            let mut blocked = Vec::new();
            for op in queue {
                let id = op.id();
                if self.has_seen(id) {
                    continue;
                }
                if self.is_next(id) {
                    self.record(op.clone());
                    accepted.push(op);
                    progressed = true;
                } else {
                    blocked.push(op);
                }
            }
            queue = blocked;
            if !progressed || queue.is_empty() {
                break;
            }
        }
        self.pending = queue;
        Update::new(accepted)
    }

    /// Ops the holder of `remote` has not seen, in causal order
    pub fn diff(&self, remote: &VectorClock) -> Update {
        Update::new(
            self.ops
                .iter()
                .filter(|op| op.id().seq > remote.get(op.client_id()))
                .cloned()
                .collect(),
        )
    }

    /// Number of recorded operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::COMMENTS_ROOT;

    fn set(client: u64, seq: u64, key: &str) -> Op {
        Op::Set {
            id: OpId::new(client, seq),
            stamp: Timestamp::new(seq, ClientId::new(client)),
            map: COMMENTS_ROOT,
            key: key.to_string(),
            value: Some(Value::Bool(true)),
        }
    }

    #[test]
    fn test_op_accessors() {
        let op = set(3, 7, "k");
        assert_eq!(op.id(), OpId::new(3u64, 7));
        assert_eq!(op.client_id(), ClientId::new(3));
        assert_eq!(op.container(), COMMENTS_ROOT);
        assert!(op.stamp().is_some());
        assert!(!op.is_delete());
    }

    #[test]
    fn test_update_json() {
        let update = Update::new(vec![set(1, 1, "a")]);
        let json = update.to_json().unwrap();
        assert!(json.contains("\"op\":\"set\""));
        assert_eq!(Update::from_json(&json).unwrap(), update);
    }

    #[test]
    fn test_merge_skips_duplicates() {
        let mut log = OpLog::new();
        let update = Update::new(vec![set(1, 1, "a"), set(1, 2, "b")]);

        assert_eq!(log.merge(&update).len(), 2);
        assert_eq!(log.merge(&update).len(), 0);
        assert_eq!(log.len(), 2);
        assert_eq!(log.state_vector().get(ClientId::new(1)), 2);
    }

    #[test]
    fn test_merge_parks_gaps_until_filled() {
        let mut log = OpLog::new();

        let late = Update::new(vec![set(1, 2, "b"), set(1, 3, "c")]);
        assert!(log.merge(&late).is_empty());
        assert_eq!(log.pending_len(), 2);

        let first = Update::new(vec![set(1, 1, "a")]);
        let accepted = log.merge(&first);
        let seqs: Vec<u64> = accepted.ops.iter().map(|op| op.id().seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(log.pending_len(), 0);
    }

    #[test]
    fn test_diff_against_state_vector() {
        let mut log = OpLog::new();
        log.merge(&Update::new(vec![set(1, 1, "a"), set(2, 1, "b"), set(1, 2, "c")]));

        let mut remote = VectorClock::new();
        remote.set(ClientId::new(1), 1);

        let missing = log.diff(&remote);
        let ids: Vec<OpId> = missing.ops.iter().map(Op::id).collect();
        assert_eq!(ids, vec![OpId::new(2u64, 1), OpId::new(1u64, 2)]);
        assert_eq!(log.diff(log.state_vector()).len(), 0);
    }
}
