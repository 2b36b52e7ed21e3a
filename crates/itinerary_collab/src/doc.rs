//! The replicated document.
//!
//! A [`Doc`] is a tree of map and array containers rooted at
//! [`DAYS_ROOT`] and [`COMMENTS_ROOT`]. All writes go through
//! [`Doc::transact`]; each transaction becomes one [`Update`] and one
//! [`TransactionEvent`] delivered to every deep observer after commit.
//!
//! Remote updates are integrated with [`Doc::apply_update`]. Integration is
//! idempotent and tolerates reordering: an op whose causal dependencies are
//! not present yet (an earlier op from the same client, the element it was
//! inserted after, the element it deletes, or the container it writes to) is
//! parked and retried whenever a later update arrives.

use crate::clock::{LamportClock, Timestamp, VectorClock};
use crate::lww_register::LwwMap;
use crate::op_id::{ClientId, OpId, Origin};
use crate::operation::{Op, OpLog, Update};
use crate::rga::Rga;
use crate::value::{ContainerId, Value, COMMENTS_ROOT, DAYS_ROOT};
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use tracing::debug;

/// One reversible effect of an integrated op.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    /// An element became visible
    Inserted { array: ContainerId, elem: OpId },
    /// A visible element was tombstoned
    Deleted { array: ContainerId, elem: OpId },
    /// A map key was overwritten; `prev` is the value it replaced
    Set {
        map: ContainerId,
        key: String,
        prev: Option<Value>,
    },
}

/// What a committed transaction did.
#[derive(Clone, Debug)]
pub struct TransactionEvent {
    pub origin: Origin,
    /// The ops integrated by this transaction, in order
    pub update: Update,
    pub changes: Vec<Change>,
    /// Maps whose keys changed, plus maps created by this transaction
    pub changed_maps: Vec<ContainerId>,
    /// Arrays whose elements changed, plus arrays created by this transaction
    pub changed_arrays: Vec<ContainerId>,
}

impl TransactionEvent {
    pub fn touched_map(&self, map: ContainerId) -> bool {
        self.changed_maps.contains(&map)
    }

    pub fn touched_array(&self, array: ContainerId) -> bool {
        self.changed_arrays.contains(&array)
    }
}

/// Handle returned by [`Doc::observe_deep`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Observer = Box<dyn FnMut(&TransactionEvent)>;

#[derive(Default)]
struct ChangeSet {
    ops: Vec<Op>,
    changes: Vec<Change>,
    maps: Vec<ContainerId>,
    arrays: Vec<ContainerId>,
    seen: HashSet<ContainerId>,
}

impl ChangeSet {
    fn touch(&mut self, value: &Value) {
        match value {
            Value::Map(id) => self.touch_map(*id),
            Value::Array(id) => self.touch_array(*id),
            _ => {}
        }
    }

    fn touch_map(&mut self, map: ContainerId) {
        if self.seen.insert(map) {
            self.maps.push(map);
        }
    }

    fn touch_array(&mut self, array: ContainerId) {
        if self.seen.insert(array) {
            self.arrays.push(array);
        }
    }

    fn into_event(self, origin: Origin) -> Option<TransactionEvent> {
        if self.ops.is_empty() {
            return None;
        }
        Some(TransactionEvent {
            origin,
            update: Update::new(self.ops),
            changes: self.changes,
            changed_maps: self.maps,
            changed_arrays: self.arrays,
        })
    }
}

enum Readiness {
    Seen,
    Ready,
    Blocked,
}

/// A replica of one itinerary document.
pub struct Doc {
    client_id: ClientId,
    clock: LamportClock,
    log: OpLog,
    maps: HashMap<ContainerId, LwwMap<String, Value>>,
    arrays: HashMap<ContainerId, Rga<Value>>,
    observers: Vec<(Subscription, Observer)>,
    next_subscription: u64,
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doc")
            .field("client_id", &self.client_id)
            .field("ops", &self.log.len())
            .field("maps", &self.maps.len())
            .field("arrays", &self.arrays.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Doc {
    /// Create an empty document owned by `client_id`.
    pub fn new(client_id: ClientId) -> Self {
        let mut maps = HashMap::new();
        maps.insert(COMMENTS_ROOT, LwwMap::new());
        let mut arrays = HashMap::new();
        arrays.insert(DAYS_ROOT, Rga::new());

        Self {
            client_id,
            clock: LamportClock::new(),
            log: OpLog::new(),
            maps,
            arrays,
            observers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Run `f` as one atomic transaction tagged with `origin`.
    ///
    /// Observers fire once after `f` returns, and only if it wrote something.
    pub fn transact<R>(&mut self, origin: Origin, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let mut txn = Transaction {
            doc: self,
            origin,
            set: ChangeSet::default(),
        };
        let result = f(&mut txn);
        let event = txn.set.into_event(origin);
        if let Some(event) = event {
            debug!(?origin, ops = event.update.len(), "committed transaction");
            self.dispatch(&event);
        }
        result
    }

    /// Integrate ops produced elsewhere.
    ///
    /// Ops already integrated are skipped. Ops with missing dependencies are
    /// parked and retried on every later call. Observers see one event with
    /// every op integrated by this call, including previously parked ones.
    pub fn apply_update(&mut self, update: &Update, origin: Origin) {
        let mut queue = self.log.take_pending();
        queue.extend(update.ops.iter().cloned());

        let mut set = ChangeSet::default();
        loop {
            let mut progressed = false;
            let mut blocked = Vec::new();
            for op in queue {
                match self.readiness(&op) {
                    Readiness::Seen => {}
                    Readiness::Ready => {
                        self.integrate(op, &mut set);
                        progressed = true;
                    }
                    Readiness::Blocked => blocked.push(op),
                }
            }
            queue = blocked;
            if !progressed || queue.is_empty() {
                break;
            }
        }
        for op in queue {
            self.log.park(op);
        }

        if let Some(event) = set.into_event(origin) {
            debug!(
                ?origin,
                ops = event.update.len(),
                pending = self.log.pending_len(),
                "applied update"
            );
            self.dispatch(&event);
        }
    }

    /// Register a callback fired after every transaction that wrote anything.
    pub fn observe_deep(&mut self, observer: impl FnMut(&TransactionEvent) + 'static) -> Subscription {
        self.next_subscription += 1;
        let subscription = Subscription(self.next_subscription);
        self.observers.push((subscription, Box::new(observer)));
        subscription
    }

    /// Remove a callback; returns false if it was not registered.
    pub fn unobserve(&mut self, subscription: Subscription) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(id, _)| *id != subscription);
        self.observers.len() != before
    }

    /// Highest contiguous op sequence integrated per client.
    pub fn state_vector(&self) -> VectorClock {
        self.log.state_vector().clone()
    }

    /// Ops a replica at `remote` is missing.
    pub fn diff(&self, remote: &VectorClock) -> Update {
        self.log.diff(remote)
    }

    /// Every op, enough to rebuild the document from scratch.
    pub fn encode_full(&self) -> Update {
        self.log.diff(&VectorClock::new())
    }

    /// Number of ops waiting for missing dependencies.
    pub fn pending_len(&self) -> usize {
        self.log.pending_len()
    }

    pub fn has_map(&self, map: ContainerId) -> bool {
        self.maps.contains_key(&map)
    }

    pub fn has_array(&self, array: ContainerId) -> bool {
        self.arrays.contains_key(&array)
    }

    pub fn array_len(&self, array: ContainerId) -> usize {
        self.arrays.get(&array).map_or(0, Rga::len)
    }

    pub fn array_get(&self, array: ContainerId, index: usize) -> Option<&Value> {
        let rga = self.arrays.get(&array)?;
        rga.id_at_index(index).and_then(|id| rga.get(id))
    }

    /// Visible elements of an array with their element ids, in order.
    pub fn array_elements(&self, array: ContainerId) -> Vec<(OpId, &Value)> {
        self.arrays
            .get(&array)
            .map(|rga| rga.iter().collect())
            .unwrap_or_default()
    }

    /// Value of an element, including one that has been deleted.
    pub fn element_value(&self, array: ContainerId, elem: OpId) -> Option<&Value> {
        self.arrays
            .get(&array)
            .and_then(|rga| rga.get_node(elem))
            .and_then(|node| node.value.as_ref())
    }

    /// Whether the element exists and is not deleted.
    pub fn is_visible(&self, array: ContainerId, elem: OpId) -> bool {
        self.arrays
            .get(&array)
            .and_then(|rga| rga.get(elem))
            .is_some()
    }

    pub fn map_get(&self, map: ContainerId, key: &str) -> Option<&Value> {
        self.maps.get(&map).and_then(|m| m.get(key))
    }

    /// Live entries of a map, sorted by key.
    pub fn map_entries(&self, map: ContainerId) -> Vec<(&str, &Value)> {
        let mut entries: Vec<(&str, &Value)> = self
            .maps
            .get(&map)
            .map(|m| m.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    fn dispatch(&mut self, event: &TransactionEvent) {
        for (_, observer) in self.observers.iter_mut() {
            observer(event);
        }
    }

    fn next_stamp(&mut self) -> Timestamp {
        Timestamp::new(self.clock.tick(), self.client_id)
    }

    fn next_id(&self) -> OpId {
        OpId::new(self.client_id, self.log.next_seq(self.client_id))
    }

    fn value_ready(&self, id: OpId, value: &Value) -> bool {
        match value {
            Value::Map(c) => *c == id || self.maps.contains_key(c),
            Value::Array(c) => *c == id || self.arrays.contains_key(c),
            _ => true,
        }
    }

    fn readiness(&self, op: &Op) -> Readiness {
        let id = op.id();
        if self.log.has_seen(id) {
            return Readiness::Seen;
        }
        if !self.log.is_next(id) {
            return Readiness::Blocked;
        }
        let ready = match op {
            Op::Insert {
                array,
                after,
                value,
                ..
            } => {
                self.arrays
                    .get(array)
                    .is_some_and(|rga| rga.can_insert_after(*after))
                    && self.value_ready(id, value)
            }
            Op::Delete { array, target, .. } => self
                .arrays
                .get(array)
                .is_some_and(|rga| rga.contains(*target)),
            Op::Set { map, value, .. } => {
                self.maps.contains_key(map)
                    && value.as_ref().map_or(true, |v| self.value_ready(id, v))
            }
        };
        if ready {
            Readiness::Ready
        } else {
            Readiness::Blocked
        }
    }

    fn create_container(&mut self, id: OpId, value: &Value) {
        match value {
            Value::Map(c) if *c == id => {
                self.maps.entry(*c).or_default();
            }
            Value::Array(c) if *c == id => {
                self.arrays.entry(*c).or_default();
            }
            _ => {}
        }
    }

    /// Apply an op whose dependencies are satisfied and record it.
    fn integrate(&mut self, op: Op, set: &mut ChangeSet) {
        if let Some(stamp) = op.stamp() {
            self.clock.sync(stamp.counter);
        }

        match &op {
            Op::Insert {
                id,
                stamp,
                array,
                after,
                value,
            } => {
                self.create_container(*id, value);
                let inserted = self
                    .arrays
                    .get_mut(array)
                    .is_some_and(|rga| rga.insert(*id, *stamp, *after, value.clone()));
                if inserted {
                    set.changes.push(Change::Inserted {
                        array: *array,
                        elem: *id,
                    });
                    set.touch_array(*array);
                    set.touch(value);
                }
            }
            Op::Delete { array, target, .. } => {
                let deleted = self
                    .arrays
                    .get_mut(array)
                    .is_some_and(|rga| rga.delete(*target));
                if deleted {
                    set.changes.push(Change::Deleted {
                        array: *array,
                        elem: *target,
                    });
                    set.touch_array(*array);
                }
            }
            Op::Set {
                id,
                stamp,
                map,
                key,
                value,
            } => {
                if let Some(value) = value {
                    self.create_container(*id, value);
                }
                if let Some(registers) = self.maps.get_mut(map) {
                    let prev = registers.get(key).cloned();
                    if registers.apply(key.clone(), value.clone(), *stamp) {
                        set.changes.push(Change::Set {
                            map: *map,
                            key: key.clone(),
                            prev,
                        });
                        set.touch_map(*map);
                        if let Some(value) = value {
                            set.touch(value);
                        }
                    }
                }
            }
        }

        self.log.record(op.clone());
        set.ops.push(op);
    }
}

/// Write access to a [`Doc`] inside [`Doc::transact`].
///
/// Reads go through `Deref<Target = Doc>` and observe the transaction's own
/// writes. Writes against a container that does not exist are ignored and
/// reported through the return value.
pub struct Transaction<'a> {
    doc: &'a mut Doc,
    origin: Origin,
    set: ChangeSet,
}

impl Deref for Transaction<'_> {
    type Target = Doc;

    fn deref(&self) -> &Doc {
        self.doc
    }
}

impl Transaction<'_> {
    pub fn origin(&self) -> Origin {
        self.origin
    }

    fn commit_local(&mut self, op: Op) {
        self.doc.integrate(op, &mut self.set);
    }

    fn insert_with(
        &mut self,
        array: ContainerId,
        after: Option<OpId>,
        make: impl FnOnce(OpId) -> Value,
    ) -> Option<OpId> {
        let rga = self.doc.arrays.get(&array)?;
        if !rga.can_insert_after(after) {
            return None;
        }
        let id = self.doc.next_id();
        let stamp = self.doc.next_stamp();
        self.commit_local(Op::Insert {
            id,
            stamp,
            array,
            after,
            value: make(id),
        });
        Some(id)
    }

    fn anchor_for_index(&self, array: ContainerId, index: usize) -> Option<Option<OpId>> {
        let rga = self.doc.arrays.get(&array)?;
        let index = index.min(rga.len());
        if index == 0 {
            Some(None)
        } else {
            Some(rga.id_at_index(index - 1))
        }
    }

    /// Insert `value` at a visible index (clamped to the length).
    pub fn array_insert(&mut self, array: ContainerId, index: usize, value: Value) -> Option<OpId> {
        let after = self.anchor_for_index(array, index)?;
        self.insert_with(array, after, |_| value)
    }

    /// Insert directly after a known element (live or deleted).
    pub fn array_insert_after(
        &mut self,
        array: ContainerId,
        after: Option<OpId>,
        value: Value,
    ) -> Option<OpId> {
        self.insert_with(array, after, |_| value)
    }

    pub fn array_push(&mut self, array: ContainerId, value: Value) -> Option<OpId> {
        let len = self.doc.array_len(array);
        self.array_insert(array, len, value)
    }

    /// Insert a fresh empty map at `index` and return its container id.
    pub fn array_insert_map(&mut self, array: ContainerId, index: usize) -> Option<ContainerId> {
        let after = self.anchor_for_index(array, index)?;
        self.insert_with(array, after, Value::Map)
    }

    pub fn array_push_map(&mut self, array: ContainerId) -> Option<ContainerId> {
        let len = self.doc.array_len(array);
        self.array_insert_map(array, len)
    }

    /// Delete a visible element by id. False if unknown or already deleted.
    pub fn array_delete(&mut self, array: ContainerId, elem: OpId) -> bool {
        if !self.doc.is_visible(array, elem) {
            return false;
        }
        let id = self.doc.next_id();
        self.commit_local(Op::Delete {
            id,
            array,
            target: elem,
        });
        true
    }

    /// Delete the element at a visible index.
    pub fn array_remove(&mut self, array: ContainerId, index: usize) -> bool {
        let elem = self
            .doc
            .arrays
            .get(&array)
            .and_then(|rga| rga.id_at_index(index));
        match elem {
            Some(elem) => self.array_delete(array, elem),
            None => false,
        }
    }

    /// Delete up to `len` elements starting at `index`; returns how many.
    pub fn array_remove_range(&mut self, array: ContainerId, index: usize, len: usize) -> usize {
        let targets: Vec<OpId> = self
            .doc
            .array_elements(array)
            .into_iter()
            .skip(index)
            .take(len)
            .map(|(id, _)| id)
            .collect();
        targets
            .into_iter()
            .filter(|elem| self.array_delete(array, *elem))
            .count()
    }

    pub fn array_clear(&mut self, array: ContainerId) -> usize {
        let len = self.doc.array_len(array);
        self.array_remove_range(array, 0, len)
    }

    /// Write a key; false if the map does not exist.
    pub fn map_set(&mut self, map: ContainerId, key: &str, value: impl Into<Value>) -> bool {
        self.map_write(map, key, |_| Some(value.into())).is_some()
    }

    /// Remove a key; false if the key had no value.
    pub fn map_remove(&mut self, map: ContainerId, key: &str) -> bool {
        if self.doc.map_get(map, key).is_none() {
            return false;
        }
        self.map_write(map, key, |_| None).is_some()
    }

    /// Store a fresh empty map under `key` and return its container id.
    pub fn map_set_map(&mut self, map: ContainerId, key: &str) -> Option<ContainerId> {
        self.map_write(map, key, |id| Some(Value::Map(id)))
    }

    /// Store a fresh empty array under `key` and return its container id.
    pub fn map_set_array(&mut self, map: ContainerId, key: &str) -> Option<ContainerId> {
        self.map_write(map, key, |id| Some(Value::Array(id)))
    }

    fn map_write(
        &mut self,
        map: ContainerId,
        key: &str,
        make: impl FnOnce(OpId) -> Option<Value>,
    ) -> Option<OpId> {
        if !self.doc.maps.contains_key(&map) {
            return None;
        }
        let id = self.doc.next_id();
        let stamp = self.doc.next_stamp();
        self.commit_local(Op::Set {
            id,
            stamp,
            map,
            key: key.to_string(),
            value: make(id),
        });
        Some(id)
    }
}
