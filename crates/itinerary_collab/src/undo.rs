//! Session-scoped undo/redo over a [`Doc`].
//!
//! The manager observes the document and records the [`Change`]s of
//! transactions tagged `Origin::Local` for its own session. Remote, seed and
//! persistence transactions never reach the stacks, so undoing a local edit
//! leaves concurrent edits from other peers in place.
//!
//! Undo replays the inverse of a stack item as a new transaction tagged
//! `Origin::Undo`; the changes of that transaction become the matching redo
//! item. Inverses are ordinary ops, so they replicate like any other edit:
//!
//! - insert: the element is deleted again
//! - delete: the retained value is re-inserted directly after the tombstone
//! - key set: the previous value is written back (or the key removed)
//!
//! Consecutive local transactions within the capture timeout are merged into
//! one item unless [`UndoManager::stop_capturing`] was called or a
//! transaction of another origin landed in between.

use crate::doc::{Change, Doc, Subscription, Transaction, TransactionEvent};
use crate::op_id::{Origin, SessionId};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default window in which local edits coalesce into one undo step.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
struct StackItem {
    changes: Vec<Change>,
}

#[derive(Debug)]
struct UndoStacks {
    session: SessionId,
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    capture_timeout: Duration,
    last_capture: Option<Instant>,
    capturing: bool,
}

impl UndoStacks {
    fn observe(&mut self, event: &TransactionEvent) {
        if event.changes.is_empty() {
            return;
        }
        let item = StackItem {
            changes: event.changes.clone(),
        };

        match event.origin {
            Origin::Local(id) if id == self.session => {
                let now = Instant::now();
                let within_window = self
                    .last_capture
                    .is_some_and(|at| now.duration_since(at) < self.capture_timeout);

                match self.undo_stack.last_mut() {
                    Some(top) if self.capturing && within_window => {
                        top.changes.extend(item.changes);
                    }
                    _ => self.undo_stack.push(item),
                }
                self.redo_stack.clear();
                self.last_capture = Some(now);
                self.capturing = true;
            }
            Origin::Undo(id) if id == self.session => self.redo_stack.push(item),
            Origin::Redo(id) if id == self.session => self.undo_stack.push(item),
            // Someone else's edit ends the current step
            _ => self.capturing = false,
        }
    }
}

/// Linear undo/redo history for one session.
pub struct UndoManager {
    session: SessionId,
    stacks: Rc<RefCell<UndoStacks>>,
    subscription: Subscription,
}

impl UndoManager {
    /// Start tracking local transactions of `session` on `doc`.
    pub fn new(doc: &mut Doc, session: SessionId, capture_timeout: Duration) -> Self {
        let stacks = Rc::new(RefCell::new(UndoStacks {
            session,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            capture_timeout,
            last_capture: None,
            capturing: false,
        }));

        let observer = Rc::clone(&stacks);
        let subscription = doc.observe_deep(move |event| observer.borrow_mut().observe(event));

        Self {
            session,
            stacks,
            subscription,
        }
    }

    /// Revert the most recent local step. No-op (false) if there is none.
    pub fn undo(&self, doc: &mut Doc) -> bool {
        let Some(item) = self.stacks.borrow_mut().undo_stack.pop() else {
            return false;
        };
        debug!(session = %self.session, changes = item.changes.len(), "undo");
        doc.transact(Origin::Undo(self.session), |txn| revert(txn, &item.changes));
        self.stop_capturing();
        true
    }

    /// Re-apply the most recently undone step. No-op (false) if there is none.
    pub fn redo(&self, doc: &mut Doc) -> bool {
        let Some(item) = self.stacks.borrow_mut().redo_stack.pop() else {
            return false;
        };
        debug!(session = %self.session, changes = item.changes.len(), "redo");
        doc.transact(Origin::Redo(self.session), |txn| revert(txn, &item.changes));
        self.stop_capturing();
        true
    }

    pub fn can_undo(&self) -> bool {
        !self.stacks.borrow().undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.stacks.borrow().redo_stack.is_empty()
    }

    /// Make the next local transaction start a new undo step.
    pub fn stop_capturing(&self) {
        self.stacks.borrow_mut().capturing = false;
    }

    /// Drop all history.
    pub fn clear(&self) {
        let mut stacks = self.stacks.borrow_mut();
        stacks.undo_stack.clear();
        stacks.redo_stack.clear();
        stacks.capturing = false;
    }

    /// Stop observing `doc`.
    pub fn detach(&self, doc: &mut Doc) {
        doc.unobserve(self.subscription);
    }
}

fn revert(txn: &mut Transaction<'_>, changes: &[Change]) {
    for change in changes.iter().rev() {
        match change {
            Change::Inserted { array, elem } => {
                txn.array_delete(*array, *elem);
            }
            Change::Deleted { array, elem } => {
                if let Some(value) = txn.element_value(*array, *elem).cloned() {
                    txn.array_insert_after(*array, Some(*elem), value);
                }
            }
            Change::Set { map, key, prev } => match prev {
                Some(value) => {
                    txn.map_set(*map, key, value.clone());
                }
                None => {
                    txn.map_remove(*map, key);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_id::ClientId;
    use crate::value::{Value, COMMENTS_ROOT, DAYS_ROOT};

    fn setup(timeout: Duration) -> (Doc, SessionId, UndoManager) {
        let mut doc = Doc::new(ClientId::new(1));
        let session = SessionId::generate();
        let undo = UndoManager::new(&mut doc, session, timeout);
        (doc, session, undo)
    }

    fn titles(doc: &Doc) -> Vec<String> {
        doc.array_elements(DAYS_ROOT)
            .into_iter()
            .filter_map(|(_, v)| v.as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_empty_stacks_are_noops() {
        let (mut doc, _, undo) = setup(Duration::ZERO);
        assert!(!undo.can_undo());
        assert!(!undo.undo(&mut doc));
        assert!(!undo.redo(&mut doc));
        assert_eq!(doc.encode_full().len(), 0);
    }

    #[test]
    fn test_undo_redo_insert() {
        let (mut doc, session, undo) = setup(Duration::ZERO);
        doc.transact(Origin::Local(session), |txn| {
            txn.array_push(DAYS_ROOT, "a".into());
        });

        assert!(undo.undo(&mut doc));
        assert!(titles(&doc).is_empty());
        assert!(undo.can_redo());

        assert!(undo.redo(&mut doc));
        assert_eq!(titles(&doc), vec!["a"]);
        assert!(undo.can_undo());
    }

    #[test]
    fn test_undo_delete_restores_position() {
        let (mut doc, session, undo) = setup(Duration::ZERO);
        doc.transact(Origin::Remote, |txn| {
            for s in ["a", "b", "c"] {
                txn.array_push(DAYS_ROOT, s.into());
            }
        });
        doc.transact(Origin::Local(session), |txn| txn.array_remove(DAYS_ROOT, 1));
        assert_eq!(titles(&doc), vec!["a", "c"]);

        undo.undo(&mut doc);
        assert_eq!(titles(&doc), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_undo_set_restores_previous_value() {
        let (mut doc, session, undo) = setup(Duration::ZERO);
        doc.transact(Origin::Local(session), |txn| txn.map_set(COMMENTS_ROOT, "k", "one"));
        undo.stop_capturing();
        doc.transact(Origin::Local(session), |txn| txn.map_set(COMMENTS_ROOT, "k", "two"));

        undo.undo(&mut doc);
        assert_eq!(doc.map_get(COMMENTS_ROOT, "k"), Some(&Value::from("one")));
        undo.undo(&mut doc);
        assert_eq!(doc.map_get(COMMENTS_ROOT, "k"), None);
        assert!(!undo.can_undo());
    }

    #[test]
    fn test_remote_transactions_are_not_tracked() {
        let (mut doc, session, undo) = setup(Duration::ZERO);
        doc.transact(Origin::Remote, |txn| txn.array_push(DAYS_ROOT, "remote".into()));
        doc.transact(Origin::Seed(session), |txn| txn.array_push(DAYS_ROOT, "seed".into()));
        doc.transact(Origin::Persistence, |txn| txn.array_push(DAYS_ROOT, "stored".into()));
        doc.transact(Origin::Local(SessionId::generate()), |txn| {
            txn.array_push(DAYS_ROOT, "other session".into())
        });

        assert!(!undo.can_undo());
    }

    #[test]
    fn test_interleaved_remote_edit_survives_undo() {
        let (mut doc, session, undo) = setup(Duration::ZERO);
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "m1".into()));
        doc.transact(Origin::Remote, |txn| txn.array_push(DAYS_ROOT, "r1".into()));
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "m2".into()));

        undo.undo(&mut doc);
        assert_eq!(titles(&doc), vec!["m1", "r1"]);
        undo.undo(&mut doc);
        assert_eq!(titles(&doc), vec!["r1"]);
    }

    #[test]
    fn test_edits_within_timeout_coalesce() {
        let (mut doc, session, undo) = setup(Duration::from_secs(60));
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "a".into()));
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "b".into()));

        undo.undo(&mut doc);
        assert!(titles(&doc).is_empty());
        assert!(!undo.can_undo());
    }

    #[test]
    fn test_remote_edit_ends_capture_window() {
        let (mut doc, session, undo) = setup(DEFAULT_CAPTURE_TIMEOUT);
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "m1".into()));
        doc.transact(Origin::Remote, |txn| txn.array_push(DAYS_ROOT, "r1".into()));
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "m2".into()));

        assert!(undo.undo(&mut doc));
        assert_eq!(titles(&doc), vec!["m1", "r1"]);
        assert!(undo.undo(&mut doc));
        assert_eq!(titles(&doc), vec!["r1"]);
    }

    #[test]
    fn test_stop_capturing_splits_steps() {
        let (mut doc, session, undo) = setup(Duration::from_secs(60));
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "a".into()));
        undo.stop_capturing();
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "b".into()));

        undo.undo(&mut doc);
        assert_eq!(titles(&doc), vec!["a"]);
        assert!(undo.can_undo());
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let (mut doc, session, undo) = setup(Duration::ZERO);
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "a".into()));
        undo.undo(&mut doc);
        assert!(undo.can_redo());

        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "b".into()));
        assert!(!undo.can_redo());
    }

    #[test]
    fn test_clear() {
        let (mut doc, session, undo) = setup(Duration::ZERO);
        doc.transact(Origin::Local(session), |txn| txn.array_push(DAYS_ROOT, "a".into()));
        undo.clear();
        assert!(!undo.can_undo());
        assert!(!undo.can_redo());
    }
}
