//! The itinerary API the UI layer talks to.
//!
//! [`ItinerarySync`] attaches to the shared [`SessionBundle`] of an itinerary,
//! keeps a plain snapshot (`Vec<Day>` plus comment threads) current, and turns
//! every mutation intent into one local transaction. Remote edits arrive
//! through [`ItinerarySync::poll`] and flow through the same observer path,
//! where they also drive block highlighting and change notifications.

use crate::awareness::{assign_color, AwareUser, UserInfo, USER_FIELD};
use crate::convert;
use crate::doc::{Subscription, TransactionEvent};
use crate::error::{CollabError, CollabResult, TransportError};
use crate::model::{BlockPatch, Comment, CommentThread, CurrentUser, Day, NewBlock};
use crate::op_id::Origin;
use crate::session::{SessionBundle, SessionRegistry};
use crate::transport::{ConnectionStatus, TransportEvent};
use crate::value::{ContainerId, Value, DAYS_ROOT};
use chrono::Utc;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transient messages for the UI (toasts, indicators).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncNotification {
    /// A peer edited a block.
    RemoteChange { block_id: String },
    /// The relay could not be reached or refused the session.
    ConnectionFailed { reason: String },
}

/// What the document observer saw since the last refresh.
#[derive(Default)]
struct Observed {
    dirty: bool,
    remote_maps: Vec<ContainerId>,
}

impl Observed {
    fn record(&mut self, event: &TransactionEvent) {
        self.dirty = true;
        if event.origin.is_remote() {
            self.remote_maps.extend(event.changed_maps.iter().copied());
        }
    }
}

/// One UI attachment to a collaborative itinerary.
pub struct ItinerarySync {
    registry: Rc<SessionRegistry>,
    bundle: Rc<SessionBundle>,
    user: CurrentUser,
    highlight_window: Duration,
    observed: Rc<RefCell<Observed>>,
    subscription: Subscription,
    days: Vec<Day>,
    threads: BTreeMap<String, CommentThread>,
    highlight: Option<(String, Instant)>,
    notifications: Vec<SyncNotification>,
}

impl std::fmt::Debug for ItinerarySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItinerarySync")
            .field("itinerary_id", &self.bundle.itinerary_id())
            .field("days", &self.days.len())
            .finish_non_exhaustive()
    }
}

impl ItinerarySync {
    /// Attach to an itinerary and start connecting.
    ///
    /// `initial` seeds an empty replica on the first sync. Attachments that
    /// share a session offer theirs to the session; the first non-empty one wins.
    pub fn attach(
        registry: Rc<SessionRegistry>,
        itinerary_id: &str,
        token: &str,
        user: CurrentUser,
        initial: Vec<Day>,
    ) -> Self {
        let bundle = registry.get_or_create(itinerary_id, token);
        let highlight_window = registry.config().highlight_window();

        let observed = Rc::new(RefCell::new(Observed {
            dirty: true,
            ..Observed::default()
        }));
        let subscription = {
            let observed = Rc::clone(&observed);
            bundle.observe(move |event| observed.borrow_mut().record(event))
        };

        let presence = UserInfo {
            id: user.id.clone(),
            name: user.name.clone(),
            color: assign_color(&user.id),
        };
        bundle.set_local_awareness_field(
            USER_FIELD,
            serde_json::to_value(&presence).unwrap_or(serde_json::Value::Null),
        );
        bundle.offer_initial(initial);
        bundle.connect();

        let mut sync = Self {
            registry,
            bundle,
            user,
            highlight_window,
            observed,
            subscription,
            days: Vec::new(),
            threads: BTreeMap::new(),
            highlight: None,
            notifications: Vec::new(),
        };
        sync.refresh();
        sync
    }

    /// Process everything the transport received since the last call.
    pub fn poll(&mut self) {
        self.bundle.reconnect_if_due();
        for event in self.bundle.poll_transport() {
            match event {
                TransportEvent::Status(ConnectionStatus::Connected) => self.bundle.publish_awareness(),
                TransportEvent::Status(ConnectionStatus::Disconnected) => {
                    self.bundle.set_synced(false);
                    self.bundle.clear_remote_awareness();
                    self.bundle.connection_lost();
                }
                TransportEvent::Status(ConnectionStatus::Connecting) => {}
                TransportEvent::Sync {
                    update,
                    server_state,
                } => {
                    self.bundle.apply_remote(&update);
                    self.bundle.send_missing(&server_state);
                    self.bundle.set_synced(true);
                    self.bundle.connection_established();
                    info!(itinerary_id = %self.bundle.itinerary_id(), ops = update.len(), "synced with relay");
                    self.seed_once();
                }
                TransportEvent::Update(update) => self.bundle.apply_remote(&update),
                TransportEvent::Awareness { client_id, state } => {
                    self.bundle.apply_remote_awareness(client_id, state);
                }
                TransportEvent::ConnectionFailed(e) => {
                    warn!(itinerary_id = %self.bundle.itinerary_id(), error = %e, "connection failed");
                    if matches!(e, TransportError::Unauthorized(_)) {
                        self.bundle.stop_reconnecting();
                    }
                    self.notifications.push(SyncNotification::ConnectionFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }
        self.refresh();
    }

    fn seed_once(&mut self) {
        if !self.bundle.claim_seed() {
            return;
        }
        let initial = self.bundle.take_initial();
        if initial.is_empty() {
            return;
        }
        if self.bundle.doc().array_len(DAYS_ROOT) > 0 {
            info!(itinerary_id = %self.bundle.itinerary_id(), "replica has content; initial snapshot discarded");
            return;
        }
        let session = self.bundle.session_id();
        self.bundle.transact(Origin::Seed(session), |txn| {
            for day in &initial {
                convert::write_day(txn, day);
            }
        });
        info!(itinerary_id = %self.bundle.itinerary_id(), days = initial.len(), "seeded itinerary");
    }

    /// Rebuild the snapshot if anything changed and pick up remote edits.
    fn refresh(&mut self) {
        let observed = std::mem::take(&mut *self.observed.borrow_mut());
        if !observed.dirty {
            return;
        }

        let remote_block = {
            let doc = self.bundle.doc();
            self.days = convert::read_days(&doc);
            self.threads = convert::read_threads(&doc);
            if observed.remote_maps.is_empty() {
                None
            } else {
                let ids = convert::block_map_ids(&doc);
                observed
                    .remote_maps
                    .iter()
                    .rev()
                    .find_map(|map| ids.get(map).cloned())
            }
        };

        if let Some(block_id) = remote_block {
            debug!(block_id = %block_id, "remote change");
            self.highlight = Some((block_id.clone(), Instant::now()));
            self.notifications
                .push(SyncNotification::RemoteChange { block_id });
        }
    }

    fn local(&self) -> Origin {
        Origin::Local(self.bundle.session_id())
    }

    /// Replace the whole itinerary. Clears undo history.
    pub fn set_itinerary(&mut self, days: Vec<Day>) {
        let undo = self.bundle.undo_manager();
        undo.stop_capturing();
        self.bundle.transact(self.local(), |txn| {
            txn.array_clear(DAYS_ROOT);
            for day in &days {
                convert::write_day(txn, day);
            }
        });
        undo.clear();
        self.refresh();
    }

    /// Add a block to the day of its date, creating the day if needed.
    ///
    /// Returns the generated block id.
    pub fn add_block(&mut self, new_block: NewBlock) -> CollabResult<String> {
        new_block.validate()?;
        let id = Uuid::new_v4().to_string();
        let block = new_block.with_id(id.clone());

        let day_index = self
            .days
            .iter()
            .find(|day| day.date == block.date)
            .map(|day| day.day_index)
            .unwrap_or(self.days.len() as i64 + 1);

        self.bundle.transact(self.local(), |txn| {
            let blocks = match convert::find_day(txn, &block.date) {
                Some(day) => day.blocks,
                None => convert::write_day(txn, &Day::new(block.date.clone(), day_index))?.blocks,
            };
            convert::write_block(txn, blocks, usize::MAX, &block)
        });
        self.refresh();
        Ok(id)
    }

    /// Key-set the given fields of a block. Unknown ids are ignored.
    pub fn update_block(&mut self, block_id: &str, patch: &BlockPatch) -> CollabResult<bool> {
        patch.validate()?;
        if patch.is_empty() {
            return Ok(false);
        }
        let found = self.bundle.transact(self.local(), |txn| {
            let Some(location) = convert::find_block(txn, block_id) else {
                return false;
            };
            convert::apply_patch(txn, location.map, patch);
            true
        });
        self.refresh();
        Ok(found)
    }

    /// Remove a block. Unknown ids are ignored.
    pub fn delete_block(&mut self, block_id: &str) -> bool {
        let deleted = self.bundle.transact(self.local(), |txn| {
            let mut deleted = false;
            for location in convert::find_block_copies(txn, block_id) {
                deleted |= txn.array_delete(location.day.blocks, location.elem);
            }
            deleted
        });
        self.refresh();
        deleted
    }

    /// Move the block at `old_index` of a day to `new_index`.
    ///
    /// Remove then insert: `[A, B, C, D]` with `0 → 2` becomes `[B, C, A, D]`.
    pub fn reorder_blocks(&mut self, date: &str, old_index: usize, new_index: usize) -> bool {
        if old_index == new_index {
            return false;
        }
        let moved = self.bundle.transact(self.local(), |txn| {
            let (day, mut blocks) = convert::day_blocks(txn, date)?;
            if old_index >= blocks.len() || new_index >= blocks.len() {
                return None;
            }
            let (elem, map) = blocks.remove(old_index);
            txn.array_delete(day.blocks, elem);
            let after = match new_index {
                0 => None,
                n => Some(blocks[n - 1].0),
            };
            txn.array_insert_after(day.blocks, after, Value::Map(map))
        });
        self.refresh();
        moved.is_some()
    }

    /// Append a comment to a block's thread, re-opening the thread.
    ///
    /// Returns the generated comment id.
    pub fn add_comment(&mut self, block_id: &str, content: &str) -> CollabResult<String> {
        if content.trim().is_empty() {
            return Err(CollabError::InvalidComment("content is required".to_string()));
        }
        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            author_id: self.user.id.clone(),
            author_name: self.user.name.clone(),
            author_avatar: self.user.avatar.clone(),
            content: content.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };

        self.bundle.transact(self.local(), |txn| {
            let (thread, comments) = convert::ensure_thread(txn, block_id)?;
            convert::append_comment(txn, comments, &comment);
            convert::set_thread_resolved(txn, thread, false);
            Some(())
        });
        self.refresh();
        Ok(comment.id)
    }

    /// Flip a thread's resolved flag. No thread, no change.
    pub fn toggle_comment_thread_resolved(&mut self, block_id: &str) -> bool {
        let toggled = self.bundle.transact(self.local(), |txn| {
            let Some(thread) = convert::find_thread(txn, block_id) else {
                return false;
            };
            let resolved = convert::thread_resolved(txn, thread);
            convert::set_thread_resolved(txn, thread, !resolved);
            true
        });
        self.refresh();
        toggled
    }

    pub fn undo(&mut self) -> bool {
        let undone = self.bundle.undo();
        self.refresh();
        undone
    }

    pub fn redo(&mut self) -> bool {
        let redone = self.bundle.redo();
        self.refresh();
        redone
    }

    pub fn can_undo(&self) -> bool {
        self.bundle.undo_manager().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.bundle.undo_manager().can_redo()
    }

    /// Current plain itinerary.
    pub fn days(&self) -> &[Day] {
        &self.days
    }

    pub fn comment_threads(&self) -> &BTreeMap<String, CommentThread> {
        &self.threads
    }

    pub fn comment_thread(&self, block_id: &str) -> Option<&CommentThread> {
        self.threads.get(block_id)
    }

    /// True once the first reconciliation after connecting has completed.
    pub fn is_synced(&self) -> bool {
        self.bundle.is_synced()
    }

    /// Block most recently edited by a peer, while its highlight lasts.
    pub fn recently_updated_block_id(&self) -> Option<&str> {
        self.highlight
            .as_ref()
            .filter(|(_, at)| at.elapsed() < self.highlight_window)
            .map(|(id, _)| id.as_str())
    }

    /// Connected peers, excluding this client.
    pub fn aware_users(&self) -> Vec<AwareUser> {
        self.bundle.aware_users()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.bundle.connection_status()
    }

    /// True while waiting to retry a dropped connection.
    pub fn is_reconnecting(&self) -> bool {
        self.bundle.is_reconnecting()
    }

    /// Drain pending notifications.
    pub fn take_notifications(&mut self) -> Vec<SyncNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// True when local persistence failed and the session is memory-only.
    pub fn is_persistence_degraded(&self) -> bool {
        self.bundle.persistence().is_degraded()
    }

    pub fn itinerary_id(&self) -> &str {
        self.bundle.itinerary_id()
    }

    pub fn session(&self) -> &SessionBundle {
        &self.bundle
    }

    /// Go offline. Local edits keep working and upload on [`ItinerarySync::connect`].
    pub fn disconnect(&mut self) {
        self.bundle.disconnect();
        self.bundle.clear_remote_awareness();
    }

    pub fn connect(&mut self) {
        self.bundle.connect();
    }
}

impl Drop for ItinerarySync {
    fn drop(&mut self) {
        self.bundle.unobserve(self.subscription);
        self.registry.release(self.bundle.itinerary_id());
    }
}
