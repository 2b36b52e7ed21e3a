//! One live replica per itinerary, shared by every attachment in a process.
//!
//! A [`SessionBundle`] ties together the document, its write-through
//! persistence, the transport to the relay, the undo manager and the
//! awareness state. The [`SessionRegistry`] hands out bundles by itinerary
//! id with reference counting: the last [`SessionRegistry::release`]
//! disconnects the transport and drops the bundle, and the next
//! [`SessionRegistry::get_or_create`] starts over from persistence.

use crate::awareness::{AwarenessChange, AwarenessState, Awareness, AwareUser};
use crate::clock::VectorClock;
use crate::config::CollabConfig;
use crate::doc::{Doc, Subscription, Transaction, TransactionEvent};
use crate::model::Day;
use crate::op_id::{ClientId, Origin, SessionId};
use crate::operation::Update;
use crate::persistence::{Persistence, UpdateStore};
use crate::transport::{ConnectionStatus, Transport, TransportEvent, TransportFactory};
use crate::undo::UndoManager;
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info, warn};

type SharedTransport = Rc<RefCell<Box<dyn Transport>>>;

/// Document, transport, persistence, undo and presence of one itinerary.
pub struct SessionBundle {
    itinerary_id: String,
    session_id: SessionId,
    doc: RefCell<Doc>,
    transport: SharedTransport,
    persistence: Persistence,
    undo: UndoManager,
    awareness: RefCell<Awareness>,
    synced: Cell<bool>,
    seeded: Cell<bool>,
    initial: RefCell<Vec<Day>>,
    config: CollabConfig,
    wants_connection: Cell<bool>,
    reconnect_attempt: Cell<u32>,
    reconnect_at: Cell<Option<Instant>>,
    outbound: Subscription,
}

impl std::fmt::Debug for SessionBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBundle")
            .field("itinerary_id", &self.itinerary_id)
            .field("session_id", &self.session_id)
            .field("synced", &self.synced.get())
            .finish_non_exhaustive()
    }
}

impl SessionBundle {
    fn open(
        itinerary_id: &str,
        store: Rc<dyn UpdateStore>,
        transport: Box<dyn Transport>,
        client_id: ClientId,
        config: &CollabConfig,
    ) -> Self {
        let session_id = SessionId::generate();
        let mut doc = Doc::new(client_id);
        let persistence = Persistence::open(store, itinerary_id, &mut doc);
        let undo = UndoManager::new(&mut doc, session_id, config.undo_capture_timeout());

        let transport: SharedTransport = Rc::new(RefCell::new(transport));
        let outbound = {
            let transport = Rc::clone(&transport);
            doc.observe_deep(move |event| {
                // Remote ops are never echoed back
                if !event.origin.is_from(session_id) {
                    return;
                }
                match transport.try_borrow_mut() {
                    Ok(mut transport) => {
                        if transport.status() == ConnectionStatus::Connected {
                            transport.send_update(&event.update);
                        }
                    }
                    Err(_) => warn!("transport busy; update will go out with the next sync"),
                }
            })
        };

        Self {
            itinerary_id: itinerary_id.to_string(),
            session_id,
            doc: RefCell::new(doc),
            transport,
            persistence,
            undo,
            awareness: RefCell::new(Awareness::new(client_id)),
            synced: Cell::new(false),
            seeded: Cell::new(false),
            initial: RefCell::new(Vec::new()),
            config: config.clone(),
            wants_connection: Cell::new(false),
            reconnect_attempt: Cell::new(0),
            reconnect_at: Cell::new(None),
            outbound,
        }
    }

    pub fn itinerary_id(&self) -> &str {
        &self.itinerary_id
    }

    /// Origin marker of this session's local transactions.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn client_id(&self) -> ClientId {
        self.doc.borrow().client_id()
    }

    /// Read access to the document.
    pub fn doc(&self) -> Ref<'_, Doc> {
        self.doc.borrow()
    }

    /// Run one transaction on the document.
    pub fn transact<R>(&self, origin: Origin, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        self.doc.borrow_mut().transact(origin, f)
    }

    /// Register a deep observer on the document.
    pub fn observe(&self, observer: impl FnMut(&TransactionEvent) + 'static) -> Subscription {
        self.doc.borrow_mut().observe_deep(observer)
    }

    pub fn unobserve(&self, subscription: Subscription) {
        if let Ok(mut doc) = self.doc.try_borrow_mut() {
            doc.unobserve(subscription);
        }
    }

    pub fn state_vector(&self) -> VectorClock {
        self.doc.borrow().state_vector()
    }

    /// Integrate ops received from the relay.
    pub fn apply_remote(&self, update: &Update) {
        self.doc.borrow_mut().apply_update(update, Origin::Remote);
    }

    pub fn undo_manager(&self) -> &UndoManager {
        &self.undo
    }

    pub fn undo(&self) -> bool {
        self.undo.undo(&mut self.doc.borrow_mut())
    }

    pub fn redo(&self) -> bool {
        self.undo.redo(&mut self.doc.borrow_mut())
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Rewrite the durable log as a single full-state entry.
    pub fn compact(&self) {
        self.persistence.compact(&self.doc.borrow());
    }

    pub fn is_synced(&self) -> bool {
        self.synced.get()
    }

    pub(crate) fn set_synced(&self, synced: bool) {
        self.synced.set(synced);
    }

    /// Claim the one-time seeding; true only for the first caller.
    pub(crate) fn claim_seed(&self) -> bool {
        !self.seeded.replace(true)
    }

    /// Keep a seed snapshot from an attachment. The first non-empty one wins.
    pub(crate) fn offer_initial(&self, days: Vec<Day>) {
        if days.is_empty() || self.seeded.get() {
            return;
        }
        let mut initial = self.initial.borrow_mut();
        if initial.is_empty() {
            *initial = days;
        }
    }

    pub(crate) fn take_initial(&self) -> Vec<Day> {
        std::mem::take(&mut *self.initial.borrow_mut())
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport
            .try_borrow()
            .map(|transport| transport.status())
            .unwrap_or_default()
    }

    /// Start talking to the relay and keep reconnecting after drops.
    /// No-op while already connected.
    pub fn connect(&self) {
        self.wants_connection.set(true);
        self.reconnect_at.set(None);
        let state_vector = self.state_vector();
        self.transport.borrow_mut().connect(state_vector);
    }

    /// Go offline until the next [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.wants_connection.set(false);
        self.reconnect_at.set(None);
        self.reconnect_attempt.set(0);
        self.transport.borrow_mut().disconnect();
        self.synced.set(false);
    }

    /// True while a reconnect is scheduled.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnect_at.get().is_some()
    }

    /// Schedule the next reconnect after the connection dropped or failed.
    pub(crate) fn connection_lost(&self) {
        if !self.wants_connection.get() {
            return;
        }
        let attempt = self.reconnect_attempt.get() + 1;
        let max_attempts = self.config.reconnect_max_attempts;
        if max_attempts > 0 && attempt > max_attempts {
            warn!(itinerary_id = %self.itinerary_id, attempts = max_attempts, "giving up reconnecting");
            self.stop_reconnecting();
            return;
        }
        let delay = self.config.reconnect_delay(attempt);
        info!(itinerary_id = %self.itinerary_id, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.reconnect_attempt.set(attempt);
        self.reconnect_at.set(Some(Instant::now() + delay));
    }

    /// The relay answered; the next drop starts backing off from scratch.
    pub(crate) fn connection_established(&self) {
        self.reconnect_attempt.set(0);
    }

    /// Stay offline until [`connect`](Self::connect) is called again.
    pub(crate) fn stop_reconnecting(&self) {
        self.wants_connection.set(false);
        self.reconnect_at.set(None);
        self.reconnect_attempt.set(0);
    }

    /// Reconnect if a scheduled attempt is due. True if one was started.
    pub fn reconnect_if_due(&self) -> bool {
        match self.reconnect_at.get() {
            Some(at) if Instant::now() >= at => {}
            _ => return false,
        }
        self.reconnect_at.set(None);
        if self.connection_status() != ConnectionStatus::Disconnected {
            return false;
        }
        debug!(itinerary_id = %self.itinerary_id, attempt = self.reconnect_attempt.get(), "reconnecting");
        let state_vector = self.state_vector();
        self.transport.borrow_mut().connect(state_vector);
        true
    }

    /// Drain transport events. The transport is released before returning.
    pub fn poll_transport(&self) -> Vec<TransportEvent> {
        self.transport.borrow_mut().poll()
    }

    /// Upload the ops the relay lacks.
    pub fn send_missing(&self, server_state: &VectorClock) {
        if server_state.covers(&self.state_vector()) {
            return;
        }
        let missing = self.doc.borrow().diff(server_state);
        if !missing.is_empty() {
            debug!(itinerary_id = %self.itinerary_id, ops = missing.len(), "uploading ops the relay lacks");
            self.transport.borrow_mut().send_update(&missing);
        }
    }

    /// Publish a field of this client's presence.
    pub fn set_local_awareness_field(&self, key: &str, value: serde_json::Value) {
        let state = self.awareness.borrow_mut().set_local_state_field(key, value).clone();
        self.transport.borrow_mut().send_awareness(Some(&state));
    }

    /// Re-send this client's presence, e.g. after reconnecting.
    pub fn publish_awareness(&self) {
        let state: Option<AwarenessState> = self.awareness.borrow().local_state().cloned();
        if state.is_some() {
            self.transport.borrow_mut().send_awareness(state.as_ref());
        }
    }

    pub fn apply_remote_awareness(&self, client_id: ClientId, state: Option<AwarenessState>) -> AwarenessChange {
        self.awareness.borrow_mut().apply_remote(client_id, state)
    }

    pub fn clear_remote_awareness(&self) -> AwarenessChange {
        self.awareness.borrow_mut().clear_remote()
    }

    /// Register a listener for presence changes of remote peers.
    pub fn on_awareness_change(&self, listener: impl FnMut(&AwarenessChange) + 'static) {
        self.awareness.borrow_mut().on_change(listener);
    }

    pub fn aware_users(&self) -> Vec<AwareUser> {
        self.awareness.borrow().remote_users()
    }

    fn shutdown(&self) {
        self.stop_reconnecting();
        if let Ok(mut transport) = self.transport.try_borrow_mut() {
            transport.disconnect();
        }
        self.synced.set(false);
        if let Ok(mut doc) = self.doc.try_borrow_mut() {
            doc.unobserve(self.outbound);
            self.undo.detach(&mut doc);
            self.persistence.detach(&mut doc);
        }
        info!(itinerary_id = %self.itinerary_id, "session closed");
    }
}

struct Entry {
    bundle: Rc<SessionBundle>,
    refs: usize,
}

/// Process-wide map from itinerary id to its live [`SessionBundle`].
pub struct SessionRegistry {
    factory: Box<dyn TransportFactory>,
    store: Rc<dyn UpdateStore>,
    config: CollabConfig,
    entries: RefCell<HashMap<String, Entry>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(
        factory: impl TransportFactory + 'static,
        store: Rc<dyn UpdateStore>,
        config: CollabConfig,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            store,
            config,
            entries: RefCell::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// Shared bundle for an itinerary, creating it on first use.
    ///
    /// The token is only used when a new bundle is created.
    pub fn get_or_create(&self, itinerary_id: &str, token: &str) -> Rc<SessionBundle> {
        let mut entries = self.entries.borrow_mut();
        if let Some(entry) = entries.get_mut(itinerary_id) {
            entry.refs += 1;
            return Rc::clone(&entry.bundle);
        }

        let client_id = ClientId::random();
        let transport = self.factory.create(itinerary_id, token, client_id);
        let bundle = Rc::new(SessionBundle::open(
            itinerary_id,
            Rc::clone(&self.store),
            transport,
            client_id,
            &self.config,
        ));
        info!(itinerary_id, client_id = %client_id, "session opened");
        entries.insert(
            itinerary_id.to_string(),
            Entry {
                bundle: Rc::clone(&bundle),
                refs: 1,
            },
        );
        bundle
    }

    /// Drop one reference. Returns true when this closed the session.
    pub fn release(&self, itinerary_id: &str) -> bool {
        let removed = {
            let mut entries = self.entries.borrow_mut();
            let Some(entry) = entries.get_mut(itinerary_id) else {
                return false;
            };
            entry.refs -= 1;
            if entry.refs > 0 {
                return false;
            }
            entries.remove(itinerary_id)
        };
        if let Some(entry) = removed {
            entry.bundle.shutdown();
        }
        true
    }

    /// Number of attachments holding the itinerary's bundle
    pub fn ref_count(&self, itinerary_id: &str) -> usize {
        self.entries
            .borrow()
            .get(itinerary_id)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.entries.borrow().len()
    }
}
