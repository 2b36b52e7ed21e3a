//! Relay hub shared by every client of a deployment.
//!
//! The relay keeps one room per itinerary. A room holds the merged op log of
//! everything published to it and the set of connected peers with their
//! awareness states. It never interprets the document: ops are merged by id
//! and forwarded, so the relay cannot diverge from the clients.

use crate::awareness::AwarenessState;
use crate::clock::VectorClock;
use crate::error::TransportError;
use crate::message::{ClientMessage, ServerMessage};
use crate::op_id::ClientId;
use crate::operation::{OpLog, Update};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Checks the auth token a client presents when joining a room.
pub trait TokenValidator: Send + Sync {
    /// Returns the user id behind the token.
    fn validate(&self, itinerary_id: &str, token: &str) -> Result<String, TransportError>;
}

/// Accepts any non-empty token (development and tests).
#[derive(Debug, Default)]
pub struct AcceptAllTokens;

impl TokenValidator for AcceptAllTokens {
    fn validate(&self, _itinerary_id: &str, token: &str) -> Result<String, TransportError> {
        if token.trim().is_empty() {
            return Err(TransportError::Unauthorized("missing token".into()));
        }
        Ok(token.to_string())
    }
}

/// Fixed token table.
#[derive(Debug, Default)]
pub struct StaticTokens {
    users: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token (token -> user id).
    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.users.insert(token.into(), user_id.into());
        self
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, _itinerary_id: &str, token: &str) -> Result<String, TransportError> {
        self.users
            .get(token)
            .cloned()
            .ok_or_else(|| TransportError::Unauthorized("invalid token".into()))
    }
}

struct Peer {
    user_id: String,
    sender: UnboundedSender<ServerMessage>,
    awareness: Option<AwarenessState>,
}

#[derive(Default)]
struct Room {
    log: OpLog,
    peers: HashMap<ClientId, Peer>,
}

impl Room {
    /// Send to every peer except `from`, dropping peers whose channel closed.
    fn broadcast(&mut self, from: ClientId, message: &ServerMessage) {
        let mut dead = Vec::new();
        for (client_id, peer) in &self.peers {
            if *client_id == from {
                continue;
            }
            if peer.sender.send(message.clone()).is_err() {
                dead.push(*client_id);
            }
        }
        for client_id in dead {
            debug!(client_id = %client_id, "dropping closed peer");
            self.peers.remove(&client_id);
        }
    }
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, Room>,
}

/// Cloneable handle to the relay.
#[derive(Clone)]
pub struct Relay {
    state: Arc<Mutex<RelayState>>,
    validator: Arc<dyn TokenValidator>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").finish_non_exhaustive()
    }
}

impl Relay {
    pub fn new(validator: impl TokenValidator + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            validator: Arc::new(validator),
        }
    }

    /// Relay with [`AcceptAllTokens`].
    pub fn accept_all() -> Self {
        Self::new(AcceptAllTokens)
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join a room.
    ///
    /// The returned channel immediately holds a `syncStep` with the ops the
    /// client lacks, followed by the awareness state of every present peer.
    pub fn join(
        &self,
        itinerary_id: &str,
        token: &str,
        client_id: ClientId,
        state_vector: &VectorClock,
    ) -> Result<UnboundedReceiver<ServerMessage>, TransportError> {
        let user_id = self.validator.validate(itinerary_id, token)?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut state = self.lock();
        let room = state.rooms.entry(itinerary_id.to_string()).or_default();

        let sync = ServerMessage::SyncStep {
            update: room.log.diff(state_vector),
            state_vector: room.log.state_vector().clone(),
        };
        // The receiver is alive, so these sends cannot fail.
        let _ = sender.send(sync);
        for (peer_id, peer) in &room.peers {
            if *peer_id == client_id {
                continue;
            }
            if let Some(awareness) = &peer.awareness {
                let _ = sender.send(ServerMessage::Awareness {
                    client_id: *peer_id,
                    state: Some(awareness.clone()),
                });
            }
        }

        room.peers.insert(
            client_id,
            Peer {
                user_id: user_id.clone(),
                sender,
                awareness: None,
            },
        );
        info!(
            itinerary_id,
            client_id = %client_id,
            user_id = %user_id,
            peers = room.peers.len(),
            "peer joined"
        );
        Ok(receiver)
    }

    /// Merge ops from a peer and forward the new ones to everyone else.
    ///
    /// Returns the ops that were new to the room.
    pub fn publish(&self, itinerary_id: &str, from: ClientId, update: &Update) -> Update {
        let mut state = self.lock();
        let Some(room) = state.rooms.get_mut(itinerary_id) else {
            warn!(itinerary_id, client_id = %from, "publish to unknown room");
            return Update::default();
        };

        let accepted = room.log.merge(update);
        if !accepted.is_empty() {
            debug!(itinerary_id, client_id = %from, ops = accepted.len(), "relaying update");
            room.broadcast(
                from,
                &ServerMessage::Update {
                    update: accepted.clone(),
                },
            );
        }
        accepted
    }

    /// Store and forward a peer's presence.
    pub fn set_awareness(&self, itinerary_id: &str, from: ClientId, awareness: Option<AwarenessState>) {
        let mut state = self.lock();
        let Some(room) = state.rooms.get_mut(itinerary_id) else {
            return;
        };
        let Some(peer) = room.peers.get_mut(&from) else {
            return;
        };
        peer.awareness = awareness.clone();
        room.broadcast(
            from,
            &ServerMessage::Awareness {
                client_id: from,
                state: awareness,
            },
        );
    }

    /// Remove a peer and tell the others it is gone. The room's log is kept.
    pub fn leave(&self, itinerary_id: &str, client_id: ClientId) {
        let mut state = self.lock();
        let Some(room) = state.rooms.get_mut(itinerary_id) else {
            return;
        };
        if let Some(peer) = room.peers.remove(&client_id) {
            info!(itinerary_id, client_id = %client_id, user_id = %peer.user_id, "peer left");
            room.broadcast(
                client_id,
                &ServerMessage::Awareness {
                    client_id,
                    state: None,
                },
            );
        }
    }

    /// Dispatch a message from a joined peer.
    pub fn handle(&self, itinerary_id: &str, from: ClientId, message: ClientMessage) {
        match message {
            ClientMessage::Update { update } => {
                self.publish(itinerary_id, from, &update);
            }
            ClientMessage::Awareness { state } => self.set_awareness(itinerary_id, from, state),
            ClientMessage::Leave => self.leave(itinerary_id, from),
            ClientMessage::Join { .. } => {
                warn!(itinerary_id, client_id = %from, "ignoring join from a joined peer");
            }
        }
    }

    /// Number of connected peers in a room
    pub fn peer_count(&self, itinerary_id: &str) -> usize {
        self.lock()
            .rooms
            .get(itinerary_id)
            .map(|room| room.peers.len())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    /// State vector of a room's merged log
    pub fn state_vector(&self, itinerary_id: &str) -> VectorClock {
        self.lock()
            .rooms
            .get(itinerary_id)
            .map(|room| room.log.state_vector().clone())
            .unwrap_or_default()
    }
}
