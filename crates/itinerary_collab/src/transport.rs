//! Client side of the real-time channel.
//!
//! A [`Transport`] moves [`Update`]s and awareness states between one local
//! document and a relay. Transports are poll-driven: nothing happens on
//! construction, [`Transport::connect`] starts a session, and incoming
//! traffic is collected with [`Transport::poll`] on the owner's thread.

use crate::awareness::AwarenessState;
use crate::clock::VectorClock;
use crate::error::TransportError;
use crate::message::{ClientMessage, ServerMessage};
use crate::op_id::ClientId;
use crate::operation::Update;
use crate::relay::Relay;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Connection status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No session; local edits are kept and uploaded on the next connect
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Joined the relay room
    Connected,
}

/// Something that happened on the channel since the last poll
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    /// First reconciliation after connecting: ops this replica lacks and the
    /// relay's state vector (so the replica can upload what the relay lacks)
    Sync {
        update: Update,
        server_state: VectorClock,
    },
    Update(Update),
    Awareness {
        client_id: ClientId,
        state: Option<AwarenessState>,
    },
    ConnectionFailed(TransportError),
}

/// A bidirectional channel to a relay for one itinerary.
pub trait Transport {
    /// Start a session; `state_vector` describes what this replica already has.
    fn connect(&mut self, state_vector: VectorClock);

    /// End the session. Already-applied local state is unaffected.
    fn disconnect(&mut self);

    fn status(&self) -> ConnectionStatus;

    /// Send locally produced ops. Dropped while disconnected.
    fn send_update(&mut self, update: &Update);

    /// Publish this peer's presence (`None` clears it).
    fn send_awareness(&mut self, state: Option<&AwarenessState>);

    /// Drain pending events.
    fn poll(&mut self) -> Vec<TransportEvent>;
}

/// Builds the transport for a new session bundle.
pub trait TransportFactory {
    fn create(&self, itinerary_id: &str, token: &str, client_id: ClientId) -> Box<dyn Transport>;
}

pub(crate) fn server_event(message: ServerMessage) -> TransportEvent {
    match message {
        ServerMessage::SyncStep {
            update,
            state_vector,
        } => TransportEvent::Sync {
            update,
            server_state: state_vector,
        },
        ServerMessage::Update { update } => TransportEvent::Update(update),
        ServerMessage::Awareness { client_id, state } => TransportEvent::Awareness { client_id, state },
        ServerMessage::Error { message } => {
            TransportEvent::ConnectionFailed(TransportError::Protocol(message))
        }
    }
}

/// In-process transport talking directly to a [`Relay`].
pub struct RelayTransport {
    relay: Relay,
    itinerary_id: String,
    token: String,
    client_id: ClientId,
    status: ConnectionStatus,
    inbox: Option<UnboundedReceiver<ServerMessage>>,
    events: VecDeque<TransportEvent>,
}

impl RelayTransport {
    pub fn new(relay: Relay, itinerary_id: &str, token: &str, client_id: ClientId) -> Self {
        Self {
            relay,
            itinerary_id: itinerary_id.to_string(),
            token: token.to_string(),
            client_id,
            status: ConnectionStatus::Disconnected,
            inbox: None,
            events: VecDeque::new(),
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.events.push_back(TransportEvent::Status(status));
        }
    }

    fn send(&self, message: ClientMessage) {
        if self.status == ConnectionStatus::Connected {
            self.relay.handle(&self.itinerary_id, self.client_id, message);
        }
    }
}

impl Transport for RelayTransport {
    fn connect(&mut self, state_vector: VectorClock) {
        if self.status != ConnectionStatus::Disconnected {
            return;
        }
        self.set_status(ConnectionStatus::Connecting);

        match self
            .relay
            .join(&self.itinerary_id, &self.token, self.client_id, &state_vector)
        {
            Ok(inbox) => {
                info!(itinerary_id = %self.itinerary_id, client_id = %self.client_id, "connected to relay");
                self.inbox = Some(inbox);
                self.set_status(ConnectionStatus::Connected);
            }
            Err(e) => {
                warn!(itinerary_id = %self.itinerary_id, error = %e, "relay connection failed");
                self.events.push_back(TransportEvent::ConnectionFailed(e));
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    fn disconnect(&mut self) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        self.relay.leave(&self.itinerary_id, self.client_id);
        self.inbox = None;
        debug!(itinerary_id = %self.itinerary_id, client_id = %self.client_id, "disconnected from relay");
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn status(&self) -> ConnectionStatus {
        self.status
    }

    fn send_update(&mut self, update: &Update) {
        if update.is_empty() {
            return;
        }
        self.send(ClientMessage::Update {
            update: update.clone(),
        });
    }

    fn send_awareness(&mut self, state: Option<&AwarenessState>) {
        self.send(ClientMessage::Awareness {
            state: state.cloned(),
        });
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut closed = false;
        if let Some(inbox) = self.inbox.as_mut() {
            loop {
                match inbox.try_recv() {
                    Ok(message) => self.events.push_back(server_event(message)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        if closed {
            warn!(itinerary_id = %self.itinerary_id, "relay closed the session");
            self.inbox = None;
            self.set_status(ConnectionStatus::Disconnected);
        }
        self.events.drain(..).collect()
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Creates [`RelayTransport`]s bound to one relay.
#[derive(Clone)]
pub struct RelayTransportFactory {
    relay: Relay,
}

impl RelayTransportFactory {
    pub fn new(relay: Relay) -> Self {
        Self { relay }
    }
}

impl TransportFactory for RelayTransportFactory {
    fn create(&self, itinerary_id: &str, token: &str, client_id: ClientId) -> Box<dyn Transport> {
        Box::new(RelayTransport::new(
            self.relay.clone(),
            itinerary_id,
            token,
            client_id,
        ))
    }
}
