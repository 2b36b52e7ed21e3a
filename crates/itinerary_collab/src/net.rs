//! WebSocket relay server and client transport.
//!
//! The server exposes a [`Relay`] over WebSocket: each connection presents
//! its auth token in the handshake URL (`?token=...`), sends a `join`, and is
//! then bridged to the relay room. [`WsTransport`] is the matching client,
//! driven from a tokio runtime handle and polled like any other
//! [`Transport`].

use crate::awareness::AwarenessState;
use crate::clock::VectorClock;
use crate::config::CollabConfig;
use crate::error::TransportError;
use crate::message::{ClientMessage, ServerMessage};
use crate::op_id::ClientId;
use crate::operation::Update;
use crate::relay::Relay;
use crate::transport::{server_event, ConnectionStatus, Transport, TransportEvent, TransportFactory};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Relay server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Handle for stopping a running [`RelayServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// WebSocket front end of a [`Relay`].
pub struct RelayServer {
    relay: Relay,
    config: CollabConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    pub fn new(relay: Relay, config: CollabConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            relay,
            config,
            shutdown_tx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::WebSocket(e.to_string()))?;
        info!("Relay listening on {}", local);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tokio::spawn(handle_connection(self.relay.clone(), stream, addr));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Relay received shutdown signal");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Run a relay server with the given configuration until the process exits.
pub async fn serve(relay: Relay, config: CollabConfig) -> Result<(), ServerError> {
    RelayServer::new(relay, config).run().await
}

fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
}

async fn send_message(ws_tx: &mut WsSink, message: &ServerMessage) -> bool {
    match message.to_json() {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            true
        }
    }
}

async fn handle_connection(relay: Relay, stream: TcpStream, addr: SocketAddr) {
    debug!("New connection from {}", addr);

    let mut handshake_token = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        handshake_token = token_from_query(request.uri().query());
        Ok(response)
    };
    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Nothing is relayed until the peer has joined a room.
    let (itinerary_id, client_id, mut inbox) = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                Ok(ClientMessage::Join {
                    itinerary_id,
                    token,
                    client_id,
                    state_vector,
                }) => {
                    let token = handshake_token.clone().unwrap_or(token);
                    match relay.join(&itinerary_id, &token, client_id, &state_vector) {
                        Ok(inbox) => break (itinerary_id, client_id, inbox),
                        Err(e) => {
                            warn!("Rejected join from {}: {}", addr, e);
                            let reply = ServerMessage::Error {
                                message: e.to_string(),
                            };
                            send_message(&mut ws_tx, &reply).await;
                            let _ = ws_tx.close().await;
                            return;
                        }
                    }
                }
                Ok(_) => {
                    let reply = ServerMessage::Error {
                        message: "join required".to_string(),
                    };
                    if !send_message(&mut ws_tx, &reply).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Malformed message from {}: {}", addr, e);
                    let reply = ServerMessage::Error {
                        message: e.to_string(),
                    };
                    if !send_message(&mut ws_tx, &reply).await {
                        return;
                    }
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Err(e)) => {
                error!("WebSocket error for {}: {}", addr, e);
                return;
            }
            _ => {}
        }
    };

    // Outgoing message forwarder
    let outgoing = tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            if !send_message(&mut ws_tx, &message).await {
                break;
            }
        }
    });

    // Incoming message handler
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match ClientMessage::from_json(&text) {
                Ok(ClientMessage::Leave) => break,
                Ok(message) => relay.handle(&itinerary_id, client_id, message),
                Err(e) => warn!("Malformed message from {}: {}", addr, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error for {}: {}", addr, e);
                break;
            }
        }
    }

    relay.leave(&itinerary_id, client_id);
    outgoing.abort();
    debug!("Connection {} closed", addr);
}

/// Client transport over WebSocket.
///
/// The socket is driven by a task on the supplied runtime; the transport
/// itself is used from the owner's thread and never blocks.
pub struct WsTransport {
    runtime: Handle,
    url: String,
    itinerary_id: String,
    token: String,
    client_id: ClientId,
    status: ConnectionStatus,
    outgoing: Option<UnboundedSender<ClientMessage>>,
    incoming: Option<UnboundedReceiver<TransportEvent>>,
    events: VecDeque<TransportEvent>,
}

impl WsTransport {
    pub fn new(runtime: Handle, url: &str, itinerary_id: &str, token: &str, client_id: ClientId) -> Self {
        Self {
            runtime,
            url: url.to_string(),
            itinerary_id: itinerary_id.to_string(),
            token: token.to_string(),
            client_id,
            status: ConnectionStatus::Disconnected,
            outgoing: None,
            incoming: None,
            events: VecDeque::new(),
        }
    }

    fn handshake_url(&self) -> String {
        format!("{}?token={}", self.url, urlencoding::encode(&self.token))
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.events.push_back(TransportEvent::Status(status));
        }
    }

    fn send(&self, message: ClientMessage) {
        if let Some(outgoing) = &self.outgoing {
            let _ = outgoing.send(message);
        }
    }
}

async fn run_client(
    url: String,
    join: ClientMessage,
    mut outgoing: UnboundedReceiver<ClientMessage>,
    events: UnboundedSender<TransportEvent>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            let _ = events.send(TransportEvent::ConnectionFailed(TransportError::ConnectionFailed(
                e.to_string(),
            )));
            let _ = events.send(TransportEvent::Status(ConnectionStatus::Disconnected));
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let sent = match join.to_json() {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    };
    if !sent {
        let _ = events.send(TransportEvent::ConnectionFailed(TransportError::Protocol(
            "join failed".to_string(),
        )));
        let _ = events.send(TransportEvent::Status(ConnectionStatus::Disconnected));
        return;
    }
    let _ = events.send(TransportEvent::Status(ConnectionStatus::Connected));

    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else {
                    let _ = ws_tx.close().await;
                    return;
                };
                match message.to_json() {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Failed to serialize message: {}", e),
                }
            }
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                        Ok(message) => {
                            if events.send(server_event(message)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Malformed relay message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    let _ = events.send(TransportEvent::Status(ConnectionStatus::Disconnected));
}

impl Transport for WsTransport {
    fn connect(&mut self, state_vector: VectorClock) {
        if self.status != ConnectionStatus::Disconnected {
            return;
        }
        self.set_status(ConnectionStatus::Connecting);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let join = ClientMessage::Join {
            itinerary_id: self.itinerary_id.clone(),
            token: self.token.clone(),
            client_id: self.client_id,
            state_vector,
        };
        self.runtime
            .spawn(run_client(self.handshake_url(), join, out_rx, event_tx));
        self.outgoing = Some(out_tx);
        self.incoming = Some(event_rx);
        info!(itinerary_id = %self.itinerary_id, url = %self.url, "connecting to relay");
    }

    fn disconnect(&mut self) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        self.send(ClientMessage::Leave);
        self.outgoing = None;
        self.incoming = None;
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
        let mut received = Vec::new();
        let mut closed = false;
        if let Some(incoming) = self.incoming.as_mut() {
            loop {
                match incoming.try_recv() {
                    Ok(event) => received.push(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        for event in received {
            match event {
                TransportEvent::Status(status) => {
                    if status == ConnectionStatus::Disconnected {
                        self.outgoing = None;
                        self.incoming = None;
                    }
                    self.set_status(status);
                }
                other => self.events.push_back(other),
            }
        }
        if closed {
            self.outgoing = None;
            self.incoming = None;
            self.set_status(ConnectionStatus::Disconnected);
        }
        self.events.drain(..).collect()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Creates [`WsTransport`]s for one relay URL.
#[derive(Clone)]
pub struct WsTransportFactory {
    runtime: Handle,
    url: String,
}

impl WsTransportFactory {
    pub fn new(runtime: Handle, url: impl Into<String>) -> Self {
        Self {
            runtime,
            url: url.into(),
        }
    }

    /// Connect to the configured `relay_url`.
    pub fn from_config(runtime: Handle, config: &CollabConfig) -> Self {
        Self::new(runtime, config.relay_url.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TransportFactory for WsTransportFactory {
    fn create(&self, itinerary_id: &str, token: &str, client_id: ClientId) -> Box<dyn Transport> {
        Box::new(WsTransport::new(
            self.runtime.clone(),
            &self.url,
            itinerary_id,
            token,
            client_id,
        ))
    }
}
