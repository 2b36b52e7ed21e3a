//! Collaborative itinerary editing.
//!
//! This crate keeps a trip itinerary (days, each with an ordered list of
//! blocks, plus comment threads per block) in a replicated document that
//! several clients can edit concurrently, offline or online, and that always
//! converges to the same state.
//!
//! # Modules
//!
//! - `op_id`, `clock`: identifiers, Lamport timestamps and state vectors
//! - `rga`, `lww_register`: sequence and last-writer-wins building blocks
//! - `value`, `operation`, `doc`: the replicated document, its op log and
//!   transactions with deep observers
//! - `undo`: per-session undo/redo of local transactions
//! - `persistence`: durable local mirror of the document
//! - `awareness`: ephemeral presence of connected peers
//! - `message`, `transport`, `relay`: the real-time channel and the relay hub
//! - `net`: WebSocket server and client (feature `server`)
//! - `session`: one shared replica per itinerary in a process
//! - `model`, `convert`: plain itinerary types and the document shape adapter
//! - `facade`: [`ItinerarySync`], the API the UI layer talks to
//! - `config`, `error`: configuration and error types
//!
//! # Example
//!
//! ```
//! use itinerary_collab::{
//!     CollabConfig, CurrentUser, ItinerarySync, MemoryUpdateStore, NewBlock, Relay,
//!     RelayTransportFactory, SessionRegistry,
//! };
//! use std::rc::Rc;
//!
//! let relay = Relay::accept_all();
//! let registry = Rc::new(SessionRegistry::new(
//!     RelayTransportFactory::new(relay),
//!     Rc::new(MemoryUpdateStore::new()),
//!     CollabConfig::default(),
//! ));
//! let user = CurrentUser {
//!     id: "u1".into(),
//!     name: "Ana".into(),
//!     email: "ana@example.com".into(),
//!     avatar: None,
//! };
//!
//! let mut sync = ItinerarySync::attach(registry, "trip-42", "token", user, Vec::new());
//! sync.poll();
//! assert!(sync.is_synced());
//!
//! sync.add_block(NewBlock {
//!     date: "2024-06-01".into(),
//!     start_time: "09:00".into(),
//!     end_time: "10:00".into(),
//!     title: "Museum".into(),
//!     description: None,
//!     block_type: "activity".into(),
//!     category: "sightseeing".into(),
//!     duration_min: None,
//!     coords: None,
//! })
//! .unwrap();
//!
//! assert_eq!(sync.days()[0].day_index, 1);
//! assert_eq!(sync.days()[0].blocks[0].title, "Museum");
//! ```

pub mod awareness;
pub mod clock;
pub mod config;
pub mod convert;
pub mod doc;
pub mod error;
pub mod facade;
pub mod lww_register;
pub mod message;
pub mod model;
pub mod op_id;
pub mod operation;
pub mod persistence;
pub mod relay;
pub mod rga;
pub mod session;
pub mod transport;
pub mod undo;
pub mod value;

/// WebSocket relay server and client transport.
///
/// This module is only available when the `server` feature is enabled.
#[cfg(feature = "server")]
pub mod net;

// Re-export commonly used types
pub use awareness::{assign_color, AwareUser, Awareness, AwarenessState, UserInfo};
pub use clock::{LamportClock, Timestamp, VectorClock};
pub use config::CollabConfig;
pub use doc::{Change, Doc, Subscription, Transaction, TransactionEvent};
pub use error::{CollabError, CollabResult, StorageError, TransportError};
pub use facade::{ItinerarySync, SyncNotification};
pub use lww_register::{LwwMap, LwwRegister};
pub use message::{ClientMessage, ServerMessage};
pub use model::{Block, BlockPatch, Comment, CommentThread, Coords, CurrentUser, Day, NewBlock};
pub use op_id::{ClientId, OpId, Origin, SessionId};
pub use operation::{Op, OpLog, Update};
pub use persistence::{FileUpdateStore, MemoryUpdateStore, Persistence, UpdateStore};
pub use relay::{AcceptAllTokens, Relay, StaticTokens, TokenValidator};
pub use rga::Rga;
pub use session::{SessionBundle, SessionRegistry};
pub use transport::{
    ConnectionStatus, RelayTransport, RelayTransportFactory, Transport, TransportEvent,
    TransportFactory,
};
pub use undo::UndoManager;
pub use value::{ContainerId, Value, COMMENTS_ROOT, DAYS_ROOT};
