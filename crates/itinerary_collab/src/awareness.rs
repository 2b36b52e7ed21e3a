//! Ephemeral presence ("awareness") of the peers editing an itinerary.
//!
//! Each client publishes a small JSON object describing itself (at least a
//! `user` field with id, name and colour). Remote states are kept per
//! [`ClientId`] only while the peer is connected and are never persisted.

use crate::op_id::ClientId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::HashMap;

/// Field under which a client publishes its [`UserInfo`].
pub const USER_FIELD: &str = "user";

/// Presence fields of one client.
pub type AwarenessState = Map<String, Json>;

/// Identity shown next to a peer's edits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    /// Assigned color (hex)
    pub color: String,
}

/// A connected peer, as exposed to the UI
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwareUser {
    pub client_id: ClientId,
    pub state: AwarenessState,
}

impl AwareUser {
    /// The peer's `user` field, if present and well formed.
    pub fn user(&self) -> Option<UserInfo> {
        self.state
            .get(USER_FIELD)
            .and_then(|user| serde_json::from_value(user.clone()).ok())
    }
}

/// Which remote clients changed in one update
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

type Listener = Box<dyn FnMut(&AwarenessChange)>;

/// Local and remote presence for one document
pub struct Awareness {
    client_id: ClientId,
    local: Option<AwarenessState>,
    remote: HashMap<ClientId, AwarenessState>,
    listeners: Vec<Listener>,
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            local: None,
            remote: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Set one field of the local state, creating the state if needed.
    pub fn set_local_state_field(&mut self, key: &str, value: Json) -> &AwarenessState {
        let state = self.local.get_or_insert_with(Map::new);
        state.insert(key.to_string(), value);
        state
    }

    /// Publish the `user` field.
    pub fn set_local_user(&mut self, user: &UserInfo) -> &AwarenessState {
        let value = serde_json::to_value(user).unwrap_or(Json::Null);
        self.set_local_state_field(USER_FIELD, value)
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.local.as_ref()
    }

    pub fn clear_local_state(&mut self) {
        self.local = None;
    }

    /// Record a peer's state (`None` = the peer left). Own id is ignored.
    pub fn apply_remote(&mut self, client_id: ClientId, state: Option<AwarenessState>) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        if client_id == self.client_id {
            return change;
        }

        match state {
            Some(state) => match self.remote.insert(client_id, state.clone()) {
                None => change.added.push(client_id),
                Some(previous) if previous != state => change.updated.push(client_id),
                Some(_) => {}
            },
            None => {
                if self.remote.remove(&client_id).is_some() {
                    change.removed.push(client_id);
                }
            }
        }

        self.notify(&change);
        change
    }

    /// Forget every peer, e.g. after losing the connection.
    pub fn clear_remote(&mut self) -> AwarenessChange {
        let mut removed: Vec<ClientId> = self.remote.drain().map(|(id, _)| id).collect();
        removed.sort();
        let change = AwarenessChange {
            removed,
            ..AwarenessChange::default()
        };
        self.notify(&change);
        change
    }

    /// Connected peers, excluding this client, ordered by client id.
    pub fn remote_users(&self) -> Vec<AwareUser> {
        let mut users: Vec<AwareUser> = self
            .remote
            .iter()
            .map(|(client_id, state)| AwareUser {
                client_id: *client_id,
                state: state.clone(),
            })
            .collect();
        users.sort_by_key(|user| user.client_id);
        users
    }

    /// Get the number of connected peers
    pub fn user_count(&self) -> usize {
        self.remote.len()
    }

    /// Register a listener fired whenever the remote set changes.
    pub fn on_change(&mut self, listener: impl FnMut(&AwarenessChange) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn notify(&mut self, change: &AwarenessChange) {
        if change.is_empty() {
            return;
        }
        for listener in self.listeners.iter_mut() {
            listener(change);
        }
    }
}

/// Default color palette for peers
pub fn default_colors() -> &'static [&'static str] {
    &[
        "#E91E63", // Pink
        "#9C27B0", // Purple
        "#3F51B5", // Indigo
        "#2196F3", // Blue
        "#00BCD4", // Cyan
        "#4CAF50", // Green
        "#FF9800", // Orange
        "#795548", // Brown
    ]
}

/// Stable palette color for a user id (FNV-1a over the id bytes).
pub fn assign_color(user_id: &str) -> String {
    let hash = user_id.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    });
    let palette = default_colors();
    palette[(hash % palette.len() as u64) as usize].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn state(name: &str) -> AwarenessState {
        let mut state = Map::new();
        state.insert(
            USER_FIELD.into(),
            json!({"id": name, "name": name, "color": "#2196F3"}),
        );
        state
    }

    #[test]
    fn test_local_state_fields() {
        let mut awareness = Awareness::new(ClientId::new(1));
        assert!(awareness.local_state().is_none());

        awareness.set_local_user(&UserInfo {
            id: "u1".into(),
            name: "Ana".into(),
            color: "#E91E63".into(),
        });
        awareness.set_local_state_field("editing", json!("block-1"));

        let local = awareness.local_state().unwrap();
        assert_eq!(local["user"]["name"], "Ana");
        assert_eq!(local["editing"], "block-1");
    }

    #[test]
    fn test_remote_add_update_remove() {
        let mut awareness = Awareness::new(ClientId::new(1));
        let peer = ClientId::new(2);

        let change = awareness.apply_remote(peer, Some(state("bo")));
        assert_eq!(change.added, vec![peer]);

        let change = awareness.apply_remote(peer, Some(state("bo")));
        assert!(change.is_empty());

        let change = awareness.apply_remote(peer, Some(state("bob")));
        assert_eq!(change.updated, vec![peer]);

        let users = awareness.remote_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user().unwrap().name, "bob");

        let change = awareness.apply_remote(peer, None);
        assert_eq!(change.removed, vec![peer]);
        assert!(awareness.remote_users().is_empty());
    }

    #[test]
    fn test_own_state_is_excluded() {
        let mut awareness = Awareness::new(ClientId::new(1));
        awareness.apply_remote(ClientId::new(1), Some(state("me")));
        assert_eq!(awareness.user_count(), 0);
    }

    #[test]
    fn test_listeners_and_clear_remote() {
        let mut awareness = Awareness::new(ClientId::new(1));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        awareness.on_change(move |change| sink.borrow_mut().push(change.clone()));

        awareness.apply_remote(ClientId::new(3), Some(state("c")));
        awareness.apply_remote(ClientId::new(2), Some(state("b")));
        let change = awareness.clear_remote();

        assert_eq!(change.removed, vec![ClientId::new(2), ClientId::new(3)]);
        assert_eq!(seen.borrow().len(), 3);
    }

    #[test]
    fn test_assign_color_is_stable() {
        let color = assign_color("user-42");
        assert_eq!(color, assign_color("user-42"));
        assert!(default_colors().contains(&color.as_str()));
    }
}
