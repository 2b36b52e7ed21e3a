//! Integration tests for collaborative itinerary editing
//! Tests convergence, concurrent editing, undo scope, seeding and persistence
//!
//! These tests run several clients against one in-process relay. Each client
//! has its own registry and local store, like separate processes would.

use itinerary_collab::{
    BlockPatch, CollabConfig, CollabError, ConnectionStatus, CurrentUser, Day, FileUpdateStore,
    ItinerarySync, MemoryUpdateStore, NewBlock, Relay, RelayTransportFactory, SessionRegistry,
    StaticTokens, StorageError, SyncNotification, Update, UpdateStore,
};
use proptest::prelude::*;
use std::path::Path;
use std::rc::Rc;

const TRIP: &str = "trip-1";

/// Test harness for simulating multiple clients
struct CollaborationHarness {
    relay: Relay,
    config: CollabConfig,
    clients: Vec<ItinerarySync>,
}

impl CollaborationHarness {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: CollabConfig) -> Self {
        Self {
            relay: Relay::accept_all(),
            config,
            clients: Vec::new(),
        }
    }

    /// Add a client with its own in-memory store
    fn add_client(&mut self, name: &str) -> usize {
        self.add_client_with(name, Rc::new(MemoryUpdateStore::new()), Vec::new())
    }

    fn add_client_with(&mut self, name: &str, store: Rc<dyn UpdateStore>, initial: Vec<Day>) -> usize {
        let registry = Rc::new(SessionRegistry::new(
            RelayTransportFactory::new(self.relay.clone()),
            store,
            self.config.clone(),
        ));
        let mut client = ItinerarySync::attach(registry, TRIP, name, user(name), initial);
        client.poll();
        self.clients.push(client);
        self.clients.len() - 1
    }

    fn client(&mut self, idx: usize) -> &mut ItinerarySync {
        &mut self.clients[idx]
    }

    /// Deliver everything in flight
    fn sync_all(&mut self) {
        for _ in 0..4 {
            for client in &mut self.clients {
                client.poll();
            }
        }
    }

    fn assert_converged(&self) {
        let first = &self.clients[0];
        for other in &self.clients[1..] {
            assert_eq!(first.days(), other.days());
            assert_eq!(first.comment_threads(), other.comment_threads());
        }
    }
}

fn test_config() -> CollabConfig {
    CollabConfig {
        undo_capture_timeout_ms: 0,
        ..CollabConfig::default()
    }
}

fn user(name: &str) -> CurrentUser {
    CurrentUser {
        id: format!("{name}-id"),
        name: name.to_string(),
        email: format!("{name}@example.com"),
        avatar: Some(format!("https://avatars.example.com/{name}.png")),
    }
}

fn block(date: &str, title: &str) -> NewBlock {
    NewBlock {
        date: date.into(),
        start_time: "09:00".into(),
        end_time: "10:00".into(),
        title: title.into(),
        description: None,
        block_type: "activity".into(),
        category: "sightseeing".into(),
        duration_min: Some(60),
        coords: None,
    }
}

fn titles(client: &ItinerarySync, date: &str) -> Vec<String> {
    client
        .days()
        .iter()
        .find(|day| day.date == date)
        .map(|day| day.blocks.iter().map(|b| b.title.clone()).collect())
        .unwrap_or_default()
}

#[test]
fn test_offline_edits_converge() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    harness.client(ana).add_block(block("2024-06-01", "Shared")).unwrap();
    harness.sync_all();

    harness.client(ana).disconnect();
    harness.client(bo).disconnect();

    harness.client(ana).add_block(block("2024-06-01", "Ana 1")).unwrap();
    harness.client(ana).add_block(block("2024-06-02", "Ana 2")).unwrap();
    harness.client(bo).add_block(block("2024-06-01", "Bo 1")).unwrap();
    let shared = harness.clients[bo].days()[0].blocks[0].id.clone();
    harness.client(bo).add_comment(&shared, "Bring tickets").unwrap();

    harness.client(ana).connect();
    harness.client(bo).connect();
    harness.sync_all();

    harness.assert_converged();
    let mut first_day = titles(&harness.clients[ana], "2024-06-01");
    first_day.sort();
    assert_eq!(first_day, vec!["Ana 1", "Bo 1", "Shared"]);
    assert_eq!(titles(&harness.clients[bo], "2024-06-02"), vec!["Ana 2"]);
    assert_eq!(harness.clients[ana].comment_thread(&shared).unwrap().comments.len(), 1);
}

#[test]
fn test_local_order_is_preserved() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    let client = harness.client(ana);
    let a = client.add_block(block("2024-06-01", "A")).unwrap();
    client.add_block(block("2024-06-01", "B")).unwrap();
    client.update_block(&a, &BlockPatch::title("A2")).unwrap();
    let c = client.add_block(block("2024-06-01", "C")).unwrap();
    client.add_block(block("2024-06-01", "D")).unwrap();
    client.delete_block(&c);
    harness.sync_all();

    assert_eq!(titles(&harness.clients[ana], "2024-06-01"), vec!["A2", "B", "D"]);
    assert_eq!(titles(&harness.clients[bo], "2024-06-01"), vec!["A2", "B", "D"]);
}

#[test]
fn test_concurrent_field_edits_are_isolated() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    let id = harness.client(ana).add_block(block("2024-06-01", "Museum")).unwrap();
    harness.sync_all();

    harness.client(ana).update_block(&id, &BlockPatch::title("Louvre")).unwrap();
    let patch = BlockPatch {
        category: Some("culture".into()),
        ..BlockPatch::default()
    };
    harness.client(bo).update_block(&id, &patch).unwrap();
    harness.sync_all();

    harness.assert_converged();
    let block = &harness.clients[bo].days()[0].blocks[0];
    assert_eq!(block.title, "Louvre");
    assert_eq!(block.category, "culture");
    assert_eq!(block.start_time, "09:00");
    assert_eq!(block.duration_min, Some(60));
}

#[test]
fn test_reorder_replicates() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    for title in ["A", "B", "C", "D"] {
        harness.client(ana).add_block(block("2024-06-01", title)).unwrap();
    }
    harness.sync_all();

    assert!(harness.client(bo).reorder_blocks("2024-06-01", 0, 2));
    harness.sync_all();

    assert_eq!(titles(&harness.clients[ana], "2024-06-01"), vec!["B", "C", "A", "D"]);
    harness.assert_converged();
}

#[test]
fn test_concurrent_reorders_keep_block_ids_unique() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    for title in ["A", "B", "C"] {
        harness.client(ana).add_block(block("2024-06-01", title)).unwrap();
    }
    harness.sync_all();
    let moved = harness.clients[ana].days()[0].blocks[0].id.clone();

    harness.client(ana).disconnect();
    harness.client(bo).disconnect();
    assert!(harness.client(ana).reorder_blocks("2024-06-01", 0, 2));
    assert!(harness.client(bo).reorder_blocks("2024-06-01", 0, 1));
    harness.client(ana).connect();
    harness.client(bo).connect();
    harness.sync_all();

    harness.assert_converged();
    let blocks = &harness.clients[ana].days()[0].blocks;
    let mut ids: Vec<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    let mut sorted = titles(&harness.clients[ana], "2024-06-01");
    sorted.sort();
    assert_eq!(sorted, vec!["A", "B", "C"]);

    // Both moved copies go with one delete
    assert!(harness.client(bo).delete_block(&moved));
    harness.sync_all();
    assert_eq!(titles(&harness.clients[ana], "2024-06-01"), vec!["B", "C"]);
    harness.assert_converged();
}

#[test]
fn test_comment_thread_reopens_for_everyone() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    let id = harness.client(ana).add_block(block("2024-06-01", "Museum")).unwrap();
    harness.client(ana).add_comment(&id, "Open on Mondays?").unwrap();
    harness.sync_all();

    assert!(harness.client(bo).toggle_comment_thread_resolved(&id));
    harness.sync_all();
    assert!(harness.clients[ana].comment_thread(&id).unwrap().is_resolved);

    harness.client(ana).add_comment(&id, "Actually closed").unwrap();
    harness.sync_all();

    let thread = harness.clients[bo].comment_thread(&id).unwrap();
    assert!(!thread.is_resolved);
    assert_eq!(thread.comments.len(), 2);
    assert_eq!(thread.comments[1].author_id, "ana-id");
    assert_eq!(
        thread.comments[1].author_avatar.as_deref(),
        Some("https://avatars.example.com/ana.png")
    );
    harness.assert_converged();
}

#[test]
fn test_undo_only_reverts_own_field_edits() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    let id = harness.client(ana).add_block(block("2024-06-01", "Museum")).unwrap();
    harness.sync_all();

    harness.client(ana).update_block(&id, &BlockPatch::title("one")).unwrap();
    harness.sync_all();
    let remote = BlockPatch {
        category: Some("culture".into()),
        ..BlockPatch::default()
    };
    harness.client(bo).update_block(&id, &remote).unwrap();
    harness.sync_all();
    harness.client(ana).update_block(&id, &BlockPatch::title("two")).unwrap();
    harness.sync_all();

    assert!(harness.client(ana).undo());
    harness.sync_all();
    let block_now = harness.clients[bo].days()[0].blocks[0].clone();
    assert_eq!(block_now.title, "one");
    assert_eq!(block_now.category, "culture");

    assert!(harness.client(ana).undo());
    harness.sync_all();
    let block_now = harness.clients[bo].days()[0].blocks[0].clone();
    assert_eq!(block_now.title, "Museum");
    assert_eq!(block_now.category, "culture");

    assert!(harness.client(ana).redo());
    harness.sync_all();
    assert_eq!(harness.clients[bo].days()[0].blocks[0].title, "one");
    assert!(harness.clients[ana].can_redo());
    harness.assert_converged();
}

#[test]
fn test_peer_edit_splits_undo_steps_within_capture_window() {
    // Default capture window: all edits below land well within it
    let mut harness = CollaborationHarness::with_config(CollabConfig::default());
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    harness.client(bo).add_block(block("2024-06-01", "Start")).unwrap();
    harness.sync_all();
    harness.client(ana).add_block(block("2024-06-01", "M1")).unwrap();
    harness.sync_all();
    harness.client(bo).add_block(block("2024-06-01", "R1")).unwrap();
    harness.sync_all();
    harness.client(ana).add_block(block("2024-06-01", "M2")).unwrap();
    harness.sync_all();

    assert!(harness.client(ana).undo());
    harness.sync_all();
    assert_eq!(titles(&harness.clients[bo], "2024-06-01"), vec!["Start", "M1", "R1"]);

    assert!(harness.client(ana).undo());
    harness.sync_all();
    assert_eq!(titles(&harness.clients[bo], "2024-06-01"), vec!["Start", "R1"]);
    harness.assert_converged();
}

#[test]
fn test_delete_of_remotely_deleted_block_is_noop() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    let id = harness.client(ana).add_block(block("2024-06-01", "Museum")).unwrap();
    harness.sync_all();

    assert!(harness.client(ana).delete_block(&id));
    harness.sync_all();
    let snapshot = harness.clients[bo].days().to_vec();
    assert!(!harness.client(bo).delete_block(&id));
    assert!(!harness.client(bo).delete_block(&id));
    assert_eq!(harness.clients[bo].days(), snapshot.as_slice());
    assert!(harness
        .client(bo)
        .update_block(&id, &BlockPatch::title("gone"))
        .is_ok_and(|found| !found));
}

#[test]
fn test_concurrent_delete_converges() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    let id = harness.client(ana).add_block(block("2024-06-01", "Museum")).unwrap();
    harness.sync_all();
    harness.client(ana).disconnect();

    assert!(harness.client(ana).delete_block(&id));
    assert!(harness.client(bo).delete_block(&id));
    harness.client(ana).connect();
    harness.sync_all();

    harness.assert_converged();
    assert!(harness.clients[ana].days()[0].blocks.is_empty());
}

#[test]
fn test_seed_once_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut seed_day = Day::new("2024-06-01", 1);
    seed_day.blocks.push(block("2024-06-01", "Seeded").with_id("seed-1"));

    let mut harness = CollaborationHarness::new();
    let store: Rc<dyn UpdateStore> = Rc::new(FileUpdateStore::new(dir.path()).unwrap());
    let ana = harness.add_client_with("ana", Rc::clone(&store), vec![seed_day.clone()]);
    assert_eq!(harness.clients[ana].days().len(), 1);
    assert!(!harness.clients[ana].can_undo());
    harness.clients.clear();

    // Restart against a relay that has never seen the itinerary
    let mut harness = CollaborationHarness::new();
    let store: Rc<dyn UpdateStore> = Rc::new(FileUpdateStore::new(dir.path()).unwrap());
    let mut other_day = Day::new("2024-12-24", 1);
    other_day.blocks.push(block("2024-12-24", "Other").with_id("seed-2"));
    let ana = harness.add_client_with("ana", store, vec![seed_day, other_day]);

    let days = harness.clients[ana].days();
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].blocks[0].id, "seed-1");

    // The restored replica is uploaded to the new relay
    let bo = harness.add_client("bo");
    harness.sync_all();
    assert_eq!(harness.clients[bo].days().len(), 1);
}

#[test]
fn test_two_seeding_clients_do_not_duplicate() {
    let mut seed_day = Day::new("2024-06-01", 1);
    seed_day.blocks.push(block("2024-06-01", "Seeded").with_id("seed-1"));

    let mut harness = CollaborationHarness::new();
    harness.add_client_with("ana", Rc::new(MemoryUpdateStore::new()), vec![seed_day.clone()]);
    harness.add_client_with("bo", Rc::new(MemoryUpdateStore::new()), vec![seed_day]);
    harness.sync_all();

    harness.assert_converged();
    assert_eq!(harness.clients[1].days().len(), 1);
}

#[test]
fn test_set_itinerary_replicates_and_clears_undo() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    harness.client(ana).add_block(block("2024-06-01", "Old")).unwrap();
    harness.sync_all();

    let mut day = Day::new("2024-08-01", 1);
    day.blocks.push(block("2024-08-01", "Imported").with_id("imp-1"));
    harness.client(bo).set_itinerary(vec![day]);
    harness.sync_all();

    assert!(!harness.clients[bo].can_undo());
    assert_eq!(harness.clients[ana].days().len(), 1);
    assert_eq!(harness.clients[ana].days()[0].date, "2024-08-01");
    harness.assert_converged();
}

#[test]
fn test_first_block_scenario_snapshot_json() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let new_block = NewBlock {
        duration_min: None,
        ..block("2024-06-01", "Museum")
    };
    let id = harness.client(ana).add_block(new_block).unwrap();

    let json = serde_json::to_value(harness.clients[ana].days()).unwrap();
    assert_eq!(
        json,
        serde_json::json!([{
            "date": "2024-06-01",
            "dayIndex": 1,
            "blocks": [{
                "id": id,
                "date": "2024-06-01",
                "startTime": "09:00",
                "endTime": "10:00",
                "title": "Museum",
                "type": "activity",
                "category": "sightseeing"
            }]
        }])
    );
}

#[test]
fn test_concurrent_new_date_creates_duplicate_days() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");
    harness.client(ana).disconnect();
    harness.client(bo).disconnect();

    harness.client(ana).add_block(block("2024-06-03", "Ana")).unwrap();
    harness.client(bo).add_block(block("2024-06-03", "Bo")).unwrap();
    harness.client(ana).connect();
    harness.client(bo).connect();
    harness.sync_all();

    harness.assert_converged();
    let days: Vec<&Day> = harness.clients[ana]
        .days()
        .iter()
        .filter(|day| day.date == "2024-06-03")
        .collect();
    assert_eq!(days.len(), 2);
    assert!(days.iter().all(|day| day.day_index == 1));

    // Later additions go to the first of the duplicates on every replica
    harness.client(bo).add_block(block("2024-06-03", "Later")).unwrap();
    harness.sync_all();
    harness.assert_converged();
    assert!(titles(&harness.clients[ana], "2024-06-03").contains(&"Later".to_string()));
}

#[test]
fn test_awareness_excludes_self_and_tracks_peers() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");
    harness.add_client("bo");
    harness.add_client("cy");
    harness.sync_all();

    let names: Vec<String> = harness.clients[ana]
        .aware_users()
        .iter()
        .filter_map(|peer| peer.user())
        .map(|user| user.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"bo".to_string()));
    assert!(names.contains(&"cy".to_string()));

    harness.clients.pop();
    harness.sync_all();
    assert_eq!(harness.clients[ana].aware_users().len(), 1);
}

#[test]
fn test_invalid_token_surfaces_connection_failure() {
    let relay = Relay::new(StaticTokens::new().with_token("valid", "ana-id"));
    let registry = Rc::new(SessionRegistry::new(
        RelayTransportFactory::new(relay.clone()),
        Rc::new(MemoryUpdateStore::new()),
        test_config(),
    ));
    let mut client = ItinerarySync::attach(registry, TRIP, "forged", user("ana"), Vec::new());
    client.poll();

    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    assert!(!client.is_synced());
    assert!(client
        .take_notifications()
        .iter()
        .any(|n| matches!(n, SyncNotification::ConnectionFailed { .. })));
    assert_eq!(relay.peer_count(TRIP), 0);
}

fn fast_retry_config() -> CollabConfig {
    CollabConfig {
        reconnect_base_delay_ms: 0,
        ..test_config()
    }
}

#[test]
fn test_client_reconnects_after_relay_drops_it() {
    let mut harness = CollaborationHarness::with_config(fast_retry_config());
    let ana = harness.add_client("ana");
    let bo = harness.add_client("bo");

    let client_id = harness.clients[ana].session().client_id();
    harness.relay.leave(TRIP, client_id);
    for _ in 0..5 {
        harness.client(ana).poll();
    }
    assert_eq!(harness.clients[ana].connection_status(), ConnectionStatus::Connected);
    assert_eq!(harness.relay.peer_count(TRIP), 2);

    harness.client(ana).add_block(block("2024-06-01", "After drop")).unwrap();
    harness.sync_all();
    assert_eq!(harness.clients[bo].days().len(), 1);
    harness.assert_converged();
}

#[test]
fn test_reconnect_waits_for_backoff_delay() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");

    let client_id = harness.clients[ana].session().client_id();
    harness.relay.leave(TRIP, client_id);
    harness.client(ana).poll();
    harness.client(ana).poll();

    assert_eq!(harness.clients[ana].connection_status(), ConnectionStatus::Disconnected);
    assert!(harness.clients[ana].is_reconnecting());
    assert!(!harness.clients[ana].is_synced());
}

#[test]
fn test_rejected_token_is_not_retried() {
    let relay = Relay::new(StaticTokens::new().with_token("valid", "ana-id"));
    let registry = Rc::new(SessionRegistry::new(
        RelayTransportFactory::new(relay.clone()),
        Rc::new(MemoryUpdateStore::new()),
        fast_retry_config(),
    ));
    let mut client = ItinerarySync::attach(registry, TRIP, "forged", user("ana"), Vec::new());
    for _ in 0..5 {
        client.poll();
    }

    let failures = client
        .take_notifications()
        .into_iter()
        .filter(|n| matches!(n, SyncNotification::ConnectionFailed { .. }))
        .count();
    assert_eq!(failures, 1);
    assert!(!client.is_reconnecting());
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
}

struct FailingStore;

impl UpdateStore for FailingStore {
    fn load(&self, _: &str) -> Result<Vec<Update>, StorageError> {
        Ok(Vec::new())
    }

    fn append(&self, _: &str, _: &Update) -> Result<(), StorageError> {
        Err(std::io::Error::other("disk full").into())
    }

    fn clear(&self, _: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

#[test]
fn test_persistence_failure_degrades_to_memory() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client_with("ana", Rc::new(FailingStore), Vec::new());
    let bo = harness.add_client("bo");

    harness.client(ana).add_block(block("2024-06-01", "Museum")).unwrap();
    harness.client(ana).add_block(block("2024-06-01", "Lunch")).unwrap();
    harness.sync_all();

    assert!(harness.clients[ana].is_persistence_degraded());
    assert_eq!(titles(&harness.clients[bo], "2024-06-01"), vec!["Museum", "Lunch"]);
}

#[test]
fn test_validation_errors_escape_the_mutation_api() {
    let mut harness = CollaborationHarness::new();
    let ana = harness.add_client("ana");

    let err = harness
        .client(ana)
        .add_block(block("June 1st", "Museum"))
        .unwrap_err();
    assert!(matches!(err, CollabError::InvalidBlock { field: "date", .. }));
    assert!(harness.clients[ana].days().is_empty());
}

#[test]
fn test_file_store_layout() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = CollaborationHarness::new();
    let store: Rc<dyn UpdateStore> = Rc::new(FileUpdateStore::new(dir.path()).unwrap());
    let ana = harness.add_client_with("ana", store, Vec::new());
    harness.client(ana).add_block(block("2024-06-01", "Museum")).unwrap();

    let log = dir.path().join(TRIP).join("updates.jsonl");
    assert!(Path::new(&log).exists());
    let lines = std::fs::read_to_string(log).unwrap();
    assert_eq!(lines.lines().count(), 1);
}

#[derive(Clone, Debug)]
enum Action {
    Add { day: u8, title: u8 },
    Update { pick: usize, title: u8 },
    Delete { pick: usize },
    Reorder { day: u8, from: usize, to: usize },
    Comment { pick: usize },
    Toggle { pick: usize },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (0u8..3, any::<u8>()).prop_map(|(day, title)| Action::Add { day, title }),
        2 => (any::<usize>(), any::<u8>()).prop_map(|(pick, title)| Action::Update { pick, title }),
        1 => any::<usize>().prop_map(|pick| Action::Delete { pick }),
        1 => (0u8..3, 0usize..4, 0usize..4).prop_map(|(day, from, to)| Action::Reorder { day, from, to }),
        1 => any::<usize>().prop_map(|pick| Action::Comment { pick }),
        1 => any::<usize>().prop_map(|pick| Action::Toggle { pick }),
    ]
}

fn date(day: u8) -> String {
    format!("2024-06-0{}", day + 1)
}

fn apply(client: &mut ItinerarySync, action: &Action) {
    let ids: Vec<String> = client
        .days()
        .iter()
        .flat_map(|day| day.blocks.iter().map(|b| b.id.clone()))
        .collect();
    let pick = |n: usize| (!ids.is_empty()).then(|| ids[n % ids.len()].clone());

    match action {
        Action::Add { day, title } => {
            client.add_block(block(&date(*day), &format!("t{title}"))).unwrap();
        }
        Action::Update { pick: n, title } => {
            if let Some(id) = pick(*n) {
                client.update_block(&id, &BlockPatch::title(format!("u{title}"))).unwrap();
            }
        }
        Action::Delete { pick: n } => {
            if let Some(id) = pick(*n) {
                client.delete_block(&id);
            }
        }
        Action::Reorder { day, from, to } => {
            client.reorder_blocks(&date(*day), *from, *to);
        }
        Action::Comment { pick: n } => {
            if let Some(id) = pick(*n) {
                client.add_comment(&id, "note").unwrap();
            }
        }
        Action::Toggle { pick: n } => {
            if let Some(id) = pick(*n) {
                client.toggle_comment_thread_resolved(&id);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

    #[test]
    fn replicas_converge_after_offline_edits(
        shared in prop::collection::vec(action_strategy(), 0..6),
        ana_actions in prop::collection::vec(action_strategy(), 0..12),
        bo_actions in prop::collection::vec(action_strategy(), 0..12),
    ) {
        let mut harness = CollaborationHarness::new();
        let ana = harness.add_client("ana");
        let bo = harness.add_client("bo");

        for action in &shared {
            apply(harness.client(ana), action);
        }
        harness.sync_all();

        harness.client(ana).disconnect();
        harness.client(bo).disconnect();
        for action in &ana_actions {
            apply(harness.client(ana), action);
        }
        for action in &bo_actions {
            apply(harness.client(bo), action);
        }
        harness.client(ana).connect();
        harness.client(bo).connect();
        harness.sync_all();

        prop_assert_eq!(harness.clients[ana].days(), harness.clients[bo].days());
        prop_assert_eq!(
            harness.clients[ana].comment_threads(),
            harness.clients[bo].comment_threads()
        );
    }
}
