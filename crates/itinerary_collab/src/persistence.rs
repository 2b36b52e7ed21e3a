//! Durable local mirror of itinerary documents.
//!
//! Every transaction's [`Update`] is appended to an [`UpdateStore`] as it
//! commits, so the document and its edit history survive restarts and
//! offline periods. Opening a document replays the stored updates.
//!
//! # Directory Structure
//!
//! [`FileUpdateStore`] keeps one directory per itinerary:
//!
//! ```text
//! data/
//! └── {itinerary_id}/
//!     └── updates.jsonl    # Append-only log of updates (JSON lines format)
//! ```
//!
//! Storage failures never reach callers of the mutation API: they are logged
//! and the [`Persistence`] handle switches to memory-only operation.

use crate::config::CollabConfig;
use crate::doc::{Doc, Subscription};
use crate::error::{StorageError, StorageResult};
use crate::op_id::Origin;
use crate::operation::Update;
use std::cell::Cell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// File names used for storage
const UPDATES_FILE: &str = "updates.jsonl";
const COMPACT_FILE: &str = "updates.jsonl.tmp";

/// Durable storage of update logs, keyed by itinerary id.
pub trait UpdateStore {
    /// All updates stored for an itinerary, oldest first.
    fn load(&self, itinerary_id: &str) -> StorageResult<Vec<Update>>;

    /// Append one update.
    fn append(&self, itinerary_id: &str, update: &Update) -> StorageResult<()>;

    /// Remove everything stored for an itinerary.
    fn clear(&self, itinerary_id: &str) -> StorageResult<()>;

    /// Replace the whole log with a single update.
    fn replace(&self, itinerary_id: &str, update: &Update) -> StorageResult<()> {
        self.clear(itinerary_id)?;
        self.append(itinerary_id, update)
    }
}

/// In-memory implementation of [`UpdateStore`].
///
/// Nothing survives the process; useful for tests and memory-only sessions.
#[derive(Debug, Default)]
pub struct MemoryUpdateStore {
    logs: RwLock<HashMap<String, Vec<Update>>>,
}

impl MemoryUpdateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of updates stored for an itinerary.
    pub fn update_count(&self, itinerary_id: &str) -> usize {
        self.logs
            .read()
            .map(|logs| logs.get(itinerary_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl UpdateStore for MemoryUpdateStore {
    fn load(&self, itinerary_id: &str) -> StorageResult<Vec<Update>> {
        let logs = self.logs.read().map_err(|_| StorageError::Poisoned)?;
        Ok(logs.get(itinerary_id).cloned().unwrap_or_default())
    }

    fn append(&self, itinerary_id: &str, update: &Update) -> StorageResult<()> {
        let mut logs = self.logs.write().map_err(|_| StorageError::Poisoned)?;
        logs.entry(itinerary_id.to_string())
            .or_default()
            .push(update.clone());
        Ok(())
    }

    fn clear(&self, itinerary_id: &str) -> StorageResult<()> {
        let mut logs = self.logs.write().map_err(|_| StorageError::Poisoned)?;
        logs.remove(itinerary_id);
        Ok(())
    }
}

/// File-based implementation of [`UpdateStore`].
///
/// Updates are stored one JSON document per line and flushed after each
/// append. Itinerary ids are sanitised into directory names.
pub struct FileUpdateStore {
    /// Base directory for all itinerary data
    base_path: PathBuf,
    /// Serializes writers
    lock: Mutex<()>,
}

impl FileUpdateStore {
    /// Create a store rooted at `base_path`, creating the directory.
    pub fn new(base_path: impl AsRef<Path>) -> StorageResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            lock: Mutex::new(()),
        })
    }

    /// Store under the configured `storage_dir`.
    pub fn from_config(config: &CollabConfig) -> StorageResult<Self> {
        Self::new(&config.storage_dir)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn itinerary_dir(&self, itinerary_id: &str) -> PathBuf {
        self.base_path.join(sanitize(itinerary_id))
    }

    fn updates_path(&self, itinerary_id: &str) -> PathBuf {
        self.itinerary_dir(itinerary_id).join(UPDATES_FILE)
    }
}

/// Keep ids usable as a single path component.
fn sanitize(itinerary_id: &str) -> String {
    let cleaned: String = itinerary_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

impl UpdateStore for FileUpdateStore {
    fn load(&self, itinerary_id: &str) -> StorageResult<Vec<Update>> {
        let path = self.updates_path(itinerary_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut updates = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Update>(&line) {
                Ok(update) => updates.push(update),
                // Torn final write
                Err(e) => warn!(itinerary_id, error = %e, "skipping unreadable update line"),
            }
        }
        debug!(itinerary_id, updates = updates.len(), "loaded update log");
        Ok(updates)
    }

    fn append(&self, itinerary_id: &str, update: &Update) -> StorageResult<()> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        fs::create_dir_all(self.itinerary_dir(itinerary_id))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.updates_path(itinerary_id))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, update)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn clear(&self, itinerary_id: &str) -> StorageResult<()> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let path = self.updates_path(itinerary_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn replace(&self, itinerary_id: &str, update: &Update) -> StorageResult<()> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let dir = self.itinerary_dir(itinerary_id);
        fs::create_dir_all(&dir)?;

        // Write to a temp file, then rename over the log
        let tmp = dir.join(COMPACT_FILE);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, update)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        fs::rename(tmp, dir.join(UPDATES_FILE))?;
        Ok(())
    }
}

/// Write-through binding between one [`Doc`] and an [`UpdateStore`].
pub struct Persistence {
    store: Rc<dyn UpdateStore>,
    itinerary_id: String,
    degraded: Rc<Cell<bool>>,
    subscription: Subscription,
}

impl Persistence {
    /// Replay stored updates into `doc`, then persist every later transaction.
    ///
    /// A failing store is logged and leaves the handle memory-only.
    pub fn open(store: Rc<dyn UpdateStore>, itinerary_id: &str, doc: &mut Doc) -> Self {
        let degraded = Rc::new(Cell::new(false));

        match store.load(itinerary_id) {
            Ok(updates) => {
                let count = updates.len();
                for update in &updates {
                    doc.apply_update(update, Origin::Persistence);
                }
                if count > 0 {
                    info!(itinerary_id, updates = count, "restored itinerary from local store");
                }
            }
            Err(e) => {
                warn!(itinerary_id, error = %e, "local store unavailable; continuing in memory only");
                degraded.set(true);
            }
        }

        let subscription = {
            let store = Rc::clone(&store);
            let degraded = Rc::clone(&degraded);
            let itinerary_id = itinerary_id.to_string();
            doc.observe_deep(move |event| {
                if event.origin == Origin::Persistence || degraded.get() {
                    return;
                }
                if let Err(e) = store.append(&itinerary_id, &event.update) {
                    warn!(
                        itinerary_id = %itinerary_id,
                        error = %e,
                        "failed to persist update; continuing in memory only"
                    );
                    degraded.set(true);
                }
            })
        };

        Self {
            store,
            itinerary_id: itinerary_id.to_string(),
            degraded,
            subscription,
        }
    }

    /// True once a storage failure switched the handle to memory-only.
    pub fn is_degraded(&self) -> bool {
        self.degraded.get()
    }

    pub fn itinerary_id(&self) -> &str {
        &self.itinerary_id
    }

    /// Rewrite the stored log as one full-state update.
    pub fn compact(&self, doc: &Doc) {
        if self.is_degraded() {
            return;
        }
        let full = doc.encode_full();
        match self.store.replace(&self.itinerary_id, &full) {
            Ok(()) => debug!(itinerary_id = %self.itinerary_id, ops = full.len(), "compacted update log"),
            Err(e) => {
                warn!(itinerary_id = %self.itinerary_id, error = %e, "compaction failed; continuing in memory only");
                self.degraded.set(true);
            }
        }
    }

    /// Stop writing through.
    pub fn detach(&self, doc: &mut Doc) {
        doc.unobserve(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_id::{ClientId, SessionId};
    use crate::value::DAYS_ROOT;

    struct BrokenStore;

    impl UpdateStore for BrokenStore {
        fn load(&self, _: &str) -> StorageResult<Vec<Update>> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into())
        }

        fn append(&self, _: &str, _: &Update) -> StorageResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into())
        }

        fn clear(&self, _: &str) -> StorageResult<()> {
            Ok(())
        }
    }

    fn push(doc: &mut Doc, origin: Origin, text: &str) {
        doc.transact(origin, |txn| {
            txn.array_push(DAYS_ROOT, text.into());
        });
    }

    fn texts(doc: &Doc) -> Vec<String> {
        doc.array_elements(DAYS_ROOT)
            .into_iter()
            .filter_map(|(_, v)| v.as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_write_through_and_restore() {
        let store: Rc<dyn UpdateStore> = Rc::new(MemoryUpdateStore::new());
        let session = SessionId::generate();

        let mut doc = Doc::new(ClientId::new(1));
        let persistence = Persistence::open(Rc::clone(&store), "trip-1", &mut doc);
        push(&mut doc, Origin::Local(session), "a");
        push(&mut doc, Origin::Remote, "b");
        assert!(!persistence.is_degraded());

        let mut reopened = Doc::new(ClientId::new(2));
        Persistence::open(Rc::clone(&store), "trip-1", &mut reopened);
        assert_eq!(texts(&reopened), texts(&doc));
        assert_eq!(reopened.state_vector(), doc.state_vector());
    }

    #[test]
    fn test_restored_updates_are_not_written_again() {
        let store = Rc::new(MemoryUpdateStore::new());
        let mut doc = Doc::new(ClientId::new(1));
        Persistence::open(store.clone(), "trip", &mut doc);
        push(&mut doc, Origin::Remote, "a");
        assert_eq!(store.update_count("trip"), 1);

        let mut reopened = Doc::new(ClientId::new(1));
        Persistence::open(store.clone(), "trip", &mut reopened);
        assert_eq!(store.update_count("trip"), 1);
    }

    #[test]
    fn test_failing_store_degrades_to_memory() {
        let mut doc = Doc::new(ClientId::new(1));
        let persistence = Persistence::open(Rc::new(BrokenStore), "trip", &mut doc);
        assert!(persistence.is_degraded());

        push(&mut doc, Origin::Remote, "still works");
        assert_eq!(texts(&doc), vec!["still works"]);
    }

    #[test]
    fn test_append_failure_degrades() {
        struct LoadsButCannotWrite;
        impl UpdateStore for LoadsButCannotWrite {
            fn load(&self, _: &str) -> StorageResult<Vec<Update>> {
                Ok(Vec::new())
            }
            fn append(&self, _: &str, _: &Update) -> StorageResult<()> {
                Err(StorageError::Poisoned)
            }
            fn clear(&self, _: &str) -> StorageResult<()> {
                Ok(())
            }
        }

        let mut doc = Doc::new(ClientId::new(1));
        let persistence = Persistence::open(Rc::new(LoadsButCannotWrite), "trip", &mut doc);
        assert!(!persistence.is_degraded());
        push(&mut doc, Origin::Remote, "x");
        assert!(persistence.is_degraded());
        assert_eq!(texts(&doc), vec!["x"]);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store: Rc<dyn UpdateStore> = Rc::new(FileUpdateStore::new(dir.path()).unwrap());

        let mut doc = Doc::new(ClientId::new(1));
        Persistence::open(Rc::clone(&store), "trips/42", &mut doc);
        push(&mut doc, Origin::Remote, "a");
        push(&mut doc, Origin::Remote, "b");

        assert!(dir.path().join("trips_42").join(UPDATES_FILE).exists());
        assert_eq!(store.load("trips/42").unwrap().len(), 2);

        let mut reopened = Doc::new(ClientId::new(2));
        Persistence::open(Rc::clone(&store), "trips/42", &mut reopened);
        assert_eq!(texts(&reopened), vec!["a", "b"]);
    }

    #[test]
    fn test_file_store_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = CollabConfig {
            storage_dir: dir.path().join("itineraries"),
            ..CollabConfig::default()
        };
        let store = FileUpdateStore::from_config(&config).unwrap();
        assert_eq!(store.base_path(), config.storage_dir.as_path());
        assert!(config.storage_dir.is_dir());
    }

    #[test]
    fn test_compact_rewrites_log() {
        let dir = tempfile::tempdir().unwrap();
        let store: Rc<dyn UpdateStore> = Rc::new(FileUpdateStore::new(dir.path()).unwrap());

        let mut doc = Doc::new(ClientId::new(1));
        let persistence = Persistence::open(Rc::clone(&store), "trip", &mut doc);
        for text in ["a", "b", "c"] {
            push(&mut doc, Origin::Remote, text);
        }
        persistence.compact(&doc);

        let updates = store.load("trip").unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 3);

        let mut reopened = Doc::new(ClientId::new(2));
        Persistence::open(Rc::clone(&store), "trip", &mut reopened);
        assert_eq!(texts(&reopened), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileUpdateStore::new(dir.path()).unwrap();
        store.append("trip", &Update::default()).unwrap();

        let path = dir.path().join("trip").join(UPDATES_FILE);
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(b"{\"ops\":[").unwrap();

        assert_eq!(store.load("trip").unwrap().len(), 1);
    }
}
