//! Local persisted replica.
//!
//! The engine only needs a narrow view of the local store: checkpoint records
//! keyed by stream, and one write transaction per batch in which listeners
//! upsert and delete their entities. Concrete relational stores implement
//! [`LocalStore`]; [`MemoryStore`] is the in-process implementation used by
//! tests and tools, optionally persisted to a single snapshot file.

use crate::error::{SyncError, SyncResult};
use evsync_protocol::{EventId, SyncStreamId};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Writes and reads performed inside one store transaction.
///
/// Reads observe the transaction's own pending writes.
pub trait StoreTransaction {
    /// Reads one entity.
    fn get(&self, table: &str, key: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Lists the keys of `table` starting with `prefix`, in key order.
    fn keys(&self, table: &str, prefix: &str) -> SyncResult<Vec<String>>;

    /// Inserts or replaces one entity.
    fn put(&mut self, table: &str, key: &str, value: Vec<u8>) -> SyncResult<()>;

    /// Deletes one entity. Deleting a missing entity is not an error.
    fn delete(&mut self, table: &str, key: &str) -> SyncResult<()>;

    /// Replaces the checkpoint of `stream`.
    fn set_checkpoint(&mut self, stream: &SyncStreamId, event_id: &EventId) -> SyncResult<()>;

    /// Removes the checkpoint of `stream`.
    fn clear_checkpoint(&mut self, stream: &SyncStreamId) -> SyncResult<()>;
}

/// The local store the engine applies batches to.
pub trait LocalStore: Send + Sync {
    /// Loads the checkpoint of `stream`.
    fn checkpoint(&self, stream: &SyncStreamId) -> SyncResult<Option<EventId>>;

    /// Reads one committed entity.
    fn get(&self, table: &str, key: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Lists committed keys of `table` starting with `prefix`.
    fn keys(&self, table: &str, prefix: &str) -> SyncResult<Vec<String>>;

    /// Runs `body` in one write transaction.
    ///
    /// The transaction commits if `body` returns `Ok` and is discarded
    /// otherwise; no write of a failed body is ever observable.
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreTransaction) -> SyncResult<()>,
    ) -> SyncResult<()>;

    /// Stores the checkpoint of `stream` in its own transaction.
    fn set_checkpoint(&self, stream: &SyncStreamId, event_id: &EventId) -> SyncResult<()> {
        self.transaction(&mut |txn| txn.set_checkpoint(stream, event_id))
    }

    /// Removes the checkpoint of `stream` in its own transaction.
    fn clear_checkpoint(&self, stream: &SyncStreamId) -> SyncResult<()> {
        self.transaction(&mut |txn| txn.clear_checkpoint(stream))
    }

    /// Deletes every entity of `table` whose key starts with `prefix`.
    ///
    /// Returns the number of deleted entities.
    fn delete_prefix(&self, table: &str, prefix: &str) -> SyncResult<usize> {
        let mut deleted = 0;
        self.transaction(&mut |txn| {
            let keys = txn.keys(table, prefix)?;
            deleted = keys.len();
            for key in keys {
                txn.delete(table, &key)?;
            }
            Ok(())
        })?;
        Ok(deleted)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    tables: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    checkpoints: BTreeMap<String, EventId>,
}

#[derive(Default)]
struct PendingWrites {
    entities: BTreeMap<(String, String), Option<Vec<u8>>>,
    checkpoints: BTreeMap<String, Option<EventId>>,
}

impl PendingWrites {
    fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.checkpoints.is_empty()
    }

    fn apply_to(self, snapshot: &mut Snapshot) {
        for ((table, key), value) in self.entities {
            match value {
                Some(value) => {
                    snapshot.tables.entry(table).or_default().insert(key, value);
                }
                None => {
                    if let Some(rows) = snapshot.tables.get_mut(&table) {
                        rows.remove(&key);
                        if rows.is_empty() {
                            snapshot.tables.remove(&table);
                        }
                    }
                }
            }
        }
        for (stream, event_id) in self.checkpoints {
            match event_id {
                Some(event_id) => {
                    snapshot.checkpoints.insert(stream, event_id);
                }
                None => {
                    snapshot.checkpoints.remove(&stream);
                }
            }
        }
    }
}

struct MemoryTransaction<'a> {
    base: &'a Snapshot,
    pending: PendingWrites,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn get(&self, table: &str, key: &str) -> SyncResult<Option<Vec<u8>>> {
        if let Some(value) = self
            .pending
            .entities
            .get(&(table.to_string(), key.to_string()))
        {
            return Ok(value.clone());
        }
        Ok(self
            .base
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn keys(&self, table: &str, prefix: &str) -> SyncResult<Vec<String>> {
        let mut keys: BTreeMap<&str, bool> = self
            .base
            .tables
            .get(table)
            .map(|rows| {
                rows.keys()
                    .filter(|k| k.starts_with(prefix))
                    .map(|k| (k.as_str(), true))
                    .collect()
            })
            .unwrap_or_default();
        for ((t, k), value) in &self.pending.entities {
            if t == table && k.starts_with(prefix) {
                keys.insert(k.as_str(), value.is_some());
            }
        }
        Ok(keys
            .into_iter()
            .filter(|(_, live)| *live)
            .map(|(k, _)| k.to_string())
            .collect())
    }

    fn put(&mut self, table: &str, key: &str, value: Vec<u8>) -> SyncResult<()> {
        self.pending
            .entities
            .insert((table.to_string(), key.to_string()), Some(value));
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &str) -> SyncResult<()> {
        self.pending
            .entities
            .insert((table.to_string(), key.to_string()), None);
        Ok(())
    }

    fn set_checkpoint(&mut self, stream: &SyncStreamId, event_id: &EventId) -> SyncResult<()> {
        self.pending
            .checkpoints
            .insert(stream.key(), Some(event_id.clone()));
        Ok(())
    }

    fn clear_checkpoint(&mut self, stream: &SyncStreamId) -> SyncResult<()> {
        self.pending.checkpoints.insert(stream.key(), None);
        Ok(())
    }
}

/// An in-memory [`LocalStore`].
///
/// # Transactions
///
/// Only one write transaction runs at a time; readers are never blocked by a
/// transaction body and only ever see committed state. When opened with a
/// path, the full state is written to disk (temp file, then rename) before a
/// commit becomes visible, so a failed write leaves both disk and memory at
/// the previous state.
///
/// # Example
///
/// ```rust
/// use evsync_engine::{LocalStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// store
///     .transaction(&mut |txn| txn.put("label", "u1/l1", vec![1]))
///     .unwrap();
/// assert_eq!(store.get("label", "u1/l1").unwrap(), Some(vec![1]));
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Snapshot>,
    path: Option<PathBuf>,
    commits: AtomicU64,
}

impl MemoryStore {
    /// Creates a new empty, non-persistent store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store persisted at `path`, loading it if the file exists.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let bytes = fs::read(&path)
                .map_err(|e| SyncError::store(format!("read {}: {}", path.display(), e)))?;
            ciborium::from_reader(bytes.as_slice())
                .map_err(|e| SyncError::store(format!("decode {}: {}", path.display(), e)))?
        } else {
            Snapshot::default()
        };

        debug!(path = %path.display(), checkpoints = snapshot.checkpoints.len(), "opened store");

        Ok(Self {
            state: RwLock::new(snapshot),
            path: Some(path),
            commits: AtomicU64::new(0),
        })
    }

    /// Returns the number of committed write transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Returns the number of entities in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.state
            .read()
            .tables
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Returns a copy of every entity in `table`.
    pub fn table(&self, table: &str) -> BTreeMap<String, Vec<u8>> {
        self.state
            .read()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn persist(&self, snapshot: &Snapshot) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(snapshot, &mut bytes)
            .map_err(|e| SyncError::store(format!("encode snapshot: {}", e)))?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)
            .map_err(|e| SyncError::store(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, path)
            .map_err(|e| SyncError::store(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn checkpoint(&self, stream: &SyncStreamId) -> SyncResult<Option<EventId>> {
        Ok(self.state.read().checkpoints.get(&stream.key()).cloned())
    }

    fn get(&self, table: &str, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self
            .state
            .read()
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn keys(&self, table: &str, prefix: &str) -> SyncResult<Vec<String>> {
        Ok(self
            .state
            .read()
            .tables
            .get(table)
            .map(|rows| {
                rows.keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreTransaction) -> SyncResult<()>,
    ) -> SyncResult<()> {
        // Single writer: the upgradable guard excludes other transactions but
        // not readers.
        let guard = self.state.upgradable_read();
        let mut txn = MemoryTransaction {
            base: &guard,
            pending: PendingWrites::default(),
        };
        body(&mut txn)?;
        let pending = txn.pending;

        if pending.is_empty() {
            return Ok(());
        }

        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        if self.path.is_some() {
            let mut next = guard.clone();
            pending.apply_to(&mut next);
            self.persist(&next)?;
            *guard = next;
        } else {
            pending.apply_to(&mut guard);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_writes_are_visible() {
        let store = MemoryStore::new();
        store
            .transaction(&mut |txn| {
                txn.put("label", "u1/a", vec![1])?;
                txn.put("label", "u1/b", vec![2])?;
                assert_eq!(txn.get("label", "u1/a")?, Some(vec![1]));
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get("label", "u1/b").unwrap(), Some(vec![2]));
        assert_eq!(store.len("label"), 2);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn failed_transaction_is_discarded() {
        let store = MemoryStore::new();
        let stream = SyncStreamId::core("u1");
        store.set_checkpoint(&stream, &EventId::new("e1")).unwrap();

        let result = store.transaction(&mut |txn| {
            txn.put("label", "u1/a", vec![1])?;
            txn.set_checkpoint(&stream, &EventId::new("e2"))?;
            Err(SyncError::store("constraint violated"))
        });

        assert!(result.is_err());
        assert_eq!(store.get("label", "u1/a").unwrap(), None);
        assert_eq!(store.checkpoint(&stream).unwrap(), Some(EventId::new("e1")));
    }

    #[test]
    fn keys_merge_pending_writes() {
        let store = MemoryStore::new();
        store
            .transaction(&mut |txn| {
                txn.put("label", "u1/a", vec![1])?;
                txn.put("label", "u2/a", vec![1])
            })
            .unwrap();

        store
            .transaction(&mut |txn| {
                txn.put("label", "u1/b", vec![2])?;
                txn.delete("label", "u1/a")?;
                assert_eq!(txn.keys("label", "u1/")?, vec!["u1/b".to_string()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_prefix_only_touches_prefix() {
        let store = MemoryStore::new();
        store
            .transaction(&mut |txn| {
                txn.put("label", "u1/a", vec![1])?;
                txn.put("label", "u1/b", vec![1])?;
                txn.put("label", "u2/a", vec![1])
            })
            .unwrap();

        assert_eq!(store.delete_prefix("label", "u1/").unwrap(), 2);
        assert_eq!(store.keys("label", "").unwrap(), vec!["u2/a".to_string()]);
    }

    #[test]
    fn checkpoint_management() {
        let store = MemoryStore::new();
        let stream = SyncStreamId::drive("u1", "s1");

        assert_eq!(store.checkpoint(&stream).unwrap(), None);
        store.set_checkpoint(&stream, &EventId::new("e42")).unwrap();
        assert_eq!(store.checkpoint(&stream).unwrap(), Some(EventId::new("e42")));
        store.clear_checkpoint(&stream).unwrap();
        assert_eq!(store.checkpoint(&stream).unwrap(), None);
    }

    #[test]
    fn persisted_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.cbor");
        let stream = SyncStreamId::core("u1");

        {
            let store = MemoryStore::open(&path).unwrap();
            store
                .transaction(&mut |txn| {
                    txn.put("label", "u1/a", vec![7])?;
                    txn.set_checkpoint(&stream, &EventId::new("e5"))
                })
                .unwrap();
        }

        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.get("label", "u1/a").unwrap(), Some(vec![7]));
        assert_eq!(store.checkpoint(&stream).unwrap(), Some(EventId::new("e5")));
    }

    #[test]
    fn empty_transaction_does_not_commit() {
        let store = MemoryStore::new();
        store.transaction(&mut |_| Ok(())).unwrap();
        assert_eq!(store.commit_count(), 0);
    }
}
