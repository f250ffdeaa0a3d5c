//! In-memory storage engine and near cache.

use crate::atomic::context::{AppliedWrite, NearCache, StorageEngine, StoreWrite};
use crate::atomic::result::InvokeOutcome;
use crate::core::error::FailureCause;
use crate::core::types::{Key, NodeId, Operation, Value, WriteVersion, TTL_NOT_CHANGED};
use crate::wire::messages::BackupEntry;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Entry processor: maps the current value and arguments to the new value and the
/// result returned to the caller.
pub type Processor =
    Arc<dyn Fn(Option<&Value>, &[Bytes]) -> Result<(Option<Value>, Option<Bytes>), String> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    version: WriteVersion,
    ttl: i64,
}

/// Storage engine keeping every partition of one node in memory.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Key, StoredEntry>>,
    /// Tombstones keep the version of removed keys so late writes lose.
    removed: RwLock<HashMap<Key, WriteVersion>>,
    counters: Mutex<HashMap<u32, u64>>,
    processors: RwLock<HashMap<String, Processor>>,
    readers: RwLock<HashMap<Key, Vec<NodeId>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an entry processor available under `name`.
    pub fn register_processor(&self, name: impl Into<String>, processor: Processor) {
        self.processors.write().insert(name.into(), processor);
    }

    /// Record that `node` holds a near-side read view of `key`.
    pub fn add_reader(&self, key: impl Into<Key>, node: NodeId) {
        let mut readers = self.readers.write();
        let nodes = readers.entry(key.into()).or_default();
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.entries.read().get(key).map(|entry| entry.value.clone())
    }

    /// Version of the last write applied to `key`.
    pub fn version(&self, key: &[u8]) -> Option<WriteVersion> {
        if let Some(entry) = self.entries.read().get(key) {
            return Some(entry.version);
        }
        self.removed.read().get(key).copied()
    }

    pub fn ttl(&self, key: &[u8]) -> Option<i64> {
        self.entries.read().get(key).map(|entry| entry.ttl)
    }

    /// Update counter of `partition`.
    pub fn update_counter(&self, partition: u32) -> u64 {
        self.counters.lock().get(&partition).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn write_value(&self, key: Key, value: Option<Value>, version: WriteVersion, ttl: i64) {
        match value {
            Some(value) => {
                self.removed.write().remove(&key);
                let ttl = match (ttl, self.entries.read().get(&key)) {
                    (TTL_NOT_CHANGED, Some(existing)) => existing.ttl,
                    _ => ttl,
                };
                self.entries
                    .write()
                    .insert(key, StoredEntry { value, version, ttl });
            }
            None => {
                self.entries.write().remove(&key);
                self.removed.write().insert(key, version);
            }
        }
    }

    fn next_counter(&self, partition: u32) -> u64 {
        let mut counters = self.counters.lock();
        let counter = counters.entry(partition).or_insert(0);
        *counter += 1;
        *counter
    }
}

impl StorageEngine for MemoryStore {
    fn apply(&self, partition: u32, write: StoreWrite) -> Result<AppliedWrite, FailureCause> {
        let previous = self.get(&write.key);

        let passes = write
            .filters
            .iter()
            .all(|filter| filter.matches(previous.as_ref()));
        if !passes {
            return Ok(AppliedWrite {
                previous,
                filtered: true,
                update_counter: self.update_counter(partition),
                ..AppliedWrite::default()
            });
        }

        let (new_value, invoke) = match write.operation {
            Operation::Update => (write.value.clone(), None),
            Operation::Delete => (None, None),
            Operation::Transform => {
                let Some(name) = write.processor.as_ref().map(|p| p.name.clone()) else {
                    return Err(FailureCause::rejected("transform without entry processor"));
                };
                let Some(processor) = self.processors.read().get(&name).cloned() else {
                    return Err(FailureCause::rejected(format!(
                        "unknown entry processor: {}",
                        name
                    )));
                };
                match processor(previous.as_ref(), &write.invoke_args) {
                    Ok((value, result)) => (value, Some(InvokeOutcome::Value(result))),
                    Err(message) => {
                        return Ok(AppliedWrite {
                            new_value: previous.clone(),
                            previous,
                            invoke: Some(InvokeOutcome::Error(message)),
                            filtered: true,
                            update_counter: self.update_counter(partition),
                            ..AppliedWrite::default()
                        });
                    }
                }
            }
        };

        let ttl = write
            .expiry
            .map_or(TTL_NOT_CHANGED, |expiry| expiry.ttl_for_write(previous.is_some()));
        self.write_value(write.key, new_value.clone(), write.version, ttl);

        Ok(AppliedWrite {
            previous,
            new_value,
            invoke,
            filtered: false,
            update_counter: self.next_counter(partition),
            ttl,
        })
    }

    fn apply_backup(&self, partition: u32, entry: &BackupEntry, version: WriteVersion) {
        if self.version(&entry.key).is_some_and(|current| current >= version) {
            tracing::debug!(write_version = %version, "ignoring stale backup write");
            return;
        }
        self.write_value(entry.key.clone(), entry.value.clone(), version, entry.ttl);

        let mut counters = self.counters.lock();
        let counter = counters.entry(partition).or_insert(0);
        *counter = (*counter).max(entry.update_counter);
    }

    fn readers(&self, key: &Key) -> Vec<NodeId> {
        self.readers.read().get(key).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

/// Near-side read view kept in memory.
#[derive(Debug, Default)]
pub struct MemoryNearCache {
    entries: RwLock<HashMap<Key, (Value, WriteVersion)>>,
}

impl MemoryNearCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.entries.read().get(key).map(|(value, _)| value.clone())
    }

    pub fn version(&self, key: &[u8]) -> Option<WriteVersion> {
        self.entries.read().get(key).map(|(_, version)| *version)
    }
}

impl NearCache for MemoryNearCache {
    fn apply_update(&self, key: &Key, value: Option<Value>, version: WriteVersion, _ttl: i64) {
        let mut entries = self.entries.write();
        if entries
            .get(key)
            .is_some_and(|(_, current)| *current > version)
        {
            return;
        }
        match value {
            Some(value) => {
                entries.insert(key.clone(), (value, version));
            }
            None => {
                entries.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EntryFilter, ProcessorRef};

    fn write(key: &'static str, value: Option<&'static str>, order: u64) -> StoreWrite {
        StoreWrite {
            key: Bytes::from_static(key.as_bytes()),
            operation: if value.is_some() {
                Operation::Update
            } else {
                Operation::Delete
            },
            value: value.map(|v| Bytes::from_static(v.as_bytes())),
            processor: None,
            invoke_args: Vec::new(),
            filters: Vec::new(),
            expiry: None,
            version: WriteVersion::new(1, order, 1),
        }
    }

    #[test]
    fn apply_returns_previous_and_counts() {
        let store = MemoryStore::new();
        let first = store.apply(0, write("a", Some("1"), 1)).unwrap();
        assert_eq!(first.previous, None);
        assert_eq!(first.update_counter, 1);

        let second = store.apply(0, write("a", Some("2"), 2)).unwrap();
        assert_eq!(second.previous.as_deref(), Some(&b"1"[..]));
        assert_eq!(store.get(b"a").as_deref(), Some(&b"2"[..]));
        assert_eq!(store.update_counter(0), 2);
    }

    #[test]
    fn failing_filter_leaves_entry_unchanged() {
        let store = MemoryStore::new();
        store.apply(0, write("a", Some("1"), 1)).unwrap();

        let mut guarded = write("a", Some("2"), 2);
        guarded.filters.push(EntryFilter::NoValue);
        let applied = store.apply(0, guarded).unwrap();

        assert!(applied.filtered);
        assert_eq!(store.get(b"a").as_deref(), Some(&b"1"[..]));
    }

    fn append(
        current: Option<&Value>,
        args: &[Bytes],
    ) -> Result<(Option<Value>, Option<Bytes>), String> {
        let mut next = current.map(|v| v.to_vec()).unwrap_or_default();
        for arg in args {
            next.extend_from_slice(arg);
        }
        let next = Bytes::from(next);
        Ok((Some(next.clone()), Some(next)))
    }

    #[test]
    fn transform_runs_registered_processor() {
        let store = MemoryStore::new();
        store.register_processor("append", Arc::new(append));

        let mut transform = write("a", None, 1);
        transform.operation = Operation::Transform;
        transform.processor = Some(ProcessorRef::new("append"));
        transform.invoke_args = vec![Bytes::from_static(b"xy")];

        let applied = store.apply(0, transform).unwrap();
        assert_eq!(
            applied.invoke,
            Some(InvokeOutcome::Value(Some(Bytes::from_static(b"xy"))))
        );
        assert_eq!(store.get(b"a").as_deref(), Some(&b"xy"[..]));
    }

    #[test]
    fn unknown_processor_is_rejected() {
        let store = MemoryStore::new();
        let mut transform = write("a", None, 1);
        transform.operation = Operation::Transform;
        transform.processor = Some(ProcessorRef::new("missing"));
        assert!(matches!(
            store.apply(0, transform),
            Err(FailureCause::Rejected { .. })
        ));
    }

    #[test]
    fn backup_ignores_older_and_duplicate_versions() {
        let store = MemoryStore::new();
        let entry = |value: &'static str| BackupEntry {
            key: Bytes::from_static(b"a"),
            value: Some(Bytes::from_static(value.as_bytes())),
            ttl: TTL_NOT_CHANGED,
            conflict_expire_time: 0,
            conflict_version: None,
            send_previous: false,
            previous: None,
            update_counter: 1,
        };

        store.apply_backup(0, &entry("new"), WriteVersion::new(1, 5, 1));
        store.apply_backup(0, &entry("old"), WriteVersion::new(1, 4, 1));
        store.apply_backup(0, &entry("dup"), WriteVersion::new(1, 5, 1));

        assert_eq!(store.get(b"a").as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn near_cache_keeps_newest_version() {
        let near = MemoryNearCache::new();
        let key = Bytes::from_static(b"k");
        near.apply_update(&key, Some(Bytes::from_static(b"2")), WriteVersion::new(1, 2, 1), 0);
        near.apply_update(&key, Some(Bytes::from_static(b"1")), WriteVersion::new(1, 1, 1), 0);
        assert_eq!(near.get(b"k").as_deref(), Some(&b"2"[..]));

        near.apply_update(&key, None, WriteVersion::new(1, 3, 1), 0);
        assert_eq!(near.get(b"k"), None);
    }
}
