//! Task result cache.
//!
//! Maps `(document identity, task identity, config fingerprint)` to a
//! consolidated `TaskResult`, so re-running a task over unmodified documents
//! never re-invokes the engine. The backing store is injectable: the cache
//! is an explicit object owned by the pipeline, never process-global state.
//!
//! Entries are pure functions of their key, so concurrent writers resolve
//! last-writer-wins: duplicate computation is wasteful, not incorrect.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use crate::doc::TaskResult;

// ---------------------------------------------------------------------------
// Store trait + default in-memory backend
// ---------------------------------------------------------------------------

/// Storage backend for the task cache.
///
/// Must support safe concurrent reads; writes are last-writer-wins.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<TaskResult>;
    fn put(&self, key: String, value: TaskResult);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for dyn CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn CacheStore").field("len", &self.len()).finish_non_exhaustive()
    }
}

/// Default in-memory store.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, TaskResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Option<TaskResult> {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .get(key)
            .cloned()
    }

    fn put(&self, key: String, value: TaskResult) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(key, value);
    }

    fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// TaskCache
// ---------------------------------------------------------------------------

/// Cache of consolidated task results, keyed by document identity, task
/// identifier and task config fingerprint.
#[derive(Debug)]
pub struct TaskCache {
    store: Box<dyn CacheStore>,
}

impl TaskCache {
    pub fn new(store: Box<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Cache backed by the default in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    fn key(identity: Uuid, task_id: &str, fingerprint: &str) -> String {
        format!("{identity}/{task_id}/{fingerprint}")
    }

    pub fn get(&self, identity: Uuid, task_id: &str, fingerprint: &str) -> Option<TaskResult> {
        self.store.get(&Self::key(identity, task_id, fingerprint))
    }

    pub fn put(&self, identity: Uuid, task_id: &str, fingerprint: &str, value: TaskResult) {
        self.store.put(Self::key(identity, task_id, fingerprint), value);
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
