//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{KeyValueStore, StorageError, lock};
use crate::observer::SessionObserver;

/// Process-local storage. Shared through an `Arc`, it behaves like one
/// browser storage area seen by several clients.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    observer: Option<SessionObserver>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a [`StorageEvent`](crate::observer::StorageEvent) for every
    /// mutation that changes a value.
    pub fn with_observer(observer: SessionObserver) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            observer: Some(observer),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    fn notify(&self, key: &str, old: Option<String>, new: Option<String>) {
        if old == new {
            return;
        }
        if let Some(observer) = &self.observer {
            observer.emit_storage(key, old, new);
        }
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old = lock(&self.entries).insert(key.to_string(), value.to_string());
        self.notify(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let old = lock(&self.entries).remove(key);
        self.notify(key, old, None);
        Ok(())
    }
}
