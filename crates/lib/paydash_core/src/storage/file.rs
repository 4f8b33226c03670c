//! JSON-file storage backend.
//!
//! The whole session lives in one small JSON object on disk. Every write
//! rewrites the document through a sibling temp file and a rename, so a
//! concurrent reader sees either the old or the new document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::{KeyValueStore, StorageError, lock};
use crate::observer::SessionObserver;

/// File-backed storage shared by every client pointed at the same path.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
    observer: Option<SessionObserver>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: SessionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// `<data_dir>/paydash/session.json`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("paydash")
            .join("session.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_document(&self, document: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(document)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), keys = document.len(), "session file written");
        Ok(())
    }

    fn mutate(&self, key: &str, value: Option<&str>) -> Result<(), StorageError> {
        let old = {
            let _guard = lock(&self.write_lock);
            let mut document = self.read_document()?;
            let old = match value {
                Some(v) => document.insert(key.to_string(), v.to_string()),
                None => document.remove(key),
            };
            if old.as_deref() == value {
                return Ok(());
            }
            self.write_document(&document)?;
            old
        };
        if let Some(observer) = &self.observer {
            observer.emit_storage(key, old, value.map(str::to_string));
        }
        Ok(())
    }
}

impl KeyValueStore for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        match self.read_document() {
            Ok(mut document) => document.remove(key),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable session file");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.mutate(key, Some(value))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.mutate(key, None)
    }
}
