//! Persisted key-value state.
//!
//! `StateStore` is the injectable read/write interface for the little
//! durable state the orchestrator owns. Values are `serde_json::Value`;
//! a key that was never written reads as `None` and callers apply their own
//! default. `FileStore` keeps everything in one JSON object on disk;
//! `MemoryStore` is the in-process substitute for tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{OutpostError, Result};

/// Read/write access to persisted values.
pub trait StateStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Value>>;

    fn write(&self, key: &str, value: Value) -> Result<()>;
}


// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Store backed by a single JSON file. Writes rewrite the whole file
/// through a temporary sibling and a rename.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: &Path) -> Self {
        FileStore {
            path: path.to_path_buf(),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, Value>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| OutpostError::State(format!("read {}: {}", self.path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| OutpostError::State(format!("parse {}: {}", self.path.display(), e)))
    }
}

impl StateStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.load()?.remove(key))
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.load()?;
        data.insert(key.to_string(), value);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| OutpostError::State(format!("create {}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(&data)
            .map_err(|e| OutpostError::State(format!("serialize state: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json + "\n")
            .map_err(|e| OutpostError::State(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| OutpostError::State(format!("rename to {}: {}", self.path.display(), e)))
    }
}


// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .data
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned())
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        self.data
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_store_missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(&dir.path().join("state.json"));
        assert_eq!(store.read("auto_stop.dev").unwrap(), None);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        FileStore::new(&path).write("auto_stop.dev", json!(true)).unwrap();
        FileStore::new(&path).write("auto_stop.prod", json!(false)).unwrap();

        let store = FileStore::new(&path);
        assert_eq!(store.read("auto_stop.dev").unwrap(), Some(json!(true)));
        assert_eq!(store.read("auto_stop.prod").unwrap(), Some(json!(false)));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn file_store_corrupt_file_is_state_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileStore::new(&path).read("x"),
            Err(OutpostError::State(_))
        ));
    }

    #[test]
    fn memory_store_overwrites() {
        let store = MemoryStore::new();
        store.write("k", json!(1)).unwrap();
        store.write("k", json!(2)).unwrap();
        assert_eq!(store.read("k").unwrap(), Some(json!(2)));
        assert_eq!(store.len(), 1);
    }
}
