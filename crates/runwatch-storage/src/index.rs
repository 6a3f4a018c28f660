use crate::keys::index_key;
use crate::kv::{read_json, write_json, KvStore};
use crate::StorageError;
use std::sync::Arc;

/// Ordered key sets per logical prefix, persisted next to the entries they
/// describe. The index is a hint: a listed key may already be gone from the
/// store, and readers must treat that as absent.
#[derive(Clone)]
pub struct KeyIndex {
    store: Arc<dyn KvStore>,
}

impl KeyIndex {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Appends `key` under `prefix`. Returns `false` if it was already listed.
    pub fn add(&self, prefix: &str, key: &str) -> Result<bool, StorageError> {
        let mut keys = self.list_keys(prefix)?;
        if keys.iter().any(|existing| existing == key) {
            return Ok(false);
        }
        keys.push(key.to_string());
        write_json(self.store.as_ref(), &index_key(prefix), &keys)?;
        Ok(true)
    }

    pub fn remove(&self, prefix: &str, key: &str) -> Result<bool, StorageError> {
        let mut keys = self.list_keys(prefix)?;
        let before = keys.len();
        keys.retain(|existing| existing != key);
        if keys.len() == before {
            return Ok(false);
        }
        if keys.is_empty() {
            self.store.remove(&index_key(prefix))?;
        } else {
            write_json(self.store.as_ref(), &index_key(prefix), &keys)?;
        }
        Ok(true)
    }

    /// Keys in insertion order. A missing or unreadable index is empty.
    pub fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let keys: Vec<String> =
            read_json(self.store.as_ref(), &index_key(prefix))?.unwrap_or_default();
        let mut seen = std::collections::HashSet::new();
        Ok(keys
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect())
    }
}
