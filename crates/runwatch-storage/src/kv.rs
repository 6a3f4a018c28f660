use crate::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// Durable string blob store. Entries may disappear at any time (capacity
/// eviction), and the store cannot enumerate its own keys.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// Reads and decodes a JSON blob. A blob that no longer decodes is treated
/// as absent; only backend failures surface as errors.
pub fn read_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            debug!(event = "corrupt_entry", key = key, error = %err);
            Ok(None)
        }
    }
}

pub fn write_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    store.set(key, &raw)
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

/// In-process store. With a capacity, the least recently written entry is
/// evicted once the limit is exceeded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::default(),
            capacity: Some(capacity.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(state.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        if state
            .entries
            .insert(key.to_string(), value.to_string())
            .is_some()
        {
            state.order.retain(|existing| existing != key);
        }
        state.order.push_back(key.to_string());

        if let Some(capacity) = self.capacity {
            while state.entries.len() > capacity {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                state.entries.remove(&oldest);
            }
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        if state.entries.remove(key).is_some() {
            state.order.retain(|existing| existing != key);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        state.entries.clear();
        state.order.clear();
        Ok(())
    }
}
