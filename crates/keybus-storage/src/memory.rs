use crate::{Backend, Result, StorageError};
use std::collections::HashMap;
use std::sync::RwLock;

/// Hash-map driver for tests and single-process deployments.
///
/// ```
/// use keybus_storage::{Backend, MemoryBackend};
///
/// let backend = MemoryBackend::new();
/// backend.set("k", "v").expect("set");
/// assert_eq!(backend.get("k").expect("get"), "v");
/// ```
#[derive(Debug, Default)]
pub struct MemoryBackend {
    // RwLock so concurrent readers never serialize against each other.
    data: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl From<MemoryBackend> for Box<dyn Backend> {
    fn from(value: MemoryBackend) -> Self {
        Box::new(value)
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<String> {
        let guard = self.data.read().map_err(|_| StorageError::Poisoned)?;
        guard.get(key).cloned().ok_or(StorageError::NotFound)
    }

    fn get_bulk(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let guard = self.data.read().map_err(|_| StorageError::Poisoned)?;
        // Missing entries map to "" instead of erroring out.
        Ok(keys
            .iter()
            .map(|key| (key.clone(), guard.get(key).cloned().unwrap_or_default()))
            .collect())
    }

    fn get_prefix(&self, prefix: &str) -> Result<HashMap<String, String>> {
        let guard = self.data.read().map_err(|_| StorageError::Poisoned)?;
        Ok(guard
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = self.data.write().map_err(|_| StorageError::Poisoned)?;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_bulk(&self, entries: &HashMap<String, String>) -> Result<()> {
        // Single write lock makes the batch atomic for in-process readers.
        let mut guard = self.data.write().map_err(|_| StorageError::Poisoned)?;
        for (key, value) in entries {
            guard.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.data.write().map_err(|_| StorageError::Poisoned)?;
        guard.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let guard = self.data.read().map_err(|_| StorageError::Poisoned)?;
        let mut keys: Vec<String> = guard
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
