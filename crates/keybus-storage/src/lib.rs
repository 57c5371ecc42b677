// Storage backend contract for the broker plus the in-memory driver.
use std::collections::HashMap;

pub mod memory;
pub use memory::MemoryBackend;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("key not found")]
    NotFound,
    #[error("storage lock poisoned")]
    Poisoned,
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Flat string-to-string key space the broker reads and writes through.
///
/// Implementations must be safe for concurrent callers; the broker
/// serializes its own calls but makes no promise for other users of the
/// same backend. `get` reports a missing key as [`StorageError::NotFound`];
/// the bulk read instead maps missing entries to an empty string.
pub trait Backend: Send + Sync {
    fn get(&self, key: &str) -> Result<String>;

    /// Read several keys at once; entries that do not exist come back as `""`.
    fn get_bulk(&self, keys: &[String]) -> Result<HashMap<String, String>>;

    /// All key/value pairs whose key starts with `prefix`.
    fn get_prefix(&self, prefix: &str) -> Result<HashMap<String, String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Write every entry; implementations should apply all-or-nothing
    /// where their medium allows it.
    fn set_bulk(&self, entries: &HashMap<String, String>) -> Result<()>;

    /// Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
