//! Persistence adapter for usage records
//!
//! One key per username, one JSON document per key. Each call is a single
//! durable operation against the backend; there is no cross-key transaction.

pub mod config;
pub mod error;
pub mod memory;
pub mod sled_store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use quota_types::UserRecord;
use std::sync::Arc;

/// Key-value persistence of [`UserRecord`]s keyed by username
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Load the saved record for `username`, `None` if nothing was saved
    async fn load(&self, username: &str) -> Result<Option<UserRecord>>;

    /// Durably write `record`, replacing any previous value
    async fn save(&self, record: &UserRecord) -> Result<()>;

    /// Remove the record; returns whether a value was present
    async fn remove(&self, username: &str) -> Result<bool>;

    /// Usernames with a saved record
    async fn list_usernames(&self) -> Result<Vec<String>>;

    /// Flush buffered writes to stable storage
    async fn flush(&self) -> Result<()>;
}

/// Open the backend selected by `config`
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn UsageStore>> {
    match config {
        StoreConfig::Sled { path } => Ok(Arc::new(SledStore::open(path)?)),
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

pub(crate) fn encode(record: &UserRecord) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(StoreError::from)
}

pub(crate) fn decode(username: &str, bytes: &[u8]) -> Result<UserRecord> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupted {
        key: username.to_string(),
        details: e.to_string(),
    })
}
