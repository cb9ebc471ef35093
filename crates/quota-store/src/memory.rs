//! In-memory store (for testing)

use crate::error::{Result, StoreError};
use crate::UsageStore;
use async_trait::async_trait;
use quota_types::UserRecord;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, UserRecord>>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save`/`remove` fail with an unavailable error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn load(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self.data.read().await.get(username).cloned())
    }

    async fn save(&self, record: &UserRecord) -> Result<()> {
        self.check_writable()?;
        self.data
            .write()
            .await
            .insert(record.username.clone(), record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, username: &str) -> Result<bool> {
        self.check_writable()?;
        Ok(self.data.write().await.remove(username).is_some())
    }

    async fn list_usernames(&self) -> Result<Vec<String>> {
        Ok(self.data.read().await.keys().cloned().collect())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
