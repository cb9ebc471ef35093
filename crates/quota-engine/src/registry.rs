//! In-memory table of tracked users
//!
//! Sharded reader-writer map: readers of different shards never contend, and
//! each mutation holds the write guard of its record's shard for exactly the
//! duration of that one change. Guards never escape this module.

use crate::error::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quota_types::{QuotaPatch, UserRecord};

#[derive(Default)]
pub struct UserRegistry {
    users: DashMap<String, UserRecord>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I: IntoIterator<Item = UserRecord>>(records: I) -> Self {
        let registry = Self::new();
        for record in records {
            registry.put(record);
        }
        registry
    }

    pub fn get(&self, username: &str) -> Result<UserRecord> {
        self.users
            .get(username)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::UserNotFound(username.to_string()))
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Create or fully replace, returning the previous record
    pub fn put(&self, record: UserRecord) -> Option<UserRecord> {
        self.users.insert(record.username.clone(), record)
    }

    /// Create only; an existing username is an error
    pub fn insert_new(&self, record: UserRecord) -> Result<()> {
        match self.users.entry(record.username.clone()) {
            Entry::Occupied(_) => Err(EngineError::UserAlreadyExists(record.username)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Add `delta` bytes to a known user, returning the new total.
    ///
    /// Never creates a record. The counter saturates instead of wrapping.
    pub fn add_usage(&self, username: &str, delta: u64) -> Result<u64> {
        let mut entry = self
            .users
            .get_mut(username)
            .ok_or_else(|| EngineError::UserNotFound(username.to_string()))?;
        entry.total_usage = entry.total_usage.saturating_add(delta);
        Ok(entry.total_usage)
    }

    pub fn set_locked(&self, username: &str, locked: bool) -> Result<()> {
        let mut entry = self
            .users
            .get_mut(username)
            .ok_or_else(|| EngineError::UserNotFound(username.to_string()))?;
        entry.locked = locked;
        Ok(())
    }

    /// Apply the supplied administrative fields, returning the updated record
    pub fn patch_quota(&self, username: &str, patch: &QuotaPatch) -> Result<UserRecord> {
        let mut entry = self
            .users
            .get_mut(username)
            .ok_or_else(|| EngineError::UserNotFound(username.to_string()))?;
        entry.apply_patch(patch);
        Ok(entry.clone())
    }

    pub fn delete(&self, username: &str) -> Result<UserRecord> {
        self.users
            .remove(username)
            .map(|(_, record)| record)
            .ok_or_else(|| EngineError::UserNotFound(username.to_string()))
    }

    /// Copy of every record, each read under its shard's read lock
    pub fn snapshot(&self) -> Vec<UserRecord> {
        self.users
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.users.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
