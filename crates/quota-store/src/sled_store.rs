//! Sled-backed store

use crate::error::Result;
use crate::{decode, encode, UsageStore};
use async_trait::async_trait;
use quota_types::UserRecord;
use std::path::Path;
use tracing::debug;

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened usage database");
        Ok(Self { db })
    }
}

#[async_trait]
impl UsageStore for SledStore {
    async fn load(&self, username: &str) -> Result<Option<UserRecord>> {
        match self.db.get(username)? {
            Some(data) => Ok(Some(decode(username, &data)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &UserRecord) -> Result<()> {
        let serialized = encode(record)?;
        self.db.insert(record.username.as_bytes(), serialized)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn remove(&self, username: &str) -> Result<bool> {
        let old = self.db.remove(username)?;
        self.db.flush_async().await?;
        Ok(old.is_some())
    }

    async fn list_usernames(&self) -> Result<Vec<String>> {
        let keys = self
            .db
            .iter()
            .keys()
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|k| String::from_utf8(k.to_vec()).ok())
            .collect();

        Ok(keys)
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
