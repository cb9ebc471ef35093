//! In-process account manager for tests

use crate::error::{AccountError, Result};
use crate::AccountManager;
use async_trait::async_trait;
use quota_types::Timestamp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockAccount {
    pub password_hash: String,
    pub expires_at: Timestamp,
    pub locked: bool,
}

/// Records every call and keeps account state in a map.
///
/// Individual operations can be made to fail to exercise error paths.
#[derive(Default)]
pub struct MockAccounts {
    accounts: Mutex<HashMap<String, MockAccount>>,
    calls: Mutex<Vec<String>>,
    fail_set_locked: AtomicBool,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    fail_query: AtomicBool,
    restarts: AtomicUsize,
}

impl MockAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing account
    pub fn with_account(self, username: &str, locked: bool) -> Self {
        self.insert(username, locked);
        self
    }

    pub fn insert(&self, username: &str, locked: bool) {
        self.accounts.lock().unwrap().insert(
            username.to_string(),
            MockAccount {
                password_hash: String::new(),
                expires_at: Timestamp::MAX,
                locked,
            },
        );
    }

    pub fn account(&self, username: &str) -> Option<MockAccount> {
        self.accounts.lock().unwrap().get(username).cloned()
    }

    pub fn exists(&self, username: &str) -> bool {
        self.accounts.lock().unwrap().contains_key(username)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn fail_set_locked(&self, fail: bool) {
        self.fail_set_locked.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_query(&self, fail: bool) {
        self.fail_query.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn injected(command: &str) -> AccountError {
        AccountError::command_failed(command, Some(1), "injected failure")
    }
}

#[async_trait]
impl AccountManager for MockAccounts {
    async fn hash_password(&self, password: &str) -> Result<String> {
        self.record("hash_password".to_string());
        Ok(format!("$6$mock${}", password.len()))
    }

    async fn create_account(&self, username: &str, password_hash: &str, expires_at: Timestamp) -> Result<()> {
        self.record(format!("create_account {}", username));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::injected("useradd"));
        }
        let mut accounts = self.accounts.lock().unwrap();
        if accounts.contains_key(username) {
            return Err(AccountError::AlreadyExists(username.to_string()));
        }
        accounts.insert(
            username.to_string(),
            MockAccount {
                password_hash: password_hash.to_string(),
                expires_at,
                locked: false,
            },
        );
        Ok(())
    }

    async fn delete_account(&self, username: &str) -> Result<()> {
        self.record(format!("delete_account {}", username));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Self::injected("userdel"));
        }
        self.accounts
            .lock()
            .unwrap()
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| AccountError::NotFound(username.to_string()))
    }

    async fn set_locked(&self, username: &str, locked: bool) -> Result<()> {
        self.record(format!("set_locked {} {}", username, locked));
        if self.fail_set_locked.load(Ordering::SeqCst) {
            return Err(Self::injected("usermod"));
        }
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(username)
            .ok_or_else(|| Self::injected("usermod"))?;
        account.locked = locked;
        Ok(())
    }

    async fn query_locked(&self, username: &str) -> Result<bool> {
        self.record(format!("query_locked {}", username));
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(Self::injected("passwd"));
        }
        self.accounts
            .lock()
            .unwrap()
            .get(username)
            .map(|a| a.locked)
            .ok_or_else(|| Self::injected("passwd"))
    }

    async fn set_expiry(&self, username: &str, expires_at: Timestamp) -> Result<()> {
        self.record(format!("set_expiry {} {}", username, expires_at));
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(username)
            .ok_or_else(|| Self::injected("chage"))?;
        account.expires_at = expires_at;
        Ok(())
    }

    async fn restart_proxy_service(&self) -> Result<()> {
        self.record("restart_proxy_service".to_string());
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
