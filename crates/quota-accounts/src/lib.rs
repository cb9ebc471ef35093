//! Account management for tracked proxy users
//!
//! The engine only sees the [`AccountManager`] trait. [`SystemAccounts`]
//! implements it by running the usual shadow-utils tools.

pub mod config;
pub mod discovery;
pub mod error;
pub mod system;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use config::AccountsConfig;
pub use discovery::{discover_accounts, ensure_group, parse_passwd, PasswdEntry};
pub use error::{AccountError, Result};
pub use system::{check_proxy_version, SystemAccounts};

#[cfg(any(test, feature = "testing"))]
pub use mock::MockAccounts;

use async_trait::async_trait;
use quota_types::Timestamp;

/// Lifecycle and lock control of the OS accounts behind proxy users
#[async_trait]
pub trait AccountManager: Send + Sync {
    /// Produce a crypt(3) hash suitable for [`AccountManager::create_account`]
    async fn hash_password(&self, password: &str) -> Result<String>;

    /// Fails with [`AccountError::AlreadyExists`] if the account is present
    async fn create_account(
        &self,
        username: &str,
        password_hash: &str,
        expires_at: Timestamp,
    ) -> Result<()>;

    /// Fails with [`AccountError::NotFound`] if there is no such account
    async fn delete_account(&self, username: &str) -> Result<()>;

    async fn set_locked(&self, username: &str, locked: bool) -> Result<()>;

    async fn query_locked(&self, username: &str) -> Result<bool>;

    /// Move the OS-level account expiry so it never precedes `expires_at`
    async fn set_expiry(&self, username: &str, expires_at: Timestamp) -> Result<()>;

    async fn restart_proxy_service(&self) -> Result<()>;
}
