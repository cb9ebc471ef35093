//! Boot sequence and administrative lifecycle of tracked users

use crate::config::DefaultsConfig;
use crate::enforcement::EnforcementLoop;
use crate::error::{EngineError, Result};
use crate::ingest::IngestLoop;
use crate::metrics::UsageMetrics;
use crate::policy::PolicyEnforcer;
use crate::registry::UserRegistry;
use crate::retry::RetryPolicy;
use quota_accounts::{AccountError, AccountManager};
use quota_store::{StoreError, UsageStore};
use quota_types::{validate_password, validate_username, QuotaPatch, Timestamp, UserRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Owns the registry and coordinates it with the store and the OS accounts.
///
/// Creation, deletion, patching and the enforcement tick's persistence pass
/// serialise on one lifecycle lock. Usage accounting never takes it.
pub struct UsageService {
    registry: Arc<UserRegistry>,
    store: Arc<dyn UsageStore>,
    accounts: Arc<dyn AccountManager>,
    enforcer: Arc<PolicyEnforcer>,
    lifecycle: Arc<Mutex<()>>,
    defaults: DefaultsConfig,
    retry: RetryPolicy,
    metrics: UsageMetrics,
}

impl UsageService {
    pub fn new(
        store: Arc<dyn UsageStore>,
        accounts: Arc<dyn AccountManager>,
        defaults: DefaultsConfig,
        retry: RetryPolicy,
        metrics: UsageMetrics,
    ) -> Self {
        let registry = Arc::new(UserRegistry::new());
        let enforcer = Arc::new(PolicyEnforcer::new(
            registry.clone(),
            accounts.clone(),
            retry.clone(),
            metrics.clone(),
        ));
        Self {
            registry,
            store,
            accounts,
            enforcer,
            lifecycle: Arc::new(Mutex::new(())),
            defaults,
            retry,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<UserRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }

    pub fn metrics(&self) -> &UsageMetrics {
        &self.metrics
    }

    /// Load or create a record for every discovered account.
    ///
    /// Accounts without a stored record get a default one which is saved
    /// before it enters the registry. The lock flag of every record is then
    /// refreshed from the OS. Any store failure here aborts the boot.
    pub async fn bootstrap(&self, usernames: &[String], now: Timestamp) -> Result<usize> {
        let mut created = 0;
        for username in usernames {
            let stored = self
                .retry
                .run("load", || self.store.load(username), |e: &StoreError| {
                    !e.is_structural()
                })
                .await?;

            let mut record = match stored {
                Some(record) => record,
                None => {
                    let record = self.default_record(username, now);
                    self.store.save(&record).await?;
                    created += 1;
                    debug!(user = %username, expires_at = record.expires_at, "created default record");
                    record
                }
            };

            match self.accounts.query_locked(username).await {
                Ok(locked) => {
                    if locked != record.locked {
                        info!(user = %username, locked, "lock state reconciled with system");
                    }
                    record.locked = locked;
                }
                Err(e) => {
                    warn!(user = %username, error = %e, "could not query lock state, keeping stored flag");
                }
            }

            self.registry.put(record);
        }

        let orphaned = self
            .store
            .list_usernames()
            .await?
            .into_iter()
            .filter(|name| !self.registry.contains(name))
            .count();
        if orphaned > 0 {
            warn!(orphaned, "stored records without a tracked account are ignored");
        }

        self.update_gauge();
        info!(
            tracked = self.registry.len(),
            created,
            "registry loaded"
        );
        Ok(self.registry.len())
    }

    fn default_record(&self, username: &str, now: Timestamp) -> UserRecord {
        UserRecord::new(
            username,
            now,
            self.defaults.expiry_days,
            self.defaults.allowed_usage,
        )
    }

    fn update_gauge(&self) {
        self.metrics.tracked_users.set(self.registry.len() as i64);
    }

    pub fn get_user(&self, username: &str) -> Result<UserRecord> {
        self.registry.get(username)
    }

    pub fn list_users(&self) -> Vec<UserRecord> {
        self.registry.snapshot()
    }

    /// Provision an OS account and start tracking it.
    ///
    /// Either the account, the stored record and the registry entry all exist
    /// afterwards, or none of them was created.
    pub async fn create_user(&self, username: &str, password: &str, now: Timestamp) -> Result<UserRecord> {
        validate_username(username)?;
        validate_password(password)?;

        let _guard = self.lifecycle.lock().await;
        if self.registry.contains(username) {
            return Err(EngineError::UserAlreadyExists(username.to_string()));
        }

        let record = self.default_record(username, now);
        let hash = self.accounts.hash_password(password).await?;
        match self
            .accounts
            .create_account(username, &hash, record.expires_at)
            .await
        {
            Ok(()) => {}
            Err(AccountError::AlreadyExists(_)) => {
                return Err(EngineError::UserAlreadyExists(username.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.store.save(&record).await {
            error!(user = %username, error = %e, "failed to persist new user, removing account");
            if let Err(rollback) = self.accounts.delete_account(username).await {
                error!(user = %username, error = %rollback, "rollback of account creation failed");
            }
            return Err(e.into());
        }

        self.registry.insert_new(record.clone())?;
        self.update_gauge();
        info!(user = %username, expires_at = record.expires_at, "user created");
        Ok(record)
    }

    /// Apply administrative changes to a tracked user
    pub async fn patch_user(&self, username: &str, patch: &QuotaPatch) -> Result<UserRecord> {
        let _guard = self.lifecycle.lock().await;
        let current = self.registry.get(username)?;
        if patch.is_empty() {
            return Ok(current);
        }

        if let Some(expires_at) = patch.expires_at {
            self.retry
                .run(
                    "set_expiry",
                    || self.accounts.set_expiry(username, expires_at),
                    AccountError::is_transient,
                )
                .await?;
        }

        let record = self.registry.patch_quota(username, patch)?;
        match self.store.save(&record).await {
            Ok(()) => {}
            Err(e) if e.is_structural() => return Err(e.into()),
            Err(e) => {
                warn!(user = %username, error = %e, "patched record not persisted, next tick will retry");
            }
        }

        info!(
            user = %username,
            allowed_usage = record.allowed_usage,
            quota_enabled = record.quota_enabled,
            expires_at = record.expires_at,
            total_usage = record.total_usage,
            remaining_usage = ?record.remaining_usage(),
            "user updated"
        );
        Ok(record)
    }

    /// Remove the OS account, the stored record and the registry entry.
    ///
    /// An unknown user touches nothing. If the account removal fails, the
    /// stored record is written back and the user stays tracked.
    pub async fn delete_user(&self, username: &str) -> Result<UserRecord> {
        let _guard = self.lifecycle.lock().await;
        let record = self.registry.get(username)?;

        let was_stored = self.store.remove(username).await?;

        match self.accounts.delete_account(username).await {
            Ok(()) => {}
            Err(AccountError::NotFound(_)) => {
                warn!(user = %username, "system account already gone");
            }
            Err(e) => {
                if was_stored {
                    if let Err(restore) = self.store.save(&record).await {
                        error!(user = %username, error = %restore, "failed to restore stored record");
                    }
                }
                return Err(e.into());
            }
        }

        let removed = self.registry.delete(username)?;
        self.update_gauge();
        info!(user = %username, total_usage = removed.total_usage, "user deleted");
        Ok(removed)
    }

    pub async fn restart_proxy(&self) -> Result<()> {
        self.accounts.restart_proxy_service().await?;
        info!("proxy service restarted");
        Ok(())
    }

    pub fn ingest_loop(&self) -> IngestLoop {
        IngestLoop::new(self.registry.clone(), self.metrics.clone())
    }

    pub fn enforcement_loop(&self, interval: Duration) -> EnforcementLoop {
        EnforcementLoop::new(
            self.registry.clone(),
            self.store.clone(),
            self.enforcer.clone(),
            self.lifecycle.clone(),
            interval,
            self.retry.clone(),
            self.metrics.clone(),
        )
    }
}
