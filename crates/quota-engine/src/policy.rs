//! Expiry and quota enforcement

use crate::error::Result;
use crate::metrics::UsageMetrics;
use crate::registry::UserRegistry;
use crate::retry::RetryPolicy;
use quota_accounts::{AccountError, AccountManager};
use quota_types::{Timestamp, UserRecord};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the enforcer must do to bring a record in line with policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    NoChange,
    Lock,
    Unlock,
}

/// Compare the record's lock flag with what policy requires at `now`
pub fn evaluate(record: &UserRecord, now: Timestamp) -> LockDecision {
    match (record.locked, record.should_be_locked(now)) {
        (false, true) => LockDecision::Lock,
        (true, false) => LockDecision::Unlock,
        _ => LockDecision::NoChange,
    }
}

/// Applies [`LockDecision`]s: OS account first, registry flag after
pub struct PolicyEnforcer {
    registry: Arc<UserRegistry>,
    accounts: Arc<dyn AccountManager>,
    retry: RetryPolicy,
    metrics: UsageMetrics,
}

impl PolicyEnforcer {
    pub fn new(
        registry: Arc<UserRegistry>,
        accounts: Arc<dyn AccountManager>,
        retry: RetryPolicy,
        metrics: UsageMetrics,
    ) -> Self {
        Self {
            registry,
            accounts,
            retry,
            metrics,
        }
    }

    /// Evaluate `record` and carry out the decision.
    ///
    /// On a failed OS call the registry flag is left as it was, so the next
    /// tick reaches the same decision and tries again. If the registry copy
    /// changed while the OS call was in flight (a PATCH raising the quota,
    /// say) and no longer agrees with the new lock state, the opposite call
    /// is made straight away and `NoChange` is returned.
    pub async fn enforce(&self, record: &UserRecord, now: Timestamp) -> Result<LockDecision> {
        let decision = evaluate(record, now);
        let locked = match decision {
            LockDecision::NoChange => return Ok(decision),
            LockDecision::Lock => true,
            LockDecision::Unlock => false,
        };

        let username = record.username.as_str();
        self.apply(username, locked).await?;
        if locked {
            info!(
                user = username,
                expired = record.is_expired(now),
                over_quota = record.is_over_quota(),
                total_usage = record.total_usage,
                "locked account"
            );
        } else {
            info!(user = username, "unlocked account");
        }

        let current = self.registry.get(username)?;
        if current.should_be_locked(now) != locked {
            warn!(user = username, locked, "record changed during lock call, reverting");
            self.apply(username, !locked).await?;
            return Ok(LockDecision::NoChange);
        }
        Ok(decision)
    }

    /// OS call first, registry flag only once it succeeded
    async fn apply(&self, username: &str, locked: bool) -> Result<()> {
        self.retry
            .run(
                "set_locked",
                || self.accounts.set_locked(username, locked),
                AccountError::is_transient,
            )
            .await?;
        self.registry.set_locked(username, locked)?;
        self.metrics.record_lock_transition(locked);
        Ok(())
    }

    /// Enforce against the registry's current copy of `username`
    pub async fn enforce_user(&self, username: &str, now: Timestamp) -> Result<LockDecision> {
        let record = self.registry.get(username)?;
        let decision = self.enforce(&record, now).await?;
        debug!(user = username, ?decision, "enforced policy");
        Ok(decision)
    }
}
