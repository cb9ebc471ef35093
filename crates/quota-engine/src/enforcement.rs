//! Periodic persistence and policy pass

use crate::error::{EngineError, Result};
use crate::metrics::UsageMetrics;
use crate::policy::{LockDecision, PolicyEnforcer};
use crate::registry::UserRegistry;
use crate::retry::RetryPolicy;
use quota_store::UsageStore;
use quota_types::{now_timestamp, Timestamp};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counts from one enforcement tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub persisted: usize,
    pub persist_failures: usize,
    pub locked: usize,
    pub unlocked: usize,
    pub enforce_failures: usize,
}

pub struct EnforcementLoop {
    registry: Arc<UserRegistry>,
    store: Arc<dyn UsageStore>,
    enforcer: Arc<PolicyEnforcer>,
    lifecycle: Arc<Mutex<()>>,
    interval: Duration,
    retry: RetryPolicy,
    metrics: UsageMetrics,
}

impl EnforcementLoop {
    pub fn new(
        registry: Arc<UserRegistry>,
        store: Arc<dyn UsageStore>,
        enforcer: Arc<PolicyEnforcer>,
        lifecycle: Arc<Mutex<()>>,
        interval: Duration,
        retry: RetryPolicy,
        metrics: UsageMetrics,
    ) -> Self {
        Self {
            registry,
            store,
            enforcer,
            lifecycle,
            interval,
            retry,
            metrics,
        }
    }

    /// Tick every interval until cancelled, then persist once more.
    ///
    /// Returns early only on a structural store failure.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;
        info!(interval_secs = self.interval.as_secs(), "enforcement loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(now_timestamp()).await?;
                }
            }
        }

        let (persisted, failures) = self.persist_all().await?;
        self.store.flush().await?;
        info!(persisted, failures, "final persistence pass complete");
        Ok(())
    }

    /// Persist every record, then apply policy to every user
    pub async fn tick(&self, now: Timestamp) -> Result<TickReport> {
        let started = Instant::now();
        let result = self.tick_inner(now).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .enforcement_tick_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());
        self.metrics.tracked_users.set(self.registry.len() as i64);
        result
    }

    async fn tick_inner(&self, now: Timestamp) -> Result<TickReport> {
        let mut report = TickReport::default();
        let (persisted, persist_failures) = self.persist_all().await?;
        report.persisted = persisted;
        report.persist_failures = persist_failures;

        for username in self.registry.usernames() {
            match self.enforcer.enforce_user(&username, now).await {
                Ok(LockDecision::Lock) => report.locked += 1,
                Ok(LockDecision::Unlock) => report.unlocked += 1,
                Ok(LockDecision::NoChange) => {}
                Err(EngineError::UserNotFound(_)) => {
                    debug!(user = %username, "user removed during tick");
                }
                Err(e) => {
                    warn!(user = %username, error = %e, "failed to apply lock policy");
                    self.metrics.record_enforcement_failure("lock");
                    report.enforce_failures += 1;
                }
            }
        }

        if report.locked + report.unlocked + report.persist_failures + report.enforce_failures > 0 {
            info!(?report, "enforcement tick complete");
        } else {
            debug!(?report, "enforcement tick complete");
        }
        Ok(report)
    }

    /// Save a snapshot of every record, returning (saved, failed).
    ///
    /// Each pass holds the lifecycle lock so a concurrent delete cannot be
    /// undone by a stale snapshot. The first write failure ends the pass; the
    /// records not yet saved are retried after a backoff with the lock
    /// released, so an unavailable store costs one backoff schedule per tick
    /// rather than one per record. Only a structural store error is returned.
    pub async fn persist_all(&self) -> Result<(usize, usize)> {
        let mut saved = 0;
        let mut pending: Option<HashSet<String>> = None;
        let mut attempt = 1;

        loop {
            let (pass_saved, unsaved) = self.persist_pass(pending.as_ref()).await?;
            saved += pass_saved;
            if unsaved.is_empty() {
                return Ok((saved, 0));
            }

            if attempt >= self.retry.max_attempts() {
                warn!(
                    unsaved = unsaved.len(),
                    attempt,
                    "store unavailable, records stay unsaved until the next tick"
                );
                for _ in &unsaved {
                    self.metrics.record_enforcement_failure("persist");
                }
                return Ok((saved, unsaved.len()));
            }

            let delay = self.retry.backoff(attempt);
            debug!(
                unsaved = unsaved.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "store write failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            pending = Some(unsaved);
        }
    }

    /// One write attempt per record, limited to `only` when given.
    ///
    /// Returns the number saved and the usernames left unsaved.
    async fn persist_pass(&self, only: Option<&HashSet<String>>) -> Result<(usize, HashSet<String>)> {
        let _guard = self.lifecycle.lock().await;
        let mut records = self.registry.snapshot();
        if let Some(only) = only {
            // users deleted since the last pass drop out here
            records.retain(|record| only.contains(&record.username));
        }

        let mut saved = 0;
        let mut unsaved = HashSet::new();
        for record in records {
            if !unsaved.is_empty() {
                unsaved.insert(record.username);
                continue;
            }
            match self.store.save(&record).await {
                Ok(()) => saved += 1,
                Err(e) if e.is_structural() => {
                    error!(user = %record.username, error = %e, "store is corrupted");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(user = %record.username, error = %e, "failed to persist usage, skipping rest of pass");
                    unsaved.insert(record.username);
                }
            }
        }
        Ok((saved, unsaved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quota_accounts::MockAccounts;
    use quota_store::MemoryStore;
    use quota_types::UserRecord;

    struct Fixture {
        registry: Arc<UserRegistry>,
        store: Arc<MemoryStore>,
        accounts: Arc<MockAccounts>,
        tick: EnforcementLoop,
    }

    fn fixture(records: Vec<UserRecord>) -> Fixture {
        fixture_with_retry(records, RetryPolicy::none())
    }

    fn fixture_with_retry(records: Vec<UserRecord>, retry: RetryPolicy) -> Fixture {
        let accounts = Arc::new(MockAccounts::new());
        for record in &records {
            accounts.insert(&record.username, record.locked);
        }
        let registry = Arc::new(UserRegistry::from_records(records));
        let store = Arc::new(MemoryStore::new());
        let metrics = UsageMetrics::new().unwrap();
        let enforcer = Arc::new(PolicyEnforcer::new(
            registry.clone(),
            accounts.clone(),
            RetryPolicy::none(),
            metrics.clone(),
        ));
        let tick = EnforcementLoop::new(
            registry.clone(),
            store.clone(),
            enforcer,
            Arc::new(Mutex::new(())),
            Duration::from_secs(30),
            retry,
            metrics,
        );
        Fixture {
            registry,
            store,
            accounts,
            tick,
        }
    }

    fn record(name: &str, total: u64, allowed: u64, expires_at: Timestamp) -> UserRecord {
        let mut record = UserRecord::new(name, 0, 30, Some(allowed));
        record.total_usage = total;
        record.expires_at = expires_at;
        record
    }

    #[tokio::test]
    async fn test_tick_persists_then_enforces() {
        let f = fixture(vec![
            record("expired", 0, 100, 500),
            record("heavy", 150, 100, 2000),
            record("fine", 10, 100, 2000),
        ]);

        let report = f.tick.tick(1000).await.unwrap();
        assert_eq!(report.persisted, 3);
        assert_eq!(f.store.save_count(), 3);
        assert_eq!(report.locked, 2);
        assert_eq!(report.unlocked, 0);

        assert!(f.registry.get("expired").unwrap().locked);
        assert!(f.registry.get("heavy").unwrap().locked);
        assert!(!f.registry.get("fine").unwrap().locked);
        assert!(f.accounts.account("heavy").unwrap().locked);

        // persisted before enforcement, so the store still holds the old flag
        let stored = f.store.load("heavy").await.unwrap().unwrap();
        assert_eq!(stored.total_usage, 150);
        assert!(!stored.locked);

        f.tick.tick(1000).await.unwrap();
        assert!(f.store.load("heavy").await.unwrap().unwrap().locked);
    }

    #[tokio::test]
    async fn test_failed_lock_is_retried_next_tick() {
        let f = fixture(vec![record("heavy", 150, 100, 2000)]);
        f.accounts.fail_set_locked(true);

        let report = f.tick.tick(1000).await.unwrap();
        assert_eq!(report.enforce_failures, 1);
        assert!(!f.registry.get("heavy").unwrap().locked);

        f.accounts.fail_set_locked(false);
        let report = f.tick.tick(1000).await.unwrap();
        assert_eq!(report.locked, 1);
        assert!(f.registry.get("heavy").unwrap().locked);
    }

    #[tokio::test]
    async fn test_store_failure_is_counted_not_fatal() {
        let f = fixture(vec![record("alice", 1, 100, 2000)]);
        f.store.set_fail_writes(true);

        let report = f.tick.tick(1000).await.unwrap();
        assert_eq!(report.persisted, 0);
        assert_eq!(report.persist_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_store_costs_one_backoff_schedule_per_tick() {
        let records = (0..100)
            .map(|i| record(&format!("u{}", i), 0, 100, 2000))
            .chain(std::iter::once(record("heavy", 150, 100, 2000)))
            .collect();
        let f = fixture_with_retry(records, RetryPolicy::default());
        f.store.set_fail_writes(true);

        let started = tokio::time::Instant::now();
        let report = f.tick.tick(1000).await.unwrap();

        // 200 ms + 400 ms of backoff with the default policy
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.persisted, 0);
        assert_eq!(report.persist_failures, 101);
        assert_eq!(report.locked, 1);
        assert!(f.registry.get("heavy").unwrap().locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_resumes_when_store_recovers() {
        let f = fixture_with_retry(
            vec![
                record("a", 1, 100, 2000),
                record("b", 2, 100, 2000),
                record("c", 3, 100, 2000),
            ],
            RetryPolicy::default(),
        );
        f.store.set_fail_writes(true);

        let store = f.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.set_fail_writes(false);
        });

        let report = f.tick.tick(1000).await.unwrap();
        assert_eq!(report.persisted, 3);
        assert_eq!(report.persist_failures, 0);
        assert_eq!(f.store.load("b").await.unwrap().unwrap().total_usage, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_persists_on_shutdown() {
        let f = fixture(vec![record("alice", 42, 100, Timestamp::MAX)]);
        let shutdown = CancellationToken::new();
        let tick = Arc::new(f.tick);

        let handle = {
            let tick = tick.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { tick.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        f.registry.add_usage("alice", 8).unwrap();
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(f.store.load("alice").await.unwrap().unwrap().total_usage, 50);
    }
}
