use quota_accounts::MockAccounts;
use quota_engine::{
    DefaultsConfig, EngineError, RetryPolicy, UsageMetrics, UsageService,
};
use quota_store::{MemoryStore, SledStore, UsageStore};
use quota_types::UserRecord;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const NOW: i64 = 1_700_000_000;

fn service_with(
    accounts: Arc<MockAccounts>,
    store: Arc<dyn UsageStore>,
) -> Result<UsageService, Box<dyn std::error::Error>> {
    Ok(UsageService::new(
        store,
        accounts,
        DefaultsConfig {
            expiry_days: 30,
            allowed_usage: None,
        },
        RetryPolicy::none(),
        UsageMetrics::new()?,
    ))
}

#[tokio::test]
async fn test_bootstrap_loads_synthesizes_and_reconciles() -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Arc::new(
        MockAccounts::new()
            .with_account("alice", true)
            .with_account("bob", false),
    );
    let store = Arc::new(MemoryStore::new());

    let mut stored = UserRecord::new("alice", NOW - 100, 30, Some(5000));
    stored.total_usage = 1234;
    store.save(&stored).await?;

    let service = service_with(accounts, store.clone())?;
    let tracked = service
        .bootstrap(&["alice".to_string(), "bob".to_string()], NOW)
        .await?;
    assert_eq!(tracked, 2);

    let alice = service.get_user("alice")?;
    assert_eq!(alice.total_usage, 1234);
    assert_eq!(alice.allowed_usage, 5000);
    // stored flag was false, the OS says locked
    assert!(alice.locked);

    let bob = service.get_user("bob")?;
    assert_eq!(bob.total_usage, 0);
    assert_eq!(bob.expires_at, NOW + 30 * 86_400);
    assert!(!bob.quota_enabled);
    assert_eq!(store.load("bob").await?, Some(bob));

    Ok(())
}

#[tokio::test]
async fn test_bootstrap_survives_lock_query_failure() -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Arc::new(MockAccounts::new().with_account("alice", true));
    accounts.fail_query(true);
    let service = service_with(accounts, Arc::new(MemoryStore::new()))?;

    service.bootstrap(&["alice".to_string()], NOW).await?;
    assert!(!service.get_user("alice")?.locked);
    Ok(())
}

#[tokio::test]
async fn test_create_and_delete_user() -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Arc::new(MockAccounts::new());
    let store = Arc::new(MemoryStore::new());
    let service = service_with(accounts.clone(), store.clone())?;

    let record = service.create_user("carol", "s3cret", NOW).await?;
    assert_eq!(record.total_usage, 0);
    assert!(accounts.exists("carol"));
    assert_eq!(accounts.account("carol").unwrap().expires_at, record.expires_at);
    assert_eq!(store.load("carol").await?, Some(record.clone()));

    let err = service.create_user("carol", "again", NOW).await.unwrap_err();
    assert!(matches!(err, EngineError::UserAlreadyExists(_)));

    let removed = service.delete_user("carol").await?;
    assert_eq!(removed, record);
    assert!(!accounts.exists("carol"));
    assert_eq!(store.load("carol").await?, None);
    assert!(service.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_create_existing_system_account_conflicts() -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Arc::new(MockAccounts::new().with_account("dave", false));
    let store = Arc::new(MemoryStore::new());
    let service = service_with(accounts, store.clone())?;

    let err = service.create_user("dave", "pw", NOW).await.unwrap_err();
    assert!(matches!(err, EngineError::UserAlreadyExists(_)));
    assert_eq!(store.load("dave").await?, None);
    assert!(!service.registry().contains("dave"));
    Ok(())
}

#[tokio::test]
async fn test_create_rolls_back_account_when_store_fails() -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Arc::new(MockAccounts::new());
    let store = Arc::new(MemoryStore::new());
    store.set_fail_writes(true);
    let service = service_with(accounts.clone(), store)?;

    let err = service.create_user("erin", "pw", NOW).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    assert!(!accounts.exists("erin"));
    assert!(!service.registry().contains("erin"));
    assert!(accounts.calls().contains(&"delete_account erin".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_delete_unknown_user_touches_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Arc::new(MockAccounts::new().with_account("alice", false));
    let store = Arc::new(MemoryStore::new());
    let service = service_with(accounts.clone(), store.clone())?;
    service.bootstrap(&["alice".to_string()], NOW).await?;
    let calls_before = accounts.calls().len();

    let err = service.delete_user("ghost").await.unwrap_err();
    assert!(matches!(err, EngineError::UserNotFound(_)));

    assert_eq!(accounts.calls().len(), calls_before);
    assert!(store.load("alice").await?.is_some());
    assert_eq!(service.registry().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_delete_restores_record_when_account_removal_fails() -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Arc::new(MockAccounts::new().with_account("alice", false));
    let store = Arc::new(MemoryStore::new());
    let service = service_with(accounts.clone(), store.clone())?;
    service.bootstrap(&["alice".to_string()], NOW).await?;

    accounts.fail_delete(true);
    let err = service.delete_user("alice").await.unwrap_err();
    assert!(matches!(err, EngineError::Account(_)));

    assert!(accounts.exists("alice"));
    assert!(store.load("alice").await?.is_some());
    assert!(service.registry().contains("alice"));
    Ok(())
}

#[tokio::test]
async fn test_tick_after_delete_does_not_resurrect_record() -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Arc::new(MockAccounts::new().with_account("alice", false));
    let store = Arc::new(MemoryStore::new());
    let service = service_with(accounts, store.clone())?;
    service.bootstrap(&["alice".to_string()], NOW).await?;
    let tick = service.enforcement_loop(Duration::from_secs(30));

    service.delete_user("alice").await?;
    let report = tick.tick(NOW).await?;

    assert_eq!(report.persisted, 0);
    assert_eq!(store.load("alice").await?, None);
    Ok(())
}

#[tokio::test]
async fn test_ingested_usage_survives_restart() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("db");
    let users = vec!["alice".to_string()];

    {
        let accounts = Arc::new(MockAccounts::new().with_account("alice", false));
        let store = Arc::new(SledStore::open(&db_path)?);
        let service = service_with(accounts, store.clone())?;
        service.bootstrap(&users, NOW).await?;

        let ingest = service.ingest_loop();
        ingest.process_line("Jan 01 sockd[1]: pass %alice@10.0.0.1.1080(4096)\n");
        ingest.process_line("Jan 01 sockd[1]: pass %alice@10.0.0.1.1080(904)\n");

        let tick = service.enforcement_loop(Duration::from_secs(30));
        tick.persist_all().await?;
        store.flush().await?;
    }

    let accounts = Arc::new(MockAccounts::new().with_account("alice", false));
    let store = Arc::new(SledStore::open(&db_path)?);
    let service = service_with(accounts, store)?;
    service.bootstrap(&users, NOW).await?;

    assert_eq!(service.get_user("alice")?.total_usage, 5000);
    Ok(())
}

#[tokio::test]
async fn test_quota_breach_from_log_locks_account() -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Arc::new(MockAccounts::new().with_account("alice", false));
    let service = service_with(accounts.clone(), Arc::new(MemoryStore::new()))?;
    service.bootstrap(&["alice".to_string()], NOW).await?;
    service
        .patch_user(
            "alice",
            &quota_types::QuotaPatch {
                allowed_usage: Some(100),
                ..Default::default()
            },
        )
        .await?;

    service.ingest_loop().process_line("%alice@host(100)");
    let report = service.enforcement_loop(Duration::from_secs(30)).tick(NOW).await?;

    assert_eq!(report.locked, 1);
    assert!(service.get_user("alice")?.locked);
    assert!(accounts.account("alice").unwrap().locked);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_admin_patch_is_not_blocked_by_unavailable_store() -> Result<(), Box<dyn std::error::Error>> {
    let names: Vec<String> = (0..100).map(|i| format!("u{}", i)).collect();
    let accounts = Arc::new(MockAccounts::new());
    for name in &names {
        accounts.insert(name, false);
    }
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(UsageService::new(
        store.clone(),
        accounts.clone(),
        DefaultsConfig {
            expiry_days: 30,
            allowed_usage: Some(100),
        },
        RetryPolicy::default(),
        UsageMetrics::new()?,
    ));
    service.bootstrap(&names, NOW).await?;
    service.registry().add_usage("u1", 100)?;
    store.set_fail_writes(true);

    let interval = Duration::from_secs(30);
    let tick = service.enforcement_loop(interval);
    let started = tokio::time::Instant::now();
    let tick_task = tokio::spawn(async move {
        let report = tick.tick(NOW).await;
        (report, started.elapsed())
    });

    let patch_started = tokio::time::Instant::now();
    let patched = service
        .patch_user(
            "u0",
            &quota_types::QuotaPatch {
                total_usage: Some(0),
                ..Default::default()
            },
        )
        .await?;
    let patch_elapsed = patch_started.elapsed();

    let (report, tick_elapsed) = tick_task.await?;
    let report = report?;

    assert_eq!(patched.total_usage, 0);
    assert!(patch_elapsed < Duration::from_secs(1));
    assert!(tick_elapsed < interval / 10);
    assert_eq!(report.persist_failures, 100);
    assert_eq!(report.locked, 1);
    assert!(accounts.account("u1").unwrap().locked);
    Ok(())
}
