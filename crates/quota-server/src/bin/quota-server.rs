//! Proxy usage accounting daemon
//!
//! Tails the proxy log, enforces expiry and quota on the tracked accounts and
//! serves the admin API until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use quota_accounts::{check_proxy_version, discover_accounts, ensure_group, SystemAccounts};
use quota_engine::{
    open_source, IngestSource, RetryPolicy, ServiceConfig, UsageMetrics, UsageService,
};
use quota_server::{logging, router, shutdown::shutdown_signal, AppState};
use quota_store::open_store;
use quota_types::now_timestamp;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "quota-server", version, about = "Proxy usage accounting and quota enforcement")]
struct Args {
    /// Configuration file; built-in defaults are used when it does not exist
    #[arg(short, long, env = "QUOTA_CONFIG_PATH", default_value = "/etc/quota/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServiceConfig::load(&args.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    logging::init(&config.logging)?;

    info!(config = %args.config.display(), "Starting quota server");

    let group_gid = match &config.accounts.group {
        Some(group) => Some(ensure_group(group).await?),
        None => None,
    };
    check_proxy_version(&config.accounts.proxy_binary).await;
    let usernames = discover_accounts(&config.accounts, group_gid).await?;

    let store = open_store(&config.storage)?;
    let accounts = Arc::new(SystemAccounts::new(config.accounts.clone()));
    let metrics = UsageMetrics::new()?;
    let service = Arc::new(UsageService::new(
        store,
        accounts,
        config.defaults.clone(),
        RetryPolicy::from(&config.enforcement.retry),
        metrics,
    ));
    service.bootstrap(&usernames, now_timestamp()).await?;

    let shutdown = CancellationToken::new();

    let ingest = tokio::spawn(run_ingest(
        service.clone(),
        config.ingest.source.clone(),
        shutdown.clone(),
    ));

    let enforcement = {
        let enforcement = service.enforcement_loop(config.enforcement.interval());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _guard = shutdown.clone().drop_guard();
            enforcement.run(shutdown).await
        })
    };

    let addr = config.bind_address()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {}", addr))?;
    info!("Admin API listening on {}", addr);
    let server = {
        let app = router(AppState {
            service: service.clone(),
        });
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _guard = shutdown.clone().drop_guard();
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        })
    };

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    let mut failed = false;
    match ingest.await? {
        Ok(()) => {}
        Err(e) => {
            error!(error = %e, "log ingestion failed");
            failed = true;
        }
    }
    match enforcement.await? {
        Ok(()) => {}
        Err(e) => {
            error!(error = %e, "enforcement loop failed");
            failed = true;
        }
    }
    if let Err(e) = server.await? {
        error!(error = %e, "admin API failed");
        failed = true;
    }

    service.store().flush().await?;
    info!("Quota server stopped");

    if failed {
        anyhow::bail!("quota server terminated after a fatal error");
    }
    Ok(())
}

/// Feed the configured log source to the ingestion loop, reopening it after
/// recoverable errors
async fn run_ingest(
    service: Arc<UsageService>,
    source: IngestSource,
    shutdown: CancellationToken,
) -> quota_engine::Result<()> {
    let _guard = shutdown.clone().drop_guard();
    service
        .ingest_loop()
        .run_reopening(|| open_source(&source), shutdown)
        .await
}
