use std::sync::Arc;
use std::time::Duration;

use audioflow::api::{self, ApiState};
use audioflow::config::{Config, ExecutionMode};
use audioflow::db;
use audioflow::engine::HttpTranscriptionEngine;
use audioflow::jobs::breaker::{BreakerConfig, CircuitBreaker};
use audioflow::jobs::dispatch::{ExecutionBackend, InlineBackend, PoolBackend};
use audioflow::jobs::executor::JobExecutor;
use audioflow::jobs::retry::RetryPolicy;
use audioflow::jobs::store::{cutoff_days, JobStore, PgJobStore};
use audioflow::notify::{spawn_keepalive, StatusNotifier};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Config::from_env()?;
    tracing::info!(
        api_addr = %cfg.api_addr,
        mode = ?cfg.mode,
        queue = %cfg.queue,
        retention_days = cfg.retention_days,
        "audioflowd starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let notifier = Arc::new(StatusNotifier::new());

    let backend: Arc<dyn ExecutionBackend> = match cfg.mode {
        ExecutionMode::Pool => Arc::new(PoolBackend::new(store.clone(), notifier.clone())),
        ExecutionMode::Inline => {
            let engine = Arc::new(HttpTranscriptionEngine::new(
                cfg.whisper_url.clone(),
                Duration::from_secs(cfg.engine_timeout_secs),
            )?);
            let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
            let executor = Arc::new(JobExecutor::new(
                store.clone(),
                engine,
                notifier.clone(),
                RetryPolicy::for_engine(),
                breaker,
            ));
            Arc::new(InlineBackend::new(store.clone(), executor))
        }
    };

    let state = ApiState {
        store: store.clone(),
        notifier: notifier.clone(),
        backend,
        default_queue: cfg.queue.clone(),
        default_max_retries: cfg.default_max_retries,
    };
    let app = api::router(state);

    // ---- keep-alive task ----
    let keepalive_handle = spawn_keepalive(
        notifier.clone(),
        Duration::from_secs(cfg.keepalive_interval_secs),
    );

    // ---- retention task ----
    let retention_handle = {
        let store = store.clone();
        let retention_days = cfg.retention_days;
        let interval = Duration::from_secs(cfg.maintenance_interval_secs);
        tokio::spawn(async move {
            loop {
                match store
                    .purge_terminal_older_than(cutoff_days(retention_days))
                    .await
                {
                    Ok(n) if n > 0 => tracing::info!(purged = n, "retention cleanup"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "retention cleanup failed"),
                }
                tokio::time::sleep(interval).await;
            }
        })
    };

    // ---- API task ----
    let api_addr = cfg.api_addr.clone();
    let api_handle = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&api_addr).await?;
        tracing::info!("api listening on http://{api_addr}");
        axum::serve(listener, app).await?;
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = api_handle => res??,
        _ = keepalive_handle => {},
        _ = retention_handle => {},
    }

    Ok(())
}
