use std::sync::Arc;
use std::time::{Duration, Instant};

use audioflow::config::Config;
use audioflow::db;
use audioflow::engine::HttpTranscriptionEngine;
use audioflow::error::JobError;
use audioflow::jobs::breaker::{BreakerConfig, CircuitBreaker};
use audioflow::jobs::executor::{JobExecutor, Outcome};
use audioflow::jobs::model::Job;
use audioflow::jobs::retry::RetryPolicy;
use audioflow::jobs::store::{JobStore, PgJobStore};
use audioflow::notify::StatusNotifier;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Config::from_env()?;
    tracing::info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue,
        lease_seconds = cfg.lease_seconds,
        soft_limit_secs = cfg.soft_time_limit_secs,
        hard_limit_secs = cfg.hard_time_limit_secs,
        "worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    // Live connections hang off the API process; the worker's notifier has
    // no registrations, so event emission here is a no-op.
    let notifier = Arc::new(StatusNotifier::new());
    let engine = Arc::new(HttpTranscriptionEngine::new(
        cfg.whisper_url.clone(),
        Duration::from_secs(cfg.engine_timeout_secs),
    )?);
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let executor = Arc::new(JobExecutor::new(
        store.clone(),
        engine,
        notifier,
        RetryPolicy::for_engine(),
        breaker,
    ));

    let reap_interval = Duration::from_millis(cfg.reap_interval_ms);
    let mut last_reap = Instant::now() - reap_interval;

    loop {
        // Reclaim jobs from dead workers on a fixed interval to avoid
        // hot-loop write load.
        if last_reap.elapsed() >= reap_interval {
            match store.reap_expired_leases().await {
                Ok(reaped) if reaped > 0 => {
                    tracing::info!(worker_id = %cfg.worker_id, reaped, "reclaimed expired leases")
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "lease reaping failed"),
            }
            last_reap = Instant::now();
        }

        let claimed = match store
            .claim(&cfg.queue, &cfg.worker_id, cfg.lease_seconds)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(error = %e, "claim failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(job) = claimed else {
            tokio::time::sleep(Duration::from_millis(250)).await;
            continue;
        };

        process_job(&cfg, &store, &executor, job).await;
    }
}

/// Run one claimed job under the pool-mode wall-clock limits: warn at the
/// soft limit, kill at the hard limit and classify the kill as a transient
/// timeout so the normal retry path applies.
async fn process_job(
    cfg: &Config,
    store: &Arc<dyn JobStore>,
    executor: &Arc<JobExecutor>,
    job: Job,
) {
    let job_id = job.id;
    tracing::info!(
        worker_id = %cfg.worker_id,
        %job_id,
        kind = %job.kind,
        attempt = job.retry_count + 1,
        "claimed job"
    );

    let soft_limit = Duration::from_secs(cfg.soft_time_limit_secs);
    let soft_warn = tokio::spawn(async move {
        tokio::time::sleep(soft_limit).await;
        tracing::warn!(%job_id, limit_secs = soft_limit.as_secs(), "job exceeded soft time limit");
    });

    let hard_limit = Duration::from_secs(cfg.hard_time_limit_secs);
    let outcome = match tokio::time::timeout(hard_limit, executor.run(job.clone())).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::error!(
                %job_id,
                limit_secs = hard_limit.as_secs(),
                "hard time limit exceeded, killing attempt"
            );
            executor
                .fail_attempt(
                    &job,
                    JobError::transient(
                        "TIMEOUT",
                        format!("hard time limit of {}s exceeded", hard_limit.as_secs()),
                    ),
                )
                .await
        }
    };
    soft_warn.abort();

    match outcome {
        Outcome::Retry { .. } | Outcome::CircuitOpen { .. } => {
            // The job is pending again with run_at pushed out; flip it back
            // to queued so a worker picks it up once due.
            if let Err(e) = store.mark_queued(job_id).await {
                tracing::error!(%job_id, error = %e, "failed to re-queue job for retry");
            }
        }
        Outcome::Completed | Outcome::Failed | Outcome::Cancelled => {}
    }
}
