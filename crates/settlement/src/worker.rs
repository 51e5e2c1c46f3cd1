use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use visitproof_domain::{
    config::{ConfigError, SettlementConfig},
    model::SettlementJobRecord,
    services::telemetry::TelemetryError,
    storage::{SettlementStore, StorageError},
};
use visitproof_storage::SeaOrmStorage;

use crate::{
    pipeline::process_job,
    reconcile::run_reconcile_pass,
    sink::RewardSink,
};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
}

/// Poll loop: one reconcile sweep, then claim and deliver due jobs. Claim
/// and reconcile failures are logged and retried next cycle; only storage
/// failures inside delivery bookkeeping abort the worker.
pub async fn run_settlement<K>(
    config: SettlementConfig,
    storage: SeaOrmStorage,
    sink: K,
) -> Result<(), SettlementError>
where
    K: RewardSink,
{
    loop {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(config.stuck_after_secs());

        if let Err(err) = run_reconcile_pass(&storage, cutoff, now).await {
            counter!("settlement_cycles_total", 1, "result" => "reconcile_error");
            warn!(?err, "reconcile pass failed");
        }

        match storage.claim_due(now, config.claim_batch_size()).await {
            Ok(jobs) => {
                handle_batch(&config, &storage, &sink, jobs, now).await?;
            }
            Err(err) => {
                counter!("settlement_cycles_total", 1, "result" => "claim_error");
                warn!(?err, "claiming due settlement jobs failed");
            }
        }

        sleep(StdDuration::from_secs(config.poll_interval_secs())).await;
    }
}

async fn handle_batch<S, K>(
    config: &SettlementConfig,
    storage: &S,
    sink: &K,
    jobs: Vec<SettlementJobRecord>,
    now: DateTime<Utc>,
) -> Result<(), SettlementError>
where
    S: SettlementStore,
    K: RewardSink,
{
    counter!("settlement_cycles_total", 1, "result" => "ok");
    histogram!("settlement_batch_jobs", jobs.len() as f64);

    for job in &jobs {
        process_job(
            storage,
            sink,
            job,
            config.max_retries(),
            config.backoff_base_secs(),
            now,
        )
        .await?;
    }
    Ok(())
}
