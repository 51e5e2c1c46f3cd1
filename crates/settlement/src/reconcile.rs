use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::info;

use visitproof_domain::storage::{
    IdempotencyStore, ReceiptStore, SettlementStore, StorageResult, TokenStore,
};

/// Rows moved by one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub tokens_expired: u64,
    pub receipts_failed: u64,
    pub jobs_requeued: u64,
    pub idempotency_purged: u64,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.tokens_expired == 0
            && self.receipts_failed == 0
            && self.jobs_requeued == 0
            && self.idempotency_purged == 0
    }
}

/// Sweeps state left behind by crashed or partitioned workers: tokens and
/// receipts stuck in a non-terminal status past `cutoff` are forced into a
/// terminal one, in-flight settlement jobs go back to the queue, and
/// expired idempotency records are dropped. Forcing `expired`/`failed` is
/// safe because a transition that raced the sweep simply loses the CAS.
pub async fn run_reconcile_pass<S>(
    store: &S,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StorageResult<ReconcileReport>
where
    S: TokenStore + ReceiptStore + SettlementStore + IdempotencyStore,
{
    let report = ReconcileReport {
        tokens_expired: store.expire_stuck(cutoff).await?,
        receipts_failed: store.fail_stuck(cutoff).await?,
        jobs_requeued: store.requeue_stuck(cutoff).await?,
        idempotency_purged: store.purge_expired(now).await?,
    };

    counter!("reconcile_rows_total", report.tokens_expired, "kind" => "token_expired");
    counter!("reconcile_rows_total", report.receipts_failed, "kind" => "receipt_failed");
    counter!("reconcile_rows_total", report.jobs_requeued, "kind" => "job_requeued");
    counter!("reconcile_rows_total", report.idempotency_purged, "kind" => "idempotency_purged");

    if !report.is_empty() {
        info!(
            tokens_expired = report.tokens_expired,
            receipts_failed = report.receipts_failed,
            jobs_requeued = report.jobs_requeued,
            idempotency_purged = report.idempotency_purged,
            "reconcile pass moved stuck rows"
        );
    }

    Ok(report)
}
