use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::model::{
    CodeHash, GpsMetadata, MediaUrl, NewQrToken, OcrData, PlaceId, PlaceRecord, QrTokenRecord,
    ReceiptRecord, SettlementJobRecord, SettlementPayload, UserId, VerificationRecord,
};

/// Common result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
}

impl StorageError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

#[async_trait]
pub trait PlaceStore: Send + Sync {
    async fn upsert_place(&self, place: PlaceRecord) -> StorageResult<()>;
    async fn find_place(&self, place_id: &PlaceId) -> StorageResult<Option<PlaceRecord>>;
}

/// Token rows are mutated only through the conditional transitions below.
/// Every `Option` return distinguishes "this call won the transition" from
/// "someone else already moved the row" — the caller re-reads and replays.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, token: NewQrToken) -> StorageResult<QrTokenRecord>;
    async fn find_token(&self, code_hash: &CodeHash) -> StorageResult<Option<QrTokenRecord>>;

    /// CAS `pending -> processing`; `Some` only for the winner.
    async fn begin_processing(
        &self,
        code_hash: &CodeHash,
    ) -> StorageResult<Option<QrTokenRecord>>;

    /// CAS `pending -> expired`.
    async fn expire_token(&self, code_hash: &CodeHash) -> StorageResult<Option<QrTokenRecord>>;

    /// CAS `processing -> success`, stamping `used_at`/`used_by`.
    async fn complete_success(
        &self,
        code_hash: &CodeHash,
        used_by: &UserId,
        used_at: DateTime<Utc>,
        distance_m: i32,
    ) -> StorageResult<Option<QrTokenRecord>>;

    /// CAS `processing -> failed` with a reason.
    async fn complete_failed(
        &self,
        code_hash: &CodeHash,
        reason: &str,
        distance_m: Option<i32>,
    ) -> StorageResult<Option<QrTokenRecord>>;

    /// Reconciler sweep: anything still `pending`/`processing` created
    /// before the cutoff becomes `expired`. Returns rows moved.
    async fn expire_stuck(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;
}

/// Terminal fields written when an OCR pass finishes, one way or the other.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutcome {
    pub completed: bool,
    pub ocr_data: Option<OcrData>,
    pub validation_errors: Vec<String>,
    pub total: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    async fn find_receipt(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        media_url: &MediaUrl,
    ) -> StorageResult<Option<ReceiptRecord>>;

    /// Creates the row if absent and CASes `pending -> processing`.
    /// `Some` means this call owns the OCR invocation.
    async fn begin_ocr(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        media_url: &MediaUrl,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ReceiptRecord>>;

    /// CAS `processing -> completed|failed` with the outcome attached.
    async fn complete_ocr(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        media_url: &MediaUrl,
        outcome: OcrOutcome,
    ) -> StorageResult<Option<ReceiptRecord>>;

    /// Reconciler sweep: rows stuck `pending`/`processing` past the cutoff
    /// become `failed` with a `reconciled` tag. Returns rows moved.
    async fn fail_stuck(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;
}

/// Flags are monotonic true; implementations must never clear one.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn mark_gps_ok(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        metadata: GpsMetadata,
    ) -> StorageResult<()>;
    async fn mark_qr_ok(&self, user_id: &UserId, place_id: &PlaceId) -> StorageResult<()>;
    async fn mark_receipt_ok(&self, user_id: &UserId, place_id: &PlaceId) -> StorageResult<()>;
    async fn find_verification(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
    ) -> StorageResult<Option<VerificationRecord>>;
}

/// Observed state of one fixed window after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: i64,
    pub window_expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments the counter for `key`, opening a fresh window
    /// when the previous one has expired. The count never goes negative and
    /// resets only on window expiry.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<WindowCount>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the cached response for `key` if present and unexpired.
    async fn get_response(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<serde_json::Value>>;

    /// First write wins; later writes for the same key are ignored so all
    /// replayed responses stay byte-identical to the first.
    async fn put_response(
        &self,
        key: &str,
        response: &serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64>;
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Durable enqueue keyed by the derived idempotency key. Returns `false`
    /// when a job with the same key already exists (duplicate collapsed).
    async fn enqueue(
        &self,
        idempotency_key: &str,
        payload: &SettlementPayload,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Claims up to `limit` due `queued` jobs, CASing each to `in_flight`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> StorageResult<Vec<SettlementJobRecord>>;

    async fn mark_done(&self, idempotency_key: &str) -> StorageResult<()>;

    /// Returns the job to `queued` with an incremented retry count.
    async fn mark_retry(
        &self,
        idempotency_key: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn mark_dead(&self, idempotency_key: &str, error: &str) -> StorageResult<()>;

    async fn find_job(
        &self,
        idempotency_key: &str,
    ) -> StorageResult<Option<SettlementJobRecord>>;

    /// Reconciler sweep: jobs stuck `in_flight` past the cutoff go back to
    /// `queued`. Returns rows moved.
    async fn requeue_stuck(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;
}
