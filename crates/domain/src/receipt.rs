//! Receipt verification: OCR lifecycle, media dedup and validation.
//!
//! A given `(user, place, media_url)` triple converges to exactly one
//! terminal OCR result, and the external OCR capability runs at most once
//! per media URL: the row is claimed with a conditional transition before
//! OCR is invoked, and later calls replay the recorded terminal state.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use thiserror::Error;
use tracing::warn;

use crate::model::{MediaUrl, OcrData, OcrStatus, PlaceId, ReceiptRecord, UserId};
use crate::storage::{OcrOutcome, ReceiptStore, StorageError, VerificationStore};

/// Tag prefix that separates an OCR infrastructure failure from a genuinely
/// bad receipt in the stored error list.
pub const TAG_OCR_TRANSPORT: &str = "ocr_transport";
/// Tag returned to the loser of a claim race while OCR is still running.
pub const TAG_CONCURRENT: &str = "concurrent";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OcrTransportError {
    #[error("ocr request failed: {0}")]
    Request(String),
    #[error("ocr timed out after {0:?}")]
    Timeout(StdDuration),
}

/// The pluggable external OCR capability.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn perform_ocr(&self, media_url: &MediaUrl) -> Result<OcrData, OcrTransportError>;
}

/// Validation knobs, passed explicitly per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiptPolicy {
    pub min_confidence: f64,
    pub total_tolerance: i64,
    pub ocr_timeout: StdDuration,
}

impl Default for ReceiptPolicy {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            total_tolerance: 1_000,
            ocr_timeout: StdDuration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReceiptState {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptVerification {
    pub state: ReceiptState,
    pub ocr_data: Option<OcrData>,
    pub confidence: Option<f64>,
    pub validation_errors: Vec<String>,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptVerifyRequest {
    pub user_id: UserId,
    pub place_id: PlaceId,
    pub media_url: MediaUrl,
    pub expected_total: Option<i64>,
}

fn record_outcome(state: ReceiptState, replayed: bool) {
    let tag = state.as_ref().to_owned();
    let source = if replayed { "replay" } else { "fresh" };
    counter!("receipt_verify_total", 1, "state" => tag, "source" => source);
}

fn replay_terminal(receipt: &ReceiptRecord) -> Option<ReceiptVerification> {
    let state = match receipt.ocr_status {
        OcrStatus::Completed => ReceiptState::Completed,
        OcrStatus::Failed => ReceiptState::Failed,
        OcrStatus::Pending | OcrStatus::Processing => return None,
    };
    Some(ReceiptVerification {
        state,
        ocr_data: receipt.ocr_data.clone(),
        confidence: receipt.ocr_data.as_ref().map(|d| d.confidence),
        validation_errors: receipt.validation_errors.clone(),
        replayed: true,
    })
}

/// Checks the extracted fields against policy; the returned list is empty
/// when the receipt is acceptable.
pub fn validate_ocr(
    data: &OcrData,
    expected_total: Option<i64>,
    policy: &ReceiptPolicy,
) -> Vec<String> {
    let mut errors = Vec::new();

    match data.total {
        Some(total) if total > 0 => {
            if let Some(expected) = expected_total {
                if (total - expected).abs() > policy.total_tolerance {
                    errors.push(format!(
                        "Total mismatch: ocr={} expected={} tolerance={}",
                        total, expected, policy.total_tolerance
                    ));
                }
            }
        }
        Some(total) => errors.push(format!("Total not positive: {total}")),
        None => errors.push("Total missing".to_string()),
    }

    if data.confidence < policy.min_confidence {
        errors.push(format!(
            "Low confidence: {} < {}",
            data.confidence, policy.min_confidence
        ));
    }

    errors
}

/// Verifies a submitted receipt. The first call for a triple owns the OCR
/// invocation; every later call replays the terminal result.
pub async fn verify_receipt<S, O>(
    store: &S,
    ocr: &O,
    policy: &ReceiptPolicy,
    request: &ReceiptVerifyRequest,
    now: DateTime<Utc>,
) -> Result<ReceiptVerification, StorageError>
where
    S: ReceiptStore + VerificationStore,
    O: OcrProvider + ?Sized,
{
    if let Some(existing) = store
        .find_receipt(&request.user_id, &request.place_id, &request.media_url)
        .await?
    {
        if let Some(replay) = replay_terminal(&existing) {
            record_outcome(replay.state, true);
            return Ok(replay);
        }
    }

    let claimed = store
        .begin_ocr(&request.user_id, &request.place_id, &request.media_url, now)
        .await?;
    if claimed.is_none() {
        // Lost the claim race. Replay if the winner already finished,
        // otherwise report the in-flight pass without touching the row.
        if let Some(existing) = store
            .find_receipt(&request.user_id, &request.place_id, &request.media_url)
            .await?
        {
            if let Some(replay) = replay_terminal(&existing) {
                record_outcome(replay.state, true);
                return Ok(replay);
            }
        }
        record_outcome(ReceiptState::Failed, false);
        return Ok(ReceiptVerification {
            state: ReceiptState::Failed,
            ocr_data: None,
            confidence: None,
            validation_errors: vec![TAG_CONCURRENT.to_string()],
            replayed: false,
        });
    }

    let ocr_result = match tokio::time::timeout(
        policy.ocr_timeout,
        ocr.perform_ocr(&request.media_url),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(OcrTransportError::Timeout(policy.ocr_timeout)),
    };

    let outcome = match ocr_result {
        Ok(data) => {
            let errors = validate_ocr(&data, request.expected_total, policy);
            OcrOutcome {
                completed: errors.is_empty(),
                total: data.total,
                paid_at: data.date,
                ocr_data: Some(data),
                validation_errors: errors,
            }
        }
        Err(err) => {
            counter!("receipt_ocr_total", 1, "result" => "transport_error");
            warn!(media_url = request.media_url.as_str(), %err, "ocr call failed");
            OcrOutcome {
                completed: false,
                total: None,
                paid_at: None,
                ocr_data: None,
                validation_errors: vec![format!("{TAG_OCR_TRANSPORT}: {err}")],
            }
        }
    };

    let completed = outcome.completed;
    let ocr_data = outcome.ocr_data.clone();
    let validation_errors = outcome.validation_errors.clone();
    store
        .complete_ocr(&request.user_id, &request.place_id, &request.media_url, outcome)
        .await?;

    if completed {
        counter!("receipt_ocr_total", 1, "result" => "completed");
        store
            .mark_receipt_ok(&request.user_id, &request.place_id)
            .await?;
        record_outcome(ReceiptState::Completed, false);
        Ok(ReceiptVerification {
            state: ReceiptState::Completed,
            confidence: ocr_data.as_ref().map(|d| d.confidence),
            ocr_data,
            validation_errors: Vec::new(),
            replayed: false,
        })
    } else {
        counter!("receipt_ocr_total", 1, "result" => "failed");
        record_outcome(ReceiptState::Failed, false);
        Ok(ReceiptVerification {
            state: ReceiptState::Failed,
            confidence: ocr_data.as_ref().map(|d| d.confidence),
            ocr_data,
            validation_errors,
            replayed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GpsMetadata, VerificationRecord};
    use crate::storage::StorageResult;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockStore {
        receipts: Mutex<HashMap<(String, String, String), ReceiptRecord>>,
        receipt_flags: Mutex<Vec<(String, String)>>,
    }

    fn key(user: &UserId, place: &PlaceId, media: &MediaUrl) -> (String, String, String) {
        (
            user.as_str().to_string(),
            place.as_str().to_string(),
            media.as_str().to_string(),
        )
    }

    #[async_trait]
    impl ReceiptStore for MockStore {
        async fn find_receipt(
            &self,
            user_id: &UserId,
            place_id: &PlaceId,
            media_url: &MediaUrl,
        ) -> StorageResult<Option<ReceiptRecord>> {
            Ok(self
                .receipts
                .lock()
                .unwrap()
                .get(&key(user_id, place_id, media_url))
                .cloned())
        }

        async fn begin_ocr(
            &self,
            user_id: &UserId,
            place_id: &PlaceId,
            media_url: &MediaUrl,
            now: DateTime<Utc>,
        ) -> StorageResult<Option<ReceiptRecord>> {
            let mut receipts = self.receipts.lock().unwrap();
            let entry = receipts
                .entry(key(user_id, place_id, media_url))
                .or_insert_with(|| ReceiptRecord {
                    user_id: user_id.clone(),
                    place_id: place_id.clone(),
                    media_url: media_url.clone(),
                    ocr_status: OcrStatus::Pending,
                    ocr_data: None,
                    validation_errors: Vec::new(),
                    total: None,
                    paid_at: None,
                    created_at: now,
                    updated_at: now,
                });
            if entry.ocr_status == OcrStatus::Pending {
                entry.ocr_status = OcrStatus::Processing;
                Ok(Some(entry.clone()))
            } else {
                Ok(None)
            }
        }

        async fn complete_ocr(
            &self,
            user_id: &UserId,
            place_id: &PlaceId,
            media_url: &MediaUrl,
            outcome: OcrOutcome,
        ) -> StorageResult<Option<ReceiptRecord>> {
            let mut receipts = self.receipts.lock().unwrap();
            match receipts.get_mut(&key(user_id, place_id, media_url)) {
                Some(receipt) if receipt.ocr_status == OcrStatus::Processing => {
                    receipt.ocr_status = if outcome.completed {
                        OcrStatus::Completed
                    } else {
                        OcrStatus::Failed
                    };
                    receipt.ocr_data = outcome.ocr_data;
                    receipt.validation_errors = outcome.validation_errors;
                    receipt.total = outcome.total;
                    receipt.paid_at = outcome.paid_at;
                    Ok(Some(receipt.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn fail_stuck(&self, _cutoff: DateTime<Utc>) -> StorageResult<u64> {
            Ok(0)
        }
    }

    #[async_trait]
    impl VerificationStore for MockStore {
        async fn mark_gps_ok(
            &self,
            _user_id: &UserId,
            _place_id: &PlaceId,
            _metadata: GpsMetadata,
        ) -> StorageResult<()> {
            Ok(())
        }

        async fn mark_qr_ok(&self, _user_id: &UserId, _place_id: &PlaceId) -> StorageResult<()> {
            Ok(())
        }

        async fn mark_receipt_ok(
            &self,
            user_id: &UserId,
            place_id: &PlaceId,
        ) -> StorageResult<()> {
            self.receipt_flags.lock().unwrap().push((
                user_id.as_str().to_string(),
                place_id.as_str().to_string(),
            ));
            Ok(())
        }

        async fn find_verification(
            &self,
            _user_id: &UserId,
            _place_id: &PlaceId,
        ) -> StorageResult<Option<VerificationRecord>> {
            Ok(None)
        }
    }

    struct MockOcr {
        calls: AtomicUsize,
        result: Result<OcrData, OcrTransportError>,
        delay: Option<StdDuration>,
    }

    impl MockOcr {
        fn returning(result: Result<OcrData, OcrTransportError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl OcrProvider for MockOcr {
        async fn perform_ocr(&self, _media_url: &MediaUrl) -> Result<OcrData, OcrTransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.result.clone()
        }
    }

    fn good_ocr(total: i64, confidence: f64) -> OcrData {
        OcrData {
            total: Some(total),
            items: vec!["americano".to_string()],
            date: Some(Utc::now()),
            merchant_name: Some("Cafe".to_string()),
            confidence,
        }
    }

    fn request(expected_total: Option<i64>) -> ReceiptVerifyRequest {
        ReceiptVerifyRequest {
            user_id: UserId::new("u1"),
            place_id: PlaceId::new("p1"),
            media_url: MediaUrl::new("https://cdn.example/r1.jpg"),
            expected_total,
        }
    }

    #[tokio::test]
    async fn valid_receipt_completes_and_flips_receipt_ok() {
        let store = MockStore::default();
        let ocr = MockOcr::returning(Ok(good_ocr(15_000, 0.95)));

        let result = verify_receipt(
            &store,
            &ocr,
            &ReceiptPolicy::default(),
            &request(None),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, ReceiptState::Completed);
        assert_eq!(result.confidence, Some(0.95));
        assert!(result.validation_errors.is_empty());
        assert_eq!(store.receipt_flags.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dedup_invokes_ocr_at_most_once() {
        let store = MockStore::default();
        let ocr = MockOcr::returning(Ok(good_ocr(15_000, 0.95)));
        let policy = ReceiptPolicy::default();

        let first = verify_receipt(&store, &ocr, &policy, &request(None), Utc::now())
            .await
            .unwrap();
        let second = verify_receipt(&store, &ocr, &policy, &request(None), Utc::now())
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.state, ReceiptState::Completed);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn total_mismatch_beyond_tolerance_fails() {
        let store = MockStore::default();
        let ocr = MockOcr::returning(Ok(good_ocr(15_000, 0.95)));

        let result = verify_receipt(
            &store,
            &ocr,
            &ReceiptPolicy::default(),
            &request(Some(20_000)),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, ReceiptState::Failed);
        assert!(result.validation_errors[0].starts_with("Total mismatch"));
        assert!(store.receipt_flags.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn total_within_tolerance_passes() {
        let store = MockStore::default();
        let ocr = MockOcr::returning(Ok(good_ocr(19_200, 0.95)));

        let result = verify_receipt(
            &store,
            &ocr,
            &ReceiptPolicy::default(),
            &request(Some(20_000)),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, ReceiptState::Completed);
    }

    #[tokio::test]
    async fn low_confidence_fails_validation() {
        let store = MockStore::default();
        let ocr = MockOcr::returning(Ok(good_ocr(15_000, 0.4)));

        let result = verify_receipt(
            &store,
            &ocr,
            &ReceiptPolicy::default(),
            &request(None),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, ReceiptState::Failed);
        assert!(result.validation_errors[0].starts_with("Low confidence"));
    }

    #[tokio::test]
    async fn missing_total_fails_validation() {
        let store = MockStore::default();
        let mut data = good_ocr(1, 0.95);
        data.total = None;
        let ocr = MockOcr::returning(Ok(data));

        let result = verify_receipt(
            &store,
            &ocr,
            &ReceiptPolicy::default(),
            &request(None),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, ReceiptState::Failed);
        assert_eq!(result.validation_errors, vec!["Total missing".to_string()]);
    }

    #[tokio::test]
    async fn transport_failure_is_tagged_distinctly() {
        let store = MockStore::default();
        let ocr = MockOcr::returning(Err(OcrTransportError::Request("503".to_string())));

        let result = verify_receipt(
            &store,
            &ocr,
            &ReceiptPolicy::default(),
            &request(None),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, ReceiptState::Failed);
        assert!(result.validation_errors[0].starts_with(TAG_OCR_TRANSPORT));
        assert!(result.ocr_data.is_none());
    }

    #[tokio::test]
    async fn slow_ocr_times_out_as_transport_failure() {
        let store = MockStore::default();
        let ocr = MockOcr {
            calls: AtomicUsize::new(0),
            result: Ok(good_ocr(15_000, 0.95)),
            delay: Some(StdDuration::from_millis(250)),
        };
        let policy = ReceiptPolicy {
            ocr_timeout: StdDuration::from_millis(20),
            ..Default::default()
        };

        let result = verify_receipt(&store, &ocr, &policy, &request(None), Utc::now())
            .await
            .unwrap();

        assert_eq!(result.state, ReceiptState::Failed);
        assert!(result.validation_errors[0].starts_with(TAG_OCR_TRANSPORT));
    }

    #[tokio::test]
    async fn claim_race_loser_reports_in_flight_pass() {
        let store = MockStore::default();
        let req = request(None);
        store
            .begin_ocr(&req.user_id, &req.place_id, &req.media_url, Utc::now())
            .await
            .unwrap()
            .expect("claim succeeds");

        let ocr = MockOcr::returning(Ok(good_ocr(15_000, 0.95)));
        let result = verify_receipt(&store, &ocr, &ReceiptPolicy::default(), &req, Utc::now())
            .await
            .unwrap();

        assert_eq!(result.state, ReceiptState::Failed);
        assert_eq!(result.validation_errors, vec![TAG_CONCURRENT.to_string()]);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
    }
}
