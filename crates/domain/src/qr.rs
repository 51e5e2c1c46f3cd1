//! QR token verification: the `pending -> processing -> terminal` state
//! machine plus the geofence gate.
//!
//! Concurrency is resolved entirely by the conditional transitions in the
//! token store: two simultaneous scans of the same physical code race on
//! the `pending -> processing` write, exactly one wins, and the loser
//! replays the terminal record instead of erroring. Terminal outcomes are
//! returned by value; errors are reserved for infrastructure failures.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use thiserror::Error;
use tracing::warn;

use crate::geo::{check_geofence, GeoError, GeofencePolicy};
use crate::model::{
    hash_qr_code, CodeHash, Geohash, PlaceId, QrTokenRecord, TokenStatus, UserId,
};
use crate::storage::{PlaceStore, StorageError, TokenStore, VerificationStore};

/// Reason recorded when the geofence rejects a scan.
pub const REASON_GEOFENCE: &str = "GEOFENCE";
/// Reason returned to the loser of a transition race that observed a
/// still-in-flight record.
pub const REASON_CONCURRENT: &str = "concurrent";
/// Reason recorded when the token references a place that no longer exists.
pub const REASON_PLACE_MISSING: &str = "place_missing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QrState {
    Success,
    Failed,
    Expired,
    Invalid,
}

/// Terminal result of one verification call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrVerification {
    pub state: QrState,
    pub distance_m: Option<i32>,
    pub fail_reason: Option<String>,
    /// True when this call returned a previously recorded terminal state
    /// instead of running the geofence.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QrVerifyRequest {
    pub code: String,
    pub place_id: PlaceId,
    pub user_id: UserId,
    pub user_geohash: Geohash,
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QrVerifyError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("geo error: {0}")]
    Geo(#[from] GeoError),
}

/// Accepts either the scanned clear code or its already-derived 64-hex
/// hash (the "token" form used by kiosk integrations).
fn resolve_code_hash(code: &str) -> CodeHash {
    CodeHash::parse(code).unwrap_or_else(|_| hash_qr_code(code))
}

fn record_outcome(state: QrState, replayed: bool) {
    let tag = state.as_ref().to_owned();
    if replayed {
        counter!("qr_verify_total", 1, "state" => tag, "source" => "replay");
    } else {
        counter!("qr_verify_total", 1, "state" => tag, "source" => "fresh");
    }
}

fn replay_terminal(token: &QrTokenRecord) -> Option<QrVerification> {
    let state = match token.status {
        TokenStatus::Success => QrState::Success,
        TokenStatus::Expired => QrState::Expired,
        TokenStatus::Failed => QrState::Failed,
        TokenStatus::Pending | TokenStatus::Processing => return None,
    };
    Some(QrVerification {
        state,
        distance_m: token.distance_m,
        fail_reason: token.fail_reason.clone(),
        replayed: true,
    })
}

/// Re-read after a lost transition race. A record still in flight maps to
/// a retryable `failed(concurrent)` rather than blocking the caller.
async fn replay_after_race<S>(
    store: &S,
    code_hash: &CodeHash,
) -> Result<QrVerification, QrVerifyError>
where
    S: TokenStore,
{
    if let Some(token) = store.find_token(code_hash).await? {
        if let Some(replay) = replay_terminal(&token) {
            record_outcome(replay.state, true);
            return Ok(replay);
        }
    }
    record_outcome(QrState::Failed, false);
    Ok(QrVerification {
        state: QrState::Failed,
        distance_m: None,
        fail_reason: Some(REASON_CONCURRENT.to_string()),
        replayed: false,
    })
}

/// Verifies a scanned QR code against its token's place. Exactly one call
/// per token consumes it; every later call replays the recorded terminal
/// state without re-running the geofence.
pub async fn verify_qr<S>(
    store: &S,
    policy: &GeofencePolicy,
    request: &QrVerifyRequest,
    now: DateTime<Utc>,
) -> Result<QrVerification, QrVerifyError>
where
    S: TokenStore + PlaceStore + VerificationStore,
{
    let code_hash = resolve_code_hash(&request.code);

    let Some(token) = store.find_token(&code_hash).await? else {
        record_outcome(QrState::Invalid, false);
        return Ok(QrVerification {
            state: QrState::Invalid,
            distance_m: None,
            fail_reason: None,
            replayed: false,
        });
    };

    // A token is only redeemable at the place that issued it; a mismatch is
    // a rejection, not a state transition.
    if token.place_id != request.place_id {
        record_outcome(QrState::Invalid, false);
        return Ok(QrVerification {
            state: QrState::Invalid,
            distance_m: None,
            fail_reason: None,
            replayed: false,
        });
    }

    if let Some(replay) = replay_terminal(&token) {
        record_outcome(replay.state, true);
        return Ok(replay);
    }

    // TTL is checked before any other transition; an expired token yields
    // `expired` regardless of the geofence outcome.
    if now > token.expires_at() {
        return match store.expire_token(&code_hash).await? {
            Some(_) => {
                record_outcome(QrState::Expired, false);
                Ok(QrVerification {
                    state: QrState::Expired,
                    distance_m: None,
                    fail_reason: None,
                    replayed: false,
                })
            }
            None => replay_after_race(store, &code_hash).await,
        };
    }

    let Some(_processing) = store.begin_processing(&code_hash).await? else {
        return replay_after_race(store, &code_hash).await;
    };

    let Some(place) = store.find_place(&token.place_id).await? else {
        warn!(place_id = token.place_id.as_str(), "token references unknown place");
        store
            .complete_failed(&code_hash, REASON_PLACE_MISSING, None)
            .await?;
        record_outcome(QrState::Failed, false);
        return Ok(QrVerification {
            state: QrState::Failed,
            distance_m: None,
            fail_reason: Some(REASON_PLACE_MISSING.to_string()),
            replayed: false,
        });
    };

    let check = check_geofence(
        &place.geohash,
        &request.user_geohash,
        f64::from(place.radius_m),
        request.accuracy_m,
        policy,
    )?;
    let distance_m = check.distance_m.round() as i32;

    if check.within_radius {
        match store
            .complete_success(&code_hash, &request.user_id, now, distance_m)
            .await?
        {
            Some(_) => {
                store.mark_qr_ok(&request.user_id, &request.place_id).await?;
                record_outcome(QrState::Success, false);
                Ok(QrVerification {
                    state: QrState::Success,
                    distance_m: Some(distance_m),
                    fail_reason: None,
                    replayed: false,
                })
            }
            None => replay_after_race(store, &code_hash).await,
        }
    } else {
        store
            .complete_failed(&code_hash, REASON_GEOFENCE, Some(distance_m))
            .await?;
        record_outcome(QrState::Failed, false);
        Ok(QrVerification {
            state: QrState::Failed,
            distance_m: Some(distance_m),
            fail_reason: Some(REASON_GEOFENCE.to_string()),
            replayed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        GpsMetadata, MissionId, NewQrToken, PlaceRecord, VerificationRecord,
    };
    use crate::storage::StorageResult;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockStore {
        tokens: Mutex<HashMap<String, QrTokenRecord>>,
        places: Mutex<HashMap<String, PlaceRecord>>,
        qr_flags: Mutex<Vec<(String, String)>>,
        place_lookups: AtomicUsize,
    }

    #[async_trait]
    impl TokenStore for MockStore {
        async fn insert_token(&self, token: NewQrToken) -> StorageResult<QrTokenRecord> {
            let record = QrTokenRecord {
                code_hash: token.code_hash.clone(),
                place_id: token.place_id,
                status: TokenStatus::Pending,
                ttl_sec: token.ttl_sec,
                created_at: token.created_at,
                used_at: None,
                used_by: None,
                fail_reason: None,
                distance_m: None,
            };
            self.tokens
                .lock()
                .unwrap()
                .insert(token.code_hash.into_inner(), record.clone());
            Ok(record)
        }

        async fn find_token(&self, code_hash: &CodeHash) -> StorageResult<Option<QrTokenRecord>> {
            Ok(self.tokens.lock().unwrap().get(code_hash.as_str()).cloned())
        }

        async fn begin_processing(
            &self,
            code_hash: &CodeHash,
        ) -> StorageResult<Option<QrTokenRecord>> {
            let mut tokens = self.tokens.lock().unwrap();
            match tokens.get_mut(code_hash.as_str()) {
                Some(token) if token.status == TokenStatus::Pending => {
                    token.status = TokenStatus::Processing;
                    Ok(Some(token.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn expire_token(&self, code_hash: &CodeHash) -> StorageResult<Option<QrTokenRecord>> {
            let mut tokens = self.tokens.lock().unwrap();
            match tokens.get_mut(code_hash.as_str()) {
                Some(token) if token.status == TokenStatus::Pending => {
                    token.status = TokenStatus::Expired;
                    Ok(Some(token.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn complete_success(
            &self,
            code_hash: &CodeHash,
            used_by: &UserId,
            used_at: DateTime<Utc>,
            distance_m: i32,
        ) -> StorageResult<Option<QrTokenRecord>> {
            let mut tokens = self.tokens.lock().unwrap();
            match tokens.get_mut(code_hash.as_str()) {
                Some(token) if token.status == TokenStatus::Processing => {
                    token.status = TokenStatus::Success;
                    token.used_at = Some(used_at);
                    token.used_by = Some(used_by.clone());
                    token.distance_m = Some(distance_m);
                    Ok(Some(token.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn complete_failed(
            &self,
            code_hash: &CodeHash,
            reason: &str,
            distance_m: Option<i32>,
        ) -> StorageResult<Option<QrTokenRecord>> {
            let mut tokens = self.tokens.lock().unwrap();
            match tokens.get_mut(code_hash.as_str()) {
                Some(token) if token.status == TokenStatus::Processing => {
                    token.status = TokenStatus::Failed;
                    token.fail_reason = Some(reason.to_string());
                    token.distance_m = distance_m;
                    Ok(Some(token.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn expire_stuck(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
            let mut tokens = self.tokens.lock().unwrap();
            let mut moved = 0;
            for token in tokens.values_mut() {
                if !token.status.is_terminal() && token.created_at < cutoff {
                    token.status = TokenStatus::Expired;
                    moved += 1;
                }
            }
            Ok(moved)
        }
    }

    #[async_trait]
    impl PlaceStore for MockStore {
        async fn upsert_place(&self, place: PlaceRecord) -> StorageResult<()> {
            self.places
                .lock()
                .unwrap()
                .insert(place.place_id.as_str().to_string(), place);
            Ok(())
        }

        async fn find_place(&self, place_id: &PlaceId) -> StorageResult<Option<PlaceRecord>> {
            self.place_lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.places.lock().unwrap().get(place_id.as_str()).cloned())
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

        async fn mark_qr_ok(&self, user_id: &UserId, place_id: &PlaceId) -> StorageResult<()> {
            self.qr_flags.lock().unwrap().push((
                user_id.as_str().to_string(),
                place_id.as_str().to_string(),
            ));
            Ok(())
        }

        async fn mark_receipt_ok(
            &self,
            _user_id: &UserId,
            _place_id: &PlaceId,
        ) -> StorageResult<()> {
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

    async fn seed(store: &MockStore, place_geohash: &str, radius_m: i32, ttl_sec: i64) -> String {
        store
            .upsert_place(PlaceRecord {
                place_id: PlaceId::new("p1"),
                geohash: Geohash::parse(place_geohash).unwrap(),
                radius_m,
                mission_id: MissionId::new("m1"),
                reward_amount: 500,
            })
            .await
            .unwrap();
        let code = "printed-code-1".to_string();
        store
            .insert_token(NewQrToken {
                code_hash: hash_qr_code(&code),
                place_id: PlaceId::new("p1"),
                ttl_sec,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        code
    }

    fn request(code: &str, user_geohash: &str) -> QrVerifyRequest {
        QrVerifyRequest {
            code: code.to_string(),
            place_id: PlaceId::new("p1"),
            user_id: UserId::new("u1"),
            user_geohash: Geohash::parse(user_geohash).unwrap(),
            accuracy_m: Some(10.0),
        }
    }

    #[tokio::test]
    async fn unknown_code_is_invalid() {
        let store = MockStore::default();
        let result = verify_qr(
            &store,
            &GeofencePolicy::default(),
            &request("nope", "wydm6"),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(result.state, QrState::Invalid);
        assert!(!result.replayed);
    }

    #[tokio::test]
    async fn in_radius_scan_succeeds_and_flips_qr_ok() {
        let store = MockStore::default();
        let code = seed(&store, "wydm6", 50, 600).await;

        let result = verify_qr(
            &store,
            &GeofencePolicy::default(),
            &request(&code, "wydm6"),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, QrState::Success);
        assert_eq!(result.distance_m, Some(0));
        assert!(!result.replayed);
        assert_eq!(
            store.qr_flags.lock().unwrap().as_slice(),
            &[("u1".to_string(), "p1".to_string())]
        );
    }

    #[tokio::test]
    async fn replay_returns_cached_state_without_geofence() {
        let store = MockStore::default();
        let code = seed(&store, "wydm6", 50, 600).await;
        let policy = GeofencePolicy::default();

        let first = verify_qr(&store, &policy, &request(&code, "wydm6"), Utc::now())
            .await
            .unwrap();
        assert_eq!(first.state, QrState::Success);
        let lookups_after_first = store.place_lookups.load(Ordering::SeqCst);

        let second = verify_qr(&store, &policy, &request(&code, "wydm6"), Utc::now())
            .await
            .unwrap();
        assert_eq!(second.state, QrState::Success);
        assert!(second.replayed);
        // The geofence never re-ran: the place was not looked up again.
        assert_eq!(store.place_lookups.load(Ordering::SeqCst), lookups_after_first);
    }

    #[tokio::test]
    async fn out_of_radius_scan_fails_with_distance() {
        let store = MockStore::default();
        let code = seed(&store, "wydm6", 50, 600).await;

        // A different geohash5 cell, kilometres away.
        let result = verify_qr(
            &store,
            &GeofencePolicy::default(),
            &request(&code, "wydq0"),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, QrState::Failed);
        assert_eq!(result.fail_reason.as_deref(), Some(REASON_GEOFENCE));
        assert!(result.distance_m.unwrap() > 50);
        assert!(store.qr_flags.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_token_is_expired_regardless_of_geofence() {
        let store = MockStore::default();
        let code = seed(&store, "wydm6", 50, 600).await;

        let later = Utc::now() + Duration::seconds(601);
        let result = verify_qr(
            &store,
            &GeofencePolicy::default(),
            &request(&code, "wydm6"),
            later,
        )
        .await
        .unwrap();

        assert_eq!(result.state, QrState::Expired);
        // Geofence never consulted.
        assert_eq!(store.place_lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_replays_on_followup_scans() {
        let store = MockStore::default();
        let code = seed(&store, "wydm6", 50, 600).await;
        let later = Utc::now() + Duration::seconds(601);
        let policy = GeofencePolicy::default();

        let first = verify_qr(&store, &policy, &request(&code, "wydm6"), later)
            .await
            .unwrap();
        assert!(!first.replayed);
        let second = verify_qr(&store, &policy, &request(&code, "wydm6"), later)
            .await
            .unwrap();
        assert_eq!(second.state, QrState::Expired);
        assert!(second.replayed);
    }

    #[tokio::test]
    async fn race_loser_gets_concurrent_failure() {
        let store = MockStore::default();
        let code = seed(&store, "wydm6", 50, 600).await;

        // Simulate a winner that has claimed the token but not finished.
        store
            .begin_processing(&hash_qr_code(&code))
            .await
            .unwrap()
            .expect("claim succeeds");

        let result = verify_qr(
            &store,
            &GeofencePolicy::default(),
            &request(&code, "wydm6"),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, QrState::Failed);
        assert_eq!(result.fail_reason.as_deref(), Some(REASON_CONCURRENT));
    }

    #[tokio::test]
    async fn wrong_place_is_rejected_without_consuming() {
        let store = MockStore::default();
        let code = seed(&store, "wydm6", 50, 600).await;

        let mut req = request(&code, "wydm6");
        req.place_id = PlaceId::new("p2");
        let result = verify_qr(&store, &GeofencePolicy::default(), &req, Utc::now())
            .await
            .unwrap();
        assert_eq!(result.state, QrState::Invalid);

        // The token is still consumable at the right place.
        let ok = verify_qr(
            &store,
            &GeofencePolicy::default(),
            &request(&code, "wydm6"),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(ok.state, QrState::Success);
    }
}
