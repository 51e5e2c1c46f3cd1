//! The combined verification decision and the settlement hand-off.
//!
//! Location proof is mandatory and at least one of the two stronger proofs
//! must also hold: GPS alone is spoofable, and QR/receipt alone carry no
//! presence proof. The policy check is the unique settlement trigger point;
//! re-evaluations are harmless because duplicate enqueues collapse on the
//! derived idempotency key.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{derive_settlement_key, PlaceId, SettlementPayload, UserId};
use crate::storage::{PlaceStore, SettlementStore, StorageError, VerificationStore};

/// Pure decision function: `allowed = gps && (qr || receipt)`.
pub fn is_allowed(gps_ok: bool, qr_ok: bool, receipt_ok: bool) -> bool {
    gps_ok && (qr_ok || receipt_ok)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub allowed: bool,
    pub gps_ok: bool,
    pub qr_ok: bool,
    pub receipt_ok: bool,
    /// True when this evaluation durably queued a new settlement job.
    pub settlement_enqueued: bool,
}

/// Evaluates the stored signals for `(user, place)` and, when the visit is
/// fully proven, hands the reward off to the settlement queue.
pub async fn evaluate<S>(
    store: &S,
    user_id: &UserId,
    place_id: &PlaceId,
    now: DateTime<Utc>,
) -> Result<PolicyOutcome, StorageError>
where
    S: VerificationStore + PlaceStore + SettlementStore,
{
    let verification = store.find_verification(user_id, place_id).await?;
    let (gps_ok, qr_ok, receipt_ok) = verification
        .map(|v| (v.gps_ok, v.qr_ok, v.receipt_ok))
        .unwrap_or((false, false, false));

    let allowed = is_allowed(gps_ok, qr_ok, receipt_ok);
    if !allowed {
        counter!("policy_checks_total", 1, "allowed" => "false");
        return Ok(PolicyOutcome {
            allowed,
            gps_ok,
            qr_ok,
            receipt_ok,
            settlement_enqueued: false,
        });
    }
    counter!("policy_checks_total", 1, "allowed" => "true");

    let Some(place) = store.find_place(place_id).await? else {
        // Proven visit to a place that has since been deregistered; nothing
        // to pay out against.
        warn!(place_id = place_id.as_str(), "allowed verification for unknown place");
        return Ok(PolicyOutcome {
            allowed,
            gps_ok,
            qr_ok,
            receipt_ok,
            settlement_enqueued: false,
        });
    };

    let key = derive_settlement_key(user_id, place_id, &place.mission_id, place.reward_amount);
    let payload = SettlementPayload {
        user_id: user_id.clone(),
        place_id: place_id.clone(),
        mission_id: place.mission_id.clone(),
        amount: place.reward_amount,
    };

    let enqueued = store.enqueue(&key, &payload, now).await?;
    if enqueued {
        counter!("settlement_enqueued_total", 1, "result" => "queued");
        info!(
            user_id = user_id.as_str(),
            place_id = place_id.as_str(),
            amount = place.reward_amount,
            "settlement job queued"
        );
    } else {
        counter!("settlement_enqueued_total", 1, "result" => "duplicate");
    }

    Ok(PolicyOutcome {
        allowed,
        gps_ok,
        qr_ok,
        receipt_ok,
        settlement_enqueued: enqueued,
    })
}
