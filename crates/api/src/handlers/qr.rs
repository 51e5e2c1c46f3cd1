use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use visitproof_domain::model::{Geohash, PlaceId, UserId};
use visitproof_domain::policy;
use visitproof_domain::qr::{verify_qr, QrState, QrVerifyRequest};
use visitproof_domain::ratelimit::RateLimitStatus;

use crate::state::AppState;

use super::{enforce_rate_limit, idempotency_key, ApiError};

const ENDPOINT: &str = "verify_qr";

#[derive(Debug, Deserialize, Serialize)]
pub struct QrVerifyBody {
    pub code: String,
    pub place_id: String,
    pub user_id: String,
    pub user_geohash: String,
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrVerifyResponse {
    pub state: QrState,
    pub distance_m: Option<i32>,
    pub fail_reason: Option<String>,
    pub replayed: bool,
    pub rate_limit: RateLimitStatus,
}

pub async fn verify_qr_handler(
    state: web::Data<AppState>,
    request: HttpRequest,
    payload: web::Json<QrVerifyBody>,
) -> Result<HttpResponse, ApiError> {
    let place_id = PlaceId::parse(&payload.place_id)?;
    let user_id = UserId::parse(&payload.user_id)?;
    let user_geohash = Geohash::parse(&payload.user_geohash)?;

    let rate_limit = enforce_rate_limit(&state, ENDPOINT, user_id.as_str()).await?;
    let key = idempotency_key(&request, ENDPOINT)?;

    let verify_request = QrVerifyRequest {
        code: payload.code.clone(),
        place_id: place_id.clone(),
        user_id: user_id.clone(),
        user_geohash,
        accuracy_m: payload.accuracy_m,
    };

    let outcome = state
        .idempotency()
        .run(&key, || async {
            let verification =
                verify_qr(state.storage(), state.geofence(), &verify_request, Utc::now())
                    .await
                    .map_err(ApiError::from)?;

            // A fresh success may complete the visit proof; hand the reward
            // off right away instead of waiting for a status poll.
            if verification.state == QrState::Success {
                policy::evaluate(state.storage(), &user_id, &place_id, Utc::now()).await?;
            }

            Ok::<_, ApiError>(QrVerifyResponse {
                state: verification.state,
                distance_m: verification.distance_m,
                fail_reason: verification.fail_reason,
                replayed: verification.replayed,
                rate_limit,
            })
        })
        .await?;

    Ok(HttpResponse::Ok().json(outcome.value))
}
