use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use visitproof_domain::model::{MediaUrl, OcrData, PlaceId, UserId};
use visitproof_domain::policy;
use visitproof_domain::ratelimit::RateLimitStatus;
use visitproof_domain::receipt::{verify_receipt, ReceiptState, ReceiptVerifyRequest};

use crate::state::AppState;

use super::{enforce_rate_limit, idempotency_key, ApiError};

const ENDPOINT: &str = "verify_receipt";

#[derive(Debug, Deserialize, Serialize)]
pub struct ReceiptVerifyBody {
    pub user_id: String,
    pub place_id: String,
    pub media_url: String,
    pub expected_total: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptVerifyResponse {
    pub state: ReceiptState,
    pub ocr_data: Option<OcrData>,
    pub confidence: Option<f64>,
    pub validation_errors: Vec<String>,
    pub replayed: bool,
    pub rate_limit: RateLimitStatus,
}

pub async fn verify_receipt_handler(
    state: web::Data<AppState>,
    request: HttpRequest,
    payload: web::Json<ReceiptVerifyBody>,
) -> Result<HttpResponse, ApiError> {
    let user_id = UserId::parse(&payload.user_id)?;
    let place_id = PlaceId::parse(&payload.place_id)?;
    let media_url = MediaUrl::parse(&payload.media_url)?;

    let rate_limit = enforce_rate_limit(&state, ENDPOINT, user_id.as_str()).await?;
    let key = idempotency_key(&request, ENDPOINT)?;

    let verify_request = ReceiptVerifyRequest {
        user_id: user_id.clone(),
        place_id: place_id.clone(),
        media_url,
        expected_total: payload.expected_total,
    };

    let outcome = state
        .idempotency()
        .run(&key, || async {
            let verification = verify_receipt(
                state.storage(),
                state.ocr(),
                state.receipt_policy(),
                &verify_request,
                Utc::now(),
            )
            .await?;

            if verification.state == ReceiptState::Completed {
                policy::evaluate(state.storage(), &user_id, &place_id, Utc::now()).await?;
            }

            Ok::<_, ApiError>(ReceiptVerifyResponse {
                state: verification.state,
                ocr_data: verification.ocr_data,
                confidence: verification.confidence,
                validation_errors: verification.validation_errors,
                replayed: verification.replayed,
                rate_limit,
            })
        })
        .await?;

    Ok(HttpResponse::Ok().json(outcome.value))
}
