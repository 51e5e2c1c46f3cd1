use actix_web::{web, HttpResponse};
use chrono::Utc;

use visitproof_domain::model::{PlaceId, UserId};
use visitproof_domain::policy;

use crate::state::AppState;

use super::ApiError;

/// Reports the combined verification state for a `(place, user)` pair.
/// Evaluation re-checks the policy and enqueues settlement when the visit
/// is fully proven; duplicates collapse on the derived job key, so polling
/// this endpoint never double-pays.
pub async fn verification_status_handler(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (place_id, user_id) = path.into_inner();
    let place_id = PlaceId::parse(&place_id)?;
    let user_id = UserId::parse(&user_id)?;

    let outcome = policy::evaluate(state.storage(), &user_id, &place_id, Utc::now()).await?;
    Ok(HttpResponse::Ok().json(outcome))
}
